//! Bounded object freelist.
//!
//! CVD window results and zone sample buffers are allocated at trade rate;
//! pooling them keeps the hot path's allocator pressure flat instead of
//! scaling with trade throughput. Mirrors the `parking_lot::Mutex`-guarded
//! state idiom the teacher uses off the hot path (e.g. its rolling history
//! buffers), just generalized to "any `Default`-able, `Reset`-able value".

use parking_lot::Mutex;

/// A value that can be cheaply returned to a pool after use.
pub trait Poolable: Default {
    /// Clear any accumulated state so the next checkout starts fresh.
    fn reset(&mut self);
}

/// Fixed-capacity freelist. Checkouts beyond `capacity` allocate normally
/// and are simply dropped on return rather than rejected — the bound
/// limits steady-state retained memory, not burst throughput.
pub struct Pool<T: Poolable> {
    capacity: usize,
    slots: Mutex<Vec<T>>,
}

/// A checked-out value. Returned to the pool on drop.
pub struct PooledItem<'a, T: Poolable> {
    pool: &'a Pool<T>,
    value: Option<T>,
}

impl<T: Poolable> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn checkout(&self) -> PooledItem<'_, T> {
        let value = self.slots.lock().pop().unwrap_or_default();
        PooledItem { pool: self, value: Some(value) }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, mut value: T) {
        let mut slots = self.slots.lock();
        if slots.len() < self.capacity {
            value.reset();
            slots.push(value);
        }
    }
}

impl<T: Poolable> std::ops::Deref for PooledItem<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("value taken only on drop")
    }
}

impl<T: Poolable> std::ops::DerefMut for PooledItem<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value taken only on drop")
    }
}

impl<T: Poolable> Drop for PooledItem<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        samples: Vec<f64>,
    }

    impl Poolable for Scratch {
        fn reset(&mut self) {
            self.samples.clear();
        }
    }

    #[test]
    fn reused_item_is_reset() {
        let pool: Pool<Scratch> = Pool::new(4);
        {
            let mut item = pool.checkout();
            item.samples.push(1.0);
            item.samples.push(2.0);
        }
        assert_eq!(pool.len(), 1);
        let item = pool.checkout();
        assert!(item.samples.is_empty());
    }

    #[test]
    fn excess_checkouts_do_not_exceed_capacity() {
        let pool: Pool<Scratch> = Pool::new(2);
        let items: Vec<_> = (0..5).map(|_| pool.checkout()).collect();
        drop(items);
        assert_eq!(pool.len(), 2);
    }
}
