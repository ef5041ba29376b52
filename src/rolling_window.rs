//! Bounded, timestamped sample history shared by detector and preprocessor
//! state: zone trade history, per-window CVD accumulators, and the sample
//! populations behind `detectors::AdaptiveThresholds`.
//!
//! Eviction is by age first, then by capacity, mirroring the ad hoc
//! `VecDeque` pruning pattern used throughout `preprocessor/zone.rs` and
//! `detectors/cvd.rs` before it was pulled out into one shared type.

use std::collections::VecDeque;

/// A bounded sequence of `(timestamp_ms, value)` samples. Timestamps are
/// assumed monotone non-decreasing across `push` calls, matching the
/// in-order trade stream the pipeline guarantees end to end.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    samples: VecDeque<(u64, T)>,
    max_age_ms: u64,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn new(max_age_ms: u64, capacity: usize) -> Self {
        Self { samples: VecDeque::new(), max_age_ms, capacity }
    }

    /// Age out samples older than `max_age_ms` relative to `now_ms`, then
    /// push the new sample, evicting the oldest if still over capacity.
    pub fn push(&mut self, now_ms: u64, value: T) {
        self.evict(now_ms);
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((now_ms, value));
    }

    /// Age out samples older than `max_age_ms` relative to `now_ms` without
    /// inserting anything.
    pub fn evict(&mut self, now_ms: u64) {
        while let Some(&(ts, _)) = self.samples.front() {
            if now_ms.saturating_sub(ts) > self.max_age_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, T)> {
        self.samples.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.samples.iter().map(|(_, v)| v)
    }

    /// Sum of values within `window_ms` of `now_ms`. Used by callers that
    /// need a sub-window of the full retained history (e.g. CVD's several
    /// window sizes sharing one raw-delta `RollingWindow`).
    pub fn windowed_sum(&self, now_ms: u64, window_ms: u64) -> T
    where
        T: Copy + std::iter::Sum,
    {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.samples.iter().filter(|(ts, _)| *ts >= cutoff).map(|(_, v)| *v).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_by_age_before_inserting() {
        let mut w: RollingWindow<f64> = RollingWindow::new(100, 10);
        w.push(0, 1.0);
        w.push(50, 2.0);
        w.push(250, 3.0);
        assert_eq!(w.len(), 1);
        assert_eq!(w.values().copied().collect::<Vec<_>>(), vec![3.0]);
    }

    #[test]
    fn evicts_by_capacity_when_still_fresh() {
        let mut w: RollingWindow<f64> = RollingWindow::new(1_000_000, 2);
        w.push(0, 1.0);
        w.push(1, 2.0);
        w.push(2, 3.0);
        assert_eq!(w.len(), 2);
        assert_eq!(w.values().copied().collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn windowed_sum_only_counts_recent_samples() {
        let mut w: RollingWindow<f64> = RollingWindow::new(1_000_000, 100);
        w.push(0, 1.0);
        w.push(500, 2.0);
        w.push(1_000, 3.0);
        assert_eq!(w.windowed_sum(1_000, 600), 5.0);
    }
}
