//! Maintains best-bid/best-ask and per-price passive depth for both sides of
//! a single trading pair, updated by depth diffs.
//!
//! Mutated only by `apply_depth_diff`. Best-side lookup is O(log N) via a
//! `BTreeMap` keyed by price (grounded in the aggregated-depth-map pattern
//! used by `examples/other_examples/239a0fbd_ghovax-order-book` and the
//! sorted-snapshot shape of the teacher's `polymarket_book_store::BookSnapshot`).
//! The book emits no signals; its role is purely state.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::financial_math::Price;

/// A single price level's resting quantity on each side. At most one side is
/// expected to be non-zero in practice, but both are tracked since a given
/// price can in principle carry residual size on both sides momentarily.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthLevel {
    pub bid_qty: f64,
    pub ask_qty: f64,
}

/// Raw depth diff from the exchange. Either side may be zero, meaning "level
/// removed at that price".
#[derive(Debug, Clone, Copy)]
pub struct DepthDiff {
    pub price: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub timestamp_ms: u64,
}

struct Inner {
    levels: BTreeMap<Price, DepthLevel>,
    best_bid: Option<Price>,
    best_ask: Option<Price>,
    last_update_ms: u64,
    connected: bool,
    disconnected_at: Option<Instant>,
}

/// Book health: a stream-connection bit plus last-update age. While
/// disconnected, staleness timeouts are relaxed; on reconnect the caller is
/// expected to drive a full recovery (rebuild from an authoritative
/// snapshot) before resuming normal health checks.
pub struct OrderBook {
    tick_size: f64,
    max_stale_ms: u64,
    hard_stale_ms: u64,
    inner: RwLock<Inner>,
}

impl OrderBook {
    pub fn new(tick_size: f64, max_stale_ms: u64, hard_stale_ms: u64) -> Self {
        Self {
            tick_size,
            max_stale_ms,
            hard_stale_ms,
            inner: RwLock::new(Inner {
                levels: BTreeMap::new(),
                best_bid: None,
                best_ask: None,
                last_update_ms: 0,
                connected: false,
                disconnected_at: None,
            }),
        }
    }

    /// Apply a depth diff. Malformed diffs (negative quantity) are discarded
    /// with a logged warning. An ask-below-bid inversion after applying the
    /// diff is reported via the returned fault so the caller can raise a
    /// book-recovery request to the external stream collaborator — the book
    /// itself still applies the update so callers can inspect the crossed
    /// state if useful for diagnostics.
    pub fn apply_depth_diff(&self, diff: DepthDiff) -> Result<(), CoreError> {
        if diff.bid_qty < 0.0 || diff.ask_qty < 0.0 {
            warn!(price = diff.price, "discarding depth diff with negative quantity");
            return Err(CoreError::Validation(format!("negative quantity in depth diff at price {}", diff.price)));
        }

        let price = Price::from_units(crate::financial_math::price_to_int(
            crate::financial_math::normalize_price_to_tick(diff.price, self.tick_size),
        ));

        let mut inner = self.inner.write();
        if diff.bid_qty == 0.0 && diff.ask_qty == 0.0 {
            inner.levels.remove(&price);
        } else {
            let level = inner.levels.entry(price).or_default();
            level.bid_qty = diff.bid_qty;
            level.ask_qty = diff.ask_qty;
        }

        inner.best_bid = inner
            .levels
            .iter()
            .rev()
            .find(|(_, l)| l.bid_qty > 0.0)
            .map(|(p, _)| *p);
        inner.best_ask = inner
            .levels
            .iter()
            .find(|(_, l)| l.ask_qty > 0.0)
            .map(|(p, _)| *p);
        inner.last_update_ms = diff.timestamp_ms;

        if let (Some(bid), Some(ask)) = (inner.best_bid, inner.best_ask) {
            if bid >= ask {
                warn!(
                    bid = bid.to_f64(),
                    ask = ask.to_f64(),
                    "book inversion detected, recovery requested"
                );
                return Err(CoreError::BookConsistency(format!("bid {} >= ask {}", bid.to_f64(), ask.to_f64())));
            }
        }
        debug!(price = diff.price, "depth diff applied");
        Ok(())
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.inner.read().best_bid
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.inner.read().best_ask
    }

    pub fn spread(&self) -> Option<Price> {
        let inner = self.inner.read();
        match (inner.best_bid, inner.best_ask) {
            (Some(bid), Some(ask)) => crate::financial_math::calculate_spread(ask, bid),
            _ => None,
        }
    }

    pub fn mid(&self) -> Option<Price> {
        let inner = self.inner.read();
        match (inner.best_bid, inner.best_ask) {
            (Some(bid), Some(ask)) => Some(crate::financial_math::calculate_mid(bid, ask)),
            _ => None,
        }
    }

    /// Resting (bid, ask) quantity at an exact price. `(0.0, 0.0)` if the
    /// level has no resting depth or does not exist.
    pub fn depth_at(&self, price: Price) -> (f64, f64) {
        self.inner
            .read()
            .levels
            .get(&price)
            .map(|l| (l.bid_qty, l.ask_qty))
            .unwrap_or((0.0, 0.0))
    }

    /// Sum of passive quantity (bid, ask) across an inclusive price range —
    /// used by the preprocessor to compute a zone's passive volume.
    pub fn depth_range(&self, low: Price, high: Price) -> (f64, f64) {
        let inner = self.inner.read();
        inner
            .levels
            .range(low..=high)
            .fold((0.0, 0.0), |(b, a), (_, l)| (b + l.bid_qty, a + l.ask_qty))
    }

    pub fn last_update(&self) -> u64 {
        self.inner.read().last_update_ms
    }

    /// Healthy if connected and the last update is within `max_stale_ms`
    /// (relaxed to `hard_stale_ms` while disconnected, since staleness
    /// during an expected outage is not itself an anomaly).
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        let inner = self.inner.read();
        if inner.last_update_ms == 0 {
            return false;
        }
        let age_ms = now_ms.saturating_sub(inner.last_update_ms);
        let threshold = if inner.connected {
            self.max_stale_ms
        } else {
            self.hard_stale_ms
        };
        age_ms <= threshold
    }

    pub fn on_stream_connected(&self) {
        let mut inner = self.inner.write();
        inner.connected = true;
        inner.disconnected_at = None;
        debug!("order book stream connected");
    }

    /// Mark the book disconnected. Health checks relax to `hard_stale_ms`
    /// until a reconnect drives a full recovery.
    pub fn on_stream_disconnected(&self, reason: &str) {
        let mut inner = self.inner.write();
        inner.connected = false;
        inner.disconnected_at = Some(Instant::now());
        warn!(reason, "order book stream disconnected");
    }

    pub fn disconnected_duration(&self) -> Option<Duration> {
        self.inner.read().disconnected_at.map(|t| t.elapsed())
    }

    /// Rebuild from an authoritative snapshot (full recovery after
    /// reconnect). Replaces all levels and recomputes best bid/ask.
    pub fn recover_from_snapshot(&self, levels: Vec<(f64, f64, f64)>, now_ms: u64) {
        let mut inner = self.inner.write();
        inner.levels.clear();
        for (price, bid_qty, ask_qty) in levels {
            if bid_qty < 0.0 || ask_qty < 0.0 {
                continue;
            }
            let p = Price::from_units(crate::financial_math::price_to_int(
                crate::financial_math::normalize_price_to_tick(price, self.tick_size),
            ));
            inner.levels.insert(p, DepthLevel { bid_qty, ask_qty });
        }
        inner.best_bid = inner
            .levels
            .iter()
            .rev()
            .find(|(_, l)| l.bid_qty > 0.0)
            .map(|(p, _)| *p);
        inner.best_ask = inner
            .levels
            .iter()
            .find(|(_, l)| l.ask_qty > 0.0)
            .map(|(p, _)| *p);
        inner.last_update_ms = now_ms;
        debug!(levels = inner.levels.len(), "order book recovered from snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        OrderBook::new(0.01, 1_500, 5_000)
    }

    #[test]
    fn applies_diffs_and_tracks_best_side() {
        let b = book();
        b.apply_depth_diff(DepthDiff { price: 100.0, bid_qty: 5.0, ask_qty: 0.0, timestamp_ms: 1 })
            .unwrap();
        b.apply_depth_diff(DepthDiff { price: 100.02, bid_qty: 0.0, ask_qty: 3.0, timestamp_ms: 2 })
            .unwrap();
        assert_eq!(b.best_bid().unwrap().to_f64(), 100.0);
        assert_eq!(b.best_ask().unwrap().to_f64(), 100.02);
        assert!(b.spread().unwrap().to_f64() > 0.0);
    }

    #[test]
    fn removes_level_when_both_sides_zero() {
        let b = book();
        b.apply_depth_diff(DepthDiff { price: 100.0, bid_qty: 5.0, ask_qty: 0.0, timestamp_ms: 1 })
            .unwrap();
        b.apply_depth_diff(DepthDiff { price: 100.0, bid_qty: 0.0, ask_qty: 0.0, timestamp_ms: 2 })
            .unwrap();
        assert!(b.best_bid().is_none());
    }

    #[test]
    fn rejects_negative_quantity() {
        let b = book();
        let res = b.apply_depth_diff(DepthDiff { price: 100.0, bid_qty: -1.0, ask_qty: 0.0, timestamp_ms: 1 });
        assert!(matches!(res, Err(CoreError::Validation(_))));
        assert!(b.best_bid().is_none());
    }

    #[test]
    fn detects_inversion() {
        let b = book();
        b.apply_depth_diff(DepthDiff { price: 100.0, bid_qty: 5.0, ask_qty: 0.0, timestamp_ms: 1 })
            .unwrap();
        let res = b.apply_depth_diff(DepthDiff { price: 99.0, bid_qty: 0.0, ask_qty: 3.0, timestamp_ms: 2 });
        assert!(matches!(res, Err(CoreError::BookConsistency(_))));
    }

    #[test]
    fn health_relaxes_while_disconnected() {
        let b = book();
        b.apply_depth_diff(DepthDiff { price: 100.0, bid_qty: 5.0, ask_qty: 0.0, timestamp_ms: 1_000 })
            .unwrap();
        b.on_stream_connected();
        assert!(b.is_healthy(2_000));
        assert!(!b.is_healthy(10_000));
        b.on_stream_disconnected("test");
        assert!(b.is_healthy(5_000));
    }

    #[test]
    fn depth_range_sums_levels() {
        let b = book();
        b.apply_depth_diff(DepthDiff { price: 100.00, bid_qty: 5.0, ask_qty: 0.0, timestamp_ms: 1 })
            .unwrap();
        b.apply_depth_diff(DepthDiff { price: 100.01, bid_qty: 2.0, ask_qty: 0.0, timestamp_ms: 2 })
            .unwrap();
        let low = Price::from_units(crate::financial_math::price_to_int(99.0));
        let high = Price::from_units(crate::financial_math::price_to_int(101.0));
        let (bid, _ask) = b.depth_range(low, high);
        assert_eq!(bid, 7.0);
    }
}
