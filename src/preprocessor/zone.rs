//! Per-width rolling zone aggregation.
//!
//! Each `ZoneTracker` owns one tick-width's worth of zone centers. Trades
//! are assigned to a center by rounding to the nearest multiple of
//! `width_ticks * tick_size`; the zone's half-width is carried 50% wider
//! than that nominal spacing so a trade landing exactly on a rounding
//! boundary is still unambiguously covered by its assigned zone (see the
//! teacher's `HftBookCache` comment on float-boundary snapping for the same
//! concern applied to price levels).

use std::collections::HashMap;

use crate::financial_math::{self, Price};
use crate::orderbook::OrderBook;
use crate::rolling_window::RollingWindow;

const ZONE_HALF_WIDTH_EXPANSION: f64 = 1.5;

#[derive(Debug, Clone, Copy)]
struct TradeSample {
    timestamp_ms: u64,
    qty: f64,
    is_buy: bool,
}

struct ZoneState {
    trades: RollingWindow<TradeSample>,
    last_update_ms: u64,
}

impl ZoneState {
    fn new(zone_window_ms: u64, max_samples: usize) -> Self {
        Self { trades: RollingWindow::new(zone_window_ms, max_samples), last_update_ms: 0 }
    }
}

/// A single zone's current rolling state, as exposed to detectors.
#[derive(Debug, Clone)]
pub struct ZoneSnapshot {
    pub center: Price,
    pub width_ticks: u32,
    pub aggressive_buy_volume: f64,
    pub aggressive_sell_volume: f64,
    pub passive_volume: f64,
    pub trade_count: u64,
    /// Directional buy fraction of aggressive volume, in `[0, 1]`: `0.5` is
    /// perfectly balanced, `1.0` is entirely aggressive buying, `0.0` is
    /// entirely aggressive selling.
    pub strength: f64,
    pub last_update_ms: u64,
}

pub struct ZoneTracker {
    width_ticks: u32,
    width_price: f64,
    half_width_price: f64,
    zone_window_ms: u64,
    max_zones: usize,
    max_samples: usize,
    zones: HashMap<Price, ZoneState>,
}

impl ZoneTracker {
    pub fn new(width_ticks: u32, tick_size: f64, zone_window_ms: u64, max_zones: usize, max_samples: usize) -> Self {
        let width_price = width_ticks as f64 * tick_size;
        Self {
            width_ticks,
            width_price,
            half_width_price: width_price / 2.0 * ZONE_HALF_WIDTH_EXPANSION,
            zone_window_ms,
            max_zones,
            max_samples,
            zones: HashMap::new(),
        }
    }

    fn center_for(&self, price: f64) -> Price {
        let snapped = financial_math::normalize_price_to_tick(price, self.width_price);
        Price::from_units(financial_math::price_to_int(snapped))
    }

    /// Record a trade, age out its zone's stale samples, evict the
    /// least-recently-updated zone if over capacity, then return the
    /// snapshot neighborhood within `confluence_max_distance` of the trade
    /// price (including the trade's own zone).
    pub fn record_trade(
        &mut self,
        price: f64,
        qty: f64,
        is_buy: bool,
        timestamp_ms: u64,
        book: &OrderBook,
        confluence_max_distance: f64,
    ) -> Vec<ZoneSnapshot> {
        let center = self.center_for(price);

        if !self.zones.contains_key(&center) && self.zones.len() >= self.max_zones {
            self.evict_lru();
        }

        let zone_window_ms = self.zone_window_ms;
        let max_samples = self.max_samples;
        let state = self.zones.entry(center).or_insert_with(|| ZoneState::new(zone_window_ms, max_samples));
        state.trades.push(timestamp_ms, TradeSample { timestamp_ms, qty, is_buy });
        state.last_update_ms = timestamp_ms;

        self.neighborhood(price, book, confluence_max_distance)
    }

    fn evict_lru(&mut self) {
        if let Some((&oldest, _)) = self.zones.iter().min_by_key(|(_, s)| s.last_update_ms) {
            self.zones.remove(&oldest);
        }
    }

    fn neighborhood(&self, trade_price: f64, book: &OrderBook, confluence_max_distance: f64) -> Vec<ZoneSnapshot> {
        let mut out: Vec<ZoneSnapshot> = self
            .zones
            .iter()
            .filter(|(center, _)| (center.to_f64() - trade_price).abs() <= confluence_max_distance)
            .map(|(&center, state)| self.snapshot_for(center, state, book))
            .collect();
        out.sort_by(|a, b| a.center.cmp(&b.center));
        out
    }

    fn snapshot_for(&self, center: Price, state: &ZoneState, book: &OrderBook) -> ZoneSnapshot {
        let mut buy_vol = 0.0;
        let mut sell_vol = 0.0;
        for sample in state.trades.values() {
            if sample.is_buy {
                buy_vol += sample.qty;
            } else {
                sell_vol += sample.qty;
            }
        }
        let aggressive_volume = buy_vol + sell_vol;
        let strength = buy_vol / (aggressive_volume + f64::EPSILON);

        let low = Price::from_units(financial_math::price_to_int(center.to_f64() - self.half_width_price));
        let high = Price::from_units(financial_math::price_to_int(center.to_f64() + self.half_width_price));
        let (bid_depth, ask_depth) = book.depth_range(low, high);

        ZoneSnapshot {
            center,
            width_ticks: self.width_ticks,
            aggressive_buy_volume: buy_vol,
            aggressive_sell_volume: sell_vol,
            passive_volume: bid_depth + ask_depth,
            trade_count: state.trades.len() as u64,
            strength,
            last_update_ms: state.last_update_ms,
        }
    }

    pub fn resident_zone_count(&self) -> usize {
        self.zones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{DepthDiff, OrderBook};

    fn book() -> OrderBook {
        OrderBook::new(0.01, 1_500, 5_000)
    }

    #[test]
    fn trade_always_lands_in_its_own_zone_neighborhood() {
        let b = book();
        let mut tracker = ZoneTracker::new(5, 0.01, 60_000, 10, 100);
        let snaps = tracker.record_trade(100.024, 1.0, true, 1, &b, 1.0);
        assert!(!snaps.is_empty());
        assert_eq!(tracker.resident_zone_count(), 1);
    }

    #[test]
    fn stale_samples_age_out() {
        let b = book();
        let mut tracker = ZoneTracker::new(5, 0.01, 1_000, 10, 100);
        tracker.record_trade(100.0, 1.0, true, 0, &b, 1.0);
        let snaps = tracker.record_trade(100.0, 1.0, true, 5_000, &b, 1.0);
        let snap = snaps.iter().find(|s| s.center.to_f64() == 100.0).unwrap();
        assert_eq!(snap.trade_count, 1);
    }

    #[test]
    fn lru_eviction_respects_max_zones() {
        let b = book();
        let mut tracker = ZoneTracker::new(5, 0.01, 60_000, 2, 100);
        tracker.record_trade(100.0, 1.0, true, 1, &b, 1.0);
        tracker.record_trade(200.0, 1.0, true, 2, &b, 1.0);
        tracker.record_trade(300.0, 1.0, true, 3, &b, 1.0);
        assert_eq!(tracker.resident_zone_count(), 2);
    }

    #[test]
    fn strength_is_balanced_when_two_sided() {
        let b = book();
        let mut tracker = ZoneTracker::new(5, 0.01, 60_000, 10, 100);
        tracker.record_trade(100.0, 1.0, true, 1, &b, 1.0);
        let snaps = tracker.record_trade(100.0, 1.0, false, 2, &b, 1.0);
        let snap = &snaps[0];
        assert!((snap.strength - 0.5).abs() < 1e-9);
    }
}
