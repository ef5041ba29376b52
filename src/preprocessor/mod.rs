//! Trade enrichment: attaches book context and multi-timeframe zone state to
//! each incoming aggregated trade.
//!
//! Owns the order book (read-write) and the three zone trackers. Detectors
//! never touch the book or zone maps directly — they consume `EnrichedTrade`
//! only, which keeps the concurrency story simple: one writer (this module)
//! per pair.

mod zone;

pub use zone::ZoneSnapshot;

use parking_lot::Mutex;

use crate::config::GlobalSettings;
use crate::error::CoreError;
use crate::financial_math::{self, Price};
use crate::orderbook::{DepthDiff, OrderBook};
use zone::ZoneTracker;

/// Raw aggregated trade from the exchange feed.
#[derive(Debug, Clone, Copy)]
pub struct AggTrade {
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub timestamp_ms: u64,
    /// Exchange convention: `true` means the resting side was the buyer, so
    /// the trade's aggressor was the seller.
    pub buyer_is_maker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggressor {
    Buy,
    Sell,
}

/// Zone neighborhoods at the three configured tick-widths, in the same
/// order as `GlobalSettings::zone_widths`.
#[derive(Debug, Clone, Default)]
pub struct StandardZoneData {
    pub zones_5_tick: Vec<ZoneSnapshot>,
    pub zones_10_tick: Vec<ZoneSnapshot>,
    pub zones_20_tick: Vec<ZoneSnapshot>,
}

/// A trade plus everything a detector needs to evaluate it: book context,
/// derived microstructure fields, and the zone neighborhood at each width.
#[derive(Debug, Clone)]
pub struct EnrichedTrade {
    pub trade: AggTrade,
    pub aggressor: Aggressor,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub mid_price: Option<Price>,
    pub spread: Option<Price>,
    pub passive_bid_at_price: f64,
    pub passive_ask_at_price: f64,
    /// Signed trade quantity: positive for buy-aggressor, negative for
    /// sell-aggressor.
    pub delta: f64,
    /// Running sum of `delta` since the preprocessor was constructed.
    pub accumulated_delta: f64,
    /// Top-of-book `(bid_depth - ask_depth) / (bid_depth + ask_depth)`.
    /// `None` when either side of the book is empty.
    pub imbalance: Option<f64>,
    pub zone_data: StandardZoneData,
}

pub struct OrderFlowPreprocessor {
    book: OrderBook,
    tick_size: f64,
    confluence_max_distance: f64,
    trackers: Mutex<[ZoneTracker; 3]>,
    accumulated_delta: Mutex<f64>,
}

impl OrderFlowPreprocessor {
    pub fn new(global: &GlobalSettings, max_stale_ms: u64, hard_stale_ms: u64) -> Self {
        assert_eq!(global.zone_widths.len(), 3, "GlobalSettings::validate guarantees exactly 3 widths");
        let make = |w: u32| {
            ZoneTracker::new(w, global.tick_size, global.zone_window_ms, global.max_zones, global.max_samples)
        };
        Self {
            book: OrderBook::new(global.tick_size, max_stale_ms, hard_stale_ms),
            tick_size: global.tick_size,
            confluence_max_distance: global.confluence_max_distance,
            trackers: Mutex::new([make(global.zone_widths[0]), make(global.zone_widths[1]), make(global.zone_widths[2])]),
            accumulated_delta: Mutex::new(0.0),
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn on_depth_diff(&self, diff: DepthDiff) -> Result<(), CoreError> {
        self.book.apply_depth_diff(diff)
    }

    /// Enrich a trade with book context and zone state. Returns `None` for
    /// a trade with a non-finite or non-positive price/quantity — never a
    /// fabricated fallback.
    pub fn on_agg_trade(&self, trade: AggTrade) -> Option<EnrichedTrade> {
        if !financial_math::is_valid_price(trade.price) || !financial_math::is_valid_quantity(trade.quantity) {
            return None;
        }

        let aggressor = if trade.buyer_is_maker { Aggressor::Sell } else { Aggressor::Buy };
        let delta = match aggressor {
            Aggressor::Buy => trade.quantity,
            Aggressor::Sell => -trade.quantity,
        };
        let accumulated_delta = {
            let mut acc = self.accumulated_delta.lock();
            *acc += delta;
            *acc
        };

        let best_bid = self.book.best_bid();
        let best_ask = self.book.best_ask();
        let mid_price = self.book.mid();
        let spread = self.book.spread();

        let trade_price_level = Price::from_units(financial_math::price_to_int(
            financial_math::normalize_price_to_tick(trade.price, self.tick_size),
        ));
        let (passive_bid_at_price, passive_ask_at_price) = self.book.depth_at(trade_price_level);

        let imbalance = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => {
                let (bid_depth, _) = self.book.depth_at(bid);
                let (_, ask_depth) = self.book.depth_at(ask);
                let total = bid_depth + ask_depth;
                if total > 0.0 {
                    Some((bid_depth - ask_depth) / total)
                } else {
                    None
                }
            }
            _ => None,
        };

        let is_buy = aggressor == Aggressor::Buy;
        let mut trackers = self.trackers.lock();
        let zones_5_tick = trackers[0].record_trade(
            trade.price,
            trade.quantity,
            is_buy,
            trade.timestamp_ms,
            &self.book,
            self.confluence_max_distance,
        );
        let zones_10_tick = trackers[1].record_trade(
            trade.price,
            trade.quantity,
            is_buy,
            trade.timestamp_ms,
            &self.book,
            self.confluence_max_distance,
        );
        let zones_20_tick = trackers[2].record_trade(
            trade.price,
            trade.quantity,
            is_buy,
            trade.timestamp_ms,
            &self.book,
            self.confluence_max_distance,
        );
        drop(trackers);

        Some(EnrichedTrade {
            trade,
            aggressor,
            best_bid,
            best_ask,
            mid_price,
            spread,
            passive_bid_at_price,
            passive_ask_at_price,
            delta,
            accumulated_delta,
            imbalance,
            zone_data: StandardZoneData { zones_5_tick, zones_10_tick, zones_20_tick },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    fn trade(price: f64, qty: f64, buyer_is_maker: bool, ts: u64) -> AggTrade {
        AggTrade { trade_id: ts, price, quantity: qty, timestamp_ms: ts, buyer_is_maker }
    }

    #[test]
    fn invalid_trade_yields_none() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        assert!(pre.on_agg_trade(trade(-1.0, 1.0, false, 1)).is_none());
        assert!(pre.on_agg_trade(trade(100.0, 0.0, false, 1)).is_none());
    }

    #[test]
    fn accumulated_delta_tracks_signed_sum() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let first = pre.on_agg_trade(trade(100.0, 2.0, false, 1)).unwrap();
        assert_eq!(first.aggressor, Aggressor::Buy);
        assert_eq!(first.accumulated_delta, 2.0);
        let second = pre.on_agg_trade(trade(100.0, 1.0, true, 2)).unwrap();
        assert_eq!(second.aggressor, Aggressor::Sell);
        assert_eq!(second.accumulated_delta, 1.0);
    }

    #[test]
    fn imbalance_none_without_both_book_sides() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let enriched = pre.on_agg_trade(trade(100.0, 1.0, false, 1)).unwrap();
        assert!(enriched.imbalance.is_none());
    }

    #[test]
    fn zone_data_populated_at_all_three_widths() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let enriched = pre.on_agg_trade(trade(100.0, 1.0, false, 1)).unwrap();
        assert!(!enriched.zone_data.zones_5_tick.is_empty());
        assert!(!enriched.zone_data.zones_10_tick.is_empty());
        assert!(!enriched.zone_data.zones_20_tick.is_empty());
    }

    #[test]
    fn depth_diffs_forward_to_book() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        pre.on_depth_diff(crate::orderbook::DepthDiff { price: 100.0, bid_qty: 5.0, ask_qty: 0.0, timestamp_ms: 1 })
            .unwrap();
        assert_eq!(pre.book().best_bid().unwrap().to_f64(), 100.0);
    }
}
