//! Liquidity absorption detector.
//!
//! Absorption: a large aggressive order (or run of them) hits one side of
//! the book, the resting liquidity on that side depletes and then refills
//! without the price breaking through it. Repeated depletion/refill cycles
//! at a stable level, paired with a price move smaller than the trade
//! volume would otherwise justify, are evidence that a passive participant
//! is absorbing the flow rather than the level giving way.
//!
//! Grounded on the scanning shape of `rust-backend/src/signals/detector.rs`
//! (`SignalDetector`'s one-pattern-per-method style): each qualifying gate
//! is checked in sequence and a miss short-circuits to "no candidate",
//! never partial credit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::{AbsorptionSettings, EnhancementMode};
use crate::detectors::{next_sequence, CircuitBreaker, Cooldown, Detector, DetectorError, DetectorResult, DetectorStatus, Side};
use crate::financial_math::{self, Price};
use crate::metrics::PipelineMetrics;
use crate::preprocessor::{Aggressor, EnrichedTrade};

const MAX_RESIDENT_LEVELS: usize = 256;

struct LevelState {
    peak_passive: f64,
    depleted: bool,
    trough: f64,
    refill_events: u32,
    last_update_ms: u64,
}

impl LevelState {
    fn new(initial_passive: f64) -> Self {
        Self { peak_passive: initial_passive, depleted: false, trough: initial_passive, refill_events: 0, last_update_ms: 0 }
    }

    /// Feed a fresh passive-depth observation at this level; returns the
    /// confirmed refill-cycle count so far.
    fn observe(&mut self, current_passive: f64, depletion_fraction: f64, refill_fraction: f64, now_ms: u64) -> u32 {
        self.last_update_ms = now_ms;
        if !self.depleted {
            self.peak_passive = self.peak_passive.max(current_passive);
            if self.peak_passive > 0.0 && current_passive <= self.peak_passive * (1.0 - depletion_fraction) {
                self.depleted = true;
                self.trough = current_passive;
            }
        } else {
            let recovered = current_passive - self.trough;
            let span = (self.peak_passive - self.trough).max(0.0);
            if span > 0.0 && recovered >= span * refill_fraction {
                self.refill_events += 1;
                self.depleted = false;
                self.peak_passive = current_passive.max(self.peak_passive);
            }
        }
        self.refill_events
    }
}

pub struct AbsorptionDetector {
    settings: AbsorptionSettings,
    tick_size: f64,
    enhancement_mode: EnhancementMode,
    levels: Mutex<HashMap<Price, LevelState>>,
    cooldown: Cooldown,
    breaker: CircuitBreaker,
    metrics: Arc<PipelineMetrics>,
}

impl AbsorptionDetector {
    pub fn new(settings: AbsorptionSettings, tick_size: f64, enhancement_mode: EnhancementMode, metrics: Arc<PipelineMetrics>) -> Self {
        let cooldown = Cooldown::new(settings.event_cooldown_ms);
        let breaker = CircuitBreaker::new(settings.max_errors, settings.circuit_breaker_window_ms);
        Self { settings, tick_size, enhancement_mode, levels: Mutex::new(HashMap::new()), cooldown, breaker, metrics }
    }

    fn evict_if_needed(levels: &mut HashMap<Price, LevelState>) {
        if levels.len() > MAX_RESIDENT_LEVELS {
            if let Some((&oldest, _)) = levels.iter().min_by_key(|(_, s)| s.last_update_ms) {
                levels.remove(&oldest);
            }
        }
    }

    fn confluence_support(&self, trade: &EnrichedTrade, price: f64) -> (usize, f64) {
        let candidates = trade
            .zone_data
            .zones_5_tick
            .iter()
            .chain(trade.zone_data.zones_10_tick.iter())
            .chain(trade.zone_data.zones_20_tick.iter());
        let mut count = 0usize;
        let mut volume = 0.0;
        for zone in candidates {
            if (zone.center.to_f64() - price).abs() <= self.settings.confluence_max_distance {
                count += 1;
                volume += zone.aggressive_buy_volume + zone.aggressive_sell_volume;
            }
        }
        (count, volume)
    }
}

impl Detector for AbsorptionDetector {
    fn id(&self) -> &'static str {
        "absorption"
    }

    fn on_enriched_trade(&self, trade: &EnrichedTrade) -> DetectorResult {
        let now_ms = trade.trade.timestamp_ms;
        if self.breaker.is_open(now_ms) {
            return Err(DetectorError::CircuitOpen);
        }

        let (Some(_), Some(_)) = (trade.best_bid, trade.best_ask) else {
            self.breaker.record_error(now_ms);
            self.metrics.set_circuit_breaker_state(self.id(), self.breaker.gauge_state(now_ms));
            return Err(DetectorError::InsufficientData);
        };

        let result = (|| -> Vec<_> {
            let aggressive_volume = trade.trade.quantity;

            let passive = match trade.aggressor {
                Aggressor::Buy => trade.passive_ask_at_price,
                Aggressor::Sell => trade.passive_bid_at_price,
            };
            if passive <= 0.0 {
                return vec![];
            }
            let absorption_ratio = passive / aggressive_volume;
            if absorption_ratio < self.settings.min_ratio || absorption_ratio > self.settings.max_ratio {
                return vec![];
            }

            let price_units = crate::financial_math::price_to_int(
                crate::financial_math::normalize_price_to_tick(trade.trade.price, self.tick_size),
            );
            let level_price = Price::from_units(price_units);

            let refill_events = {
                let mut levels = self.levels.lock();
                let state = levels.entry(level_price).or_insert_with(|| LevelState::new(passive));
                let events = state.observe(passive, self.settings.depletion_fraction, self.settings.refill_fraction, now_ms);
                Self::evict_if_needed(&mut levels);
                events
            };
            if refill_events < self.settings.min_refill_events as u32 {
                return vec![];
            }

            let expected_movement = aggressive_volume * self.settings.expected_movement_scaling * self.tick_size;
            let actual_movement = trade.spread.map(|s| s.to_f64()).unwrap_or(self.tick_size);
            let efficiency_ratio = if expected_movement > 0.0 { actual_movement / expected_movement } else { 1.0 };
            if efficiency_ratio > self.settings.price_efficiency_threshold {
                return vec![];
            }
            let price_efficiency_score = (1.0 - efficiency_ratio).clamp(0.0, 1.0);

            let spread_score = match trade.spread {
                Some(spread) => (1.0 - spread.to_f64() / self.settings.spread_impact_threshold).clamp(0.0, 1.0),
                None => 0.0,
            };

            // Side determination (spec §4.4): B/S are in-zone aggressive
            // buy/sell volume, not the triggering trade's own direction —
            // a single late trade against the zone's net flow must not flip
            // the emitted side.
            let dominance_zone = trade
                .zone_data
                .zones_5_tick
                .iter()
                .find(|z| (z.center.to_f64() - trade.trade.price).abs() <= self.tick_size * 2.5);
            let Some(zone) = dominance_zone else {
                return vec![];
            };
            let zone_buy = zone.aggressive_buy_volume;
            let zone_sell = zone.aggressive_sell_volume;
            let zone_total = zone_buy + zone_sell;
            if zone_total <= 0.0 {
                return vec![];
            }
            let buy_ratio = zone_buy / zone_total;
            let side = if buy_ratio >= self.settings.dominance_threshold {
                Side::Sell
            } else if (1.0 - buy_ratio) >= self.settings.dominance_threshold {
                Side::Buy
            } else {
                return vec![];
            };
            let dominance = buy_ratio.max(1.0 - buy_ratio);

            let aggressive_score = (aggressive_volume / (self.settings.min_agg_volume * 2.0)).clamp(0.0, 1.0);
            let ratio_span = (self.settings.max_ratio - self.settings.min_ratio).max(1e-9);
            let ratio_score = ((absorption_ratio - self.settings.min_ratio) / ratio_span).clamp(0.0, 1.0);
            let refill_score = (refill_events as f64 / self.settings.min_refill_events.max(1) as f64).clamp(0.0, 1.0);

            let w = &self.settings.weights;
            let mut confidence = w.aggressive_volume * aggressive_score
                + w.absorption_ratio * ratio_score
                + w.passive_refill * refill_score
                + w.price_efficiency * price_efficiency_score
                + w.spread_impact * spread_score;

            let (zone_count, zone_volume) = self.confluence_support(trade, trade.trade.price);

            if self.enhancement_mode != EnhancementMode::Disabled {
                let mut enhancement_succeeded = false;

                if zone_count >= self.settings.confluence_min_zones {
                    confidence += self.settings.confluence_confidence_boost;
                    enhancement_succeeded = true;
                }

                let per_width_scores: Vec<f64> = [&trade.zone_data.zones_5_tick, &trade.zone_data.zones_10_tick, &trade.zone_data.zones_20_tick]
                    .into_iter()
                    .filter_map(|zones| {
                        zones
                            .iter()
                            .find(|z| (z.center.to_f64() - trade.trade.price).abs() <= self.settings.confluence_max_distance)
                            .map(|z| z.strength.max(1.0 - z.strength))
                    })
                    .collect();
                if let (Some(mean), Some(stddev)) = (financial_math::mean(&per_width_scores), financial_math::stddev(&per_width_scores)) {
                    if stddev <= self.settings.alignment_stddev_threshold && mean >= self.settings.alignment_mean_threshold {
                        confidence += self.settings.alignment_confidence_boost;
                        enhancement_succeeded = true;
                    }
                }

                self.metrics.record_enhancement_attempt(enhancement_succeeded);
            }
            confidence = confidence.clamp(0.0, 1.0);

            if confidence < self.settings.final_confidence_required {
                return vec![];
            }

            if self.settings.institutional_filter_enabled && self.enhancement_mode != EnhancementMode::Disabled {
                if zone_count < self.settings.confluence_min_zones {
                    return vec![];
                }
                let passes_volume = aggressive_volume >= self.settings.institutional_volume_threshold
                    || (zone_volume > 0.0 && aggressive_volume / zone_volume >= self.settings.institutional_volume_ratio_threshold);
                if !passes_volume {
                    return vec![];
                }
            }

            if !self.cooldown.try_fire(side, now_ms) {
                return vec![];
            }

            let mut details = HashMap::new();
            details.insert("absorption_ratio".to_string(), absorption_ratio);
            details.insert("refill_events".to_string(), refill_events as f64);
            details.insert("price_efficiency".to_string(), price_efficiency_score);
            details.insert("dominance".to_string(), dominance);

            vec![crate::detectors::SignalCandidate {
                id: Uuid::new_v4(),
                detector_id: "absorption",
                side,
                price: level_price,
                confidence,
                timestamp_ms: now_ms,
                details,
            }]
        })();

        self.breaker.record_success();
        self.metrics.set_circuit_breaker_state(self.id(), self.breaker.gauge_state(now_ms));
        let _ = next_sequence();
        Ok(result)
    }

    fn status(&self) -> DetectorStatus {
        self.breaker.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::preprocessor::{AggTrade, OrderFlowPreprocessor};

    fn detector() -> AbsorptionDetector {
        let settings = test_settings();
        AbsorptionDetector::new(settings.absorption, 0.01, EnhancementMode::Disabled, std::sync::Arc::new(crate::metrics::PipelineMetrics::new()))
    }

    fn trade(price: f64, qty: f64, buyer_is_maker: bool, ts: u64) -> AggTrade {
        AggTrade { trade_id: ts, price, quantity: qty, timestamp_ms: ts, buyer_is_maker }
    }

    #[test]
    fn returns_insufficient_data_without_both_book_sides() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let enriched = pre.on_agg_trade(trade(100.0, 200.0, false, 1)).unwrap();
        let det = detector();
        assert_eq!(det.on_enriched_trade(&enriched).unwrap_err(), DetectorError::InsufficientData);
    }

    #[test]
    fn small_trades_produce_no_candidate() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        pre.on_depth_diff(crate::orderbook::DepthDiff { price: 100.0, bid_qty: 10.0, ask_qty: 0.0, timestamp_ms: 0 }).unwrap();
        pre.on_depth_diff(crate::orderbook::DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 500.0, timestamp_ms: 0 }).unwrap();
        let enriched = pre.on_agg_trade(trade(100.01, 1.0, false, 1)).unwrap();
        let det = detector();
        let out = det.on_enriched_trade(&enriched).unwrap();
        assert!(out.is_empty());
    }
}
