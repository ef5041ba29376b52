//! Liquidity exhaustion detector.
//!
//! Exhaustion is absorption's mirror image: aggressive flow depletes one
//! side's resting liquidity and it does NOT refill. Where absorption
//! requires repeated depletion/refill cycles, exhaustion requires the
//! opposite — a run of trades against a side with no meaningful refill —
//! and reports it against the side actually giving out, not the aggressor.
//!
//! Circuit breaker and the consecutive-error counter are grounded on the
//! teacher's `DataSourceKillSwitch` (`rust-backend/src/main.rs`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::ExhaustionSettings;
use crate::detectors::{
    next_sequence, AdaptiveThresholds, CircuitBreaker, Cooldown, Detector, DetectorError, DetectorResult, DetectorStatus,
    DepletionCutoffs, PassiveCutoffs, Side,
};
use crate::financial_math::Price;
use crate::metrics::PipelineMetrics;
use crate::preprocessor::{Aggressor, EnrichedTrade};

/// How often `AdaptiveThresholds` recomputes its quantile cutoffs from
/// recent depletion/passive-ratio/confidence samples.
const ADAPTIVE_REFRESH_INTERVAL_MS: u64 = 60_000;

const MAX_RESIDENT_LEVELS: usize = 256;
const REFILL_EPSILON: f64 = 1.01;

struct LevelState {
    peak_passive: f64,
    last_passive: f64,
    last_update_ms: u64,
    ticks_since_refill: u32,
}

impl LevelState {
    fn new(initial_passive: f64, now_ms: u64) -> Self {
        Self { peak_passive: initial_passive, last_passive: initial_passive, last_update_ms: now_ms, ticks_since_refill: 0 }
    }

    /// Returns `(ticks_since_refill, velocity_per_ms)`.
    fn observe(&mut self, current_passive: f64, now_ms: u64) -> (u32, f64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_update_ms).max(1);
        let velocity = (self.last_passive - current_passive).max(0.0) / elapsed_ms as f64;

        if current_passive > self.last_passive * REFILL_EPSILON {
            self.ticks_since_refill = 0;
            self.peak_passive = self.peak_passive.max(current_passive);
        } else {
            self.ticks_since_refill += 1;
        }
        self.last_passive = current_passive;
        self.last_update_ms = now_ms;
        (self.ticks_since_refill, velocity)
    }
}

pub struct ExhaustionDetector {
    settings: ExhaustionSettings,
    tick_size: f64,
    levels: Mutex<HashMap<Price, LevelState>>,
    cooldown: Cooldown,
    breaker: CircuitBreaker,
    thresholds: AdaptiveThresholds,
    metrics: Arc<PipelineMetrics>,
}

impl ExhaustionDetector {
    pub fn new(settings: ExhaustionSettings, tick_size: f64, metrics: Arc<PipelineMetrics>) -> Self {
        let cooldown = Cooldown::new(settings.event_cooldown_ms);
        let breaker = CircuitBreaker::new(settings.max_errors, settings.circuit_breaker_window_ms);
        let thresholds = AdaptiveThresholds::new(
            DepletionCutoffs {
                moderate: settings.depletion_ratio_moderate,
                high: settings.depletion_ratio_high,
                extreme: settings.depletion_ratio_extreme,
            },
            PassiveCutoffs {
                some: settings.passive_ratio_some,
                moderate: settings.passive_ratio_moderate,
                severe: settings.passive_ratio_severe,
            },
            settings.final_confidence_required,
            ADAPTIVE_REFRESH_INTERVAL_MS,
        );
        Self { settings, tick_size, levels: Mutex::new(HashMap::new()), cooldown, breaker, thresholds, metrics }
    }

    fn evict_if_needed(levels: &mut HashMap<Price, LevelState>) {
        if levels.len() > MAX_RESIDENT_LEVELS {
            if let Some((&oldest, _)) = levels.iter().min_by_key(|(_, s)| s.last_update_ms) {
                levels.remove(&oldest);
            }
        }
    }
}

impl Detector for ExhaustionDetector {
    fn id(&self) -> &'static str {
        "exhaustion"
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

        let started = std::time::Instant::now();
        let candidates = (|| -> Vec<_> {
            let aggressive_volume = trade.trade.quantity;
            let current_passive = match trade.aggressor {
                Aggressor::Buy => trade.passive_ask_at_price,
                Aggressor::Sell => trade.passive_bid_at_price,
            };
            if current_passive <= 0.0 {
                return vec![];
            }

            let price_units = crate::financial_math::price_to_int(
                crate::financial_math::normalize_price_to_tick(trade.trade.price, self.tick_size),
            );
            let level_price = Price::from_units(price_units);

            let (ticks_since_refill, velocity) = {
                let mut levels = self.levels.lock();
                let state = levels.entry(level_price).or_insert_with(|| LevelState::new(current_passive, now_ms));
                let observed = state.observe(current_passive, now_ms);
                let peak = state.peak_passive;
                Self::evict_if_needed(&mut levels);
                (observed.0, observed.1.min(peak.max(1.0)))
            };

            let peak = {
                let levels = self.levels.lock();
                levels.get(&level_price).map(|s| s.peak_passive).unwrap_or(current_passive)
            };
            let depletion_ratio = aggressive_volume / current_passive.max(1e-9);
            let passive_ratio = current_passive / peak.max(1e-9);
            // Feed the adaptive-threshold population from every evaluated
            // trade, not just the ones that pass the gates below, so the
            // quantiles reflect actual market conditions rather than only
            // the tail that already cleared the old cutoffs.
            self.thresholds.record_ratios(depletion_ratio, passive_ratio, now_ms);

            let depletion_cutoffs = self.thresholds.depletion_cutoffs();
            if depletion_ratio < depletion_cutoffs.moderate {
                return vec![];
            }
            let depletion_score = if depletion_ratio >= depletion_cutoffs.extreme {
                1.0
            } else if depletion_ratio >= depletion_cutoffs.high {
                0.7
            } else {
                0.4
            };

            let passive_cutoffs = self.thresholds.passive_cutoffs();
            if passive_ratio > passive_cutoffs.some {
                return vec![];
            }
            let passive_score = if passive_ratio <= passive_cutoffs.severe {
                1.0
            } else if passive_ratio <= passive_cutoffs.moderate {
                0.6
            } else {
                0.3
            };

            let refill_gap_score = (ticks_since_refill as f64 / 5.0).clamp(0.0, 1.0);

            let imbalance_score = match trade.imbalance {
                Some(imbalance) => {
                    let magnitude = imbalance.abs();
                    if magnitude >= self.settings.imbalance_high_threshold {
                        1.0
                    } else if magnitude >= self.settings.imbalance_medium_threshold {
                        0.5
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };

            let spread_score = if self.settings.spread_adjustment_enabled {
                match trade.spread {
                    Some(spread) => {
                        let s = spread.to_f64();
                        if s >= self.settings.spread_high_threshold {
                            1.0
                        } else if s >= self.settings.spread_medium_threshold {
                            0.5
                        } else {
                            0.0
                        }
                    }
                    None => 0.0,
                }
            } else {
                0.0
            };

            let velocity_score = if self.settings.volume_velocity_enabled {
                (velocity * 1000.0 / current_passive.max(1.0)).clamp(0.0, 1.0)
            } else {
                0.0
            };

            let w = &self.settings.weights;
            let confidence = w.depletion_ratio * depletion_score
                + w.passive_ratio * passive_score
                + w.refill_gap * refill_gap_score
                + w.imbalance * imbalance_score
                + w.spread * spread_score
                + w.passive_velocity * velocity_score;

            self.thresholds.record_confidence(confidence, now_ms);
            if confidence < self.thresholds.min_confidence() {
                return vec![];
            }

            // Report against the side actually giving out, not the
            // aggressor: an emptying ask is reported as the ask (sell) side
            // exhausting, regardless of which side initiated the trades.
            let side = match trade.aggressor {
                Aggressor::Buy => Side::Sell,
                Aggressor::Sell => Side::Buy,
            };
            if !self.cooldown.try_fire(side, now_ms) {
                return vec![];
            }

            let mut details = HashMap::new();
            details.insert("depletion_ratio".to_string(), depletion_ratio);
            details.insert("passive_ratio".to_string(), passive_ratio);
            details.insert("ticks_since_refill".to_string(), ticks_since_refill as f64);

            vec![crate::detectors::SignalCandidate {
                id: Uuid::new_v4(),
                detector_id: "exhaustion",
                side,
                price: level_price,
                confidence,
                timestamp_ms: now_ms,
                details,
            }]
        })();

        // Per-trade watchdog: a detector that blows its deadline counts as
        // an error for circuit-breaker purposes even though it did produce
        // a (late) result — `on_enriched_trade` has no cancellation, so this
        // is bookkeeping after the fact, not preemption.
        if started.elapsed().as_millis() as u64 > self.settings.detector_deadline_ms {
            self.breaker.record_error(now_ms);
        } else {
            self.breaker.record_success();
        }
        self.metrics.set_circuit_breaker_state(self.id(), self.breaker.gauge_state(now_ms));
        let _ = next_sequence();
        Ok(candidates)
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

    fn trade(price: f64, qty: f64, buyer_is_maker: bool, ts: u64) -> AggTrade {
        AggTrade { trade_id: ts, price, quantity: qty, timestamp_ms: ts, buyer_is_maker }
    }

    #[test]
    fn healthy_passive_depth_yields_no_candidate() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        pre.on_depth_diff(crate::orderbook::DepthDiff { price: 100.0, bid_qty: 10.0, ask_qty: 0.0, timestamp_ms: 0 }).unwrap();
        pre.on_depth_diff(crate::orderbook::DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 10_000.0, timestamp_ms: 0 }).unwrap();
        let enriched = pre.on_agg_trade(trade(100.01, 1.0, false, 1)).unwrap();
        let det = ExhaustionDetector::new(settings.exhaustion, 0.01, Arc::new(PipelineMetrics::new()));
        let out = det.on_enriched_trade(&enriched).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn circuit_breaker_opens_after_repeated_missing_book() {
        let settings = test_settings();
        let det = ExhaustionDetector::new(settings.exhaustion, 0.01, Arc::new(PipelineMetrics::new()));
        let lonely = crate::preprocessor::EnrichedTrade {
            trade: trade(100.0, 1.0, false, 1),
            aggressor: Aggressor::Buy,
            best_bid: None,
            best_ask: None,
            mid_price: None,
            spread: None,
            passive_bid_at_price: 0.0,
            passive_ask_at_price: 0.0,
            delta: 1.0,
            accumulated_delta: 1.0,
            imbalance: None,
            zone_data: Default::default(),
        };
        for _ in 0..5 {
            let _ = det.on_enriched_trade(&lonely);
        }
        assert!(det.status().circuit_open);
    }
}
