//! Cumulative volume delta (CVD) divergence detector.
//!
//! Tracks signed trade flow (`EnrichedTrade::delta`) over several rolling
//! windows (shortest first) and flags a reading as a candidate when the
//! shortest window's CVD is a statistical outlier against its own recent
//! history *and* the longer windows agree on direction — single-timeframe
//! noise is filtered out by requiring cross-timeframe confluence.
//!
//! The per-evaluation scratch buffer is pooled (`pool::Pool`) since a
//! z-score vector is allocated once per trade; this keeps allocator
//! pressure flat at trade rate rather than scaling with it, the same
//! concern the teacher addresses with per-symbol history buffers in
//! `scrapers/binance_book_ticker.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::CvdSettings;
use crate::detectors::{next_sequence, CircuitBreaker, Cooldown, Detector, DetectorError, DetectorResult, DetectorStatus, Side};
use crate::financial_math::{self, Price};
use crate::metrics::PipelineMetrics;
use crate::pool::{Pool, Poolable};
use crate::preprocessor::EnrichedTrade;
use crate::rolling_window::RollingWindow;

const HISTORY_CAP: usize = 500;

#[derive(Default)]
struct CvdScratch {
    z_scores: Vec<f64>,
}

impl Poolable for CvdScratch {
    fn reset(&mut self) {
        self.z_scores.clear();
    }
}

/// Raw deltas are retained no longer than the longest configured window, so
/// `windowed_sum` can answer every shorter window from the same buffer.
const RAW_DELTA_CAPACITY: usize = 20_000;

pub struct CvdDetector {
    settings: CvdSettings,
    tick_size: f64,
    raw_deltas: Mutex<RollingWindow<f64>>,
    window_history: Mutex<Vec<RollingWindow<f64>>>,
    scratch: Pool<CvdScratch>,
    cooldown: Cooldown,
    breaker: CircuitBreaker,
    metrics: Arc<PipelineMetrics>,
}

impl CvdDetector {
    pub fn new(settings: CvdSettings, tick_size: f64, metrics: Arc<PipelineMetrics>) -> Self {
        let longest = *settings.window_sizes_ms.iter().max().unwrap_or(&0);
        let window_count = settings.window_sizes_ms.len();
        let cooldown = Cooldown::new(settings.event_cooldown_ms);
        let breaker = CircuitBreaker::new(settings.max_errors, settings.circuit_breaker_window_ms);
        let pool_capacity = settings.pool_capacity;
        Self {
            raw_deltas: Mutex::new(RollingWindow::new(longest, RAW_DELTA_CAPACITY)),
            window_history: Mutex::new((0..window_count).map(|_| RollingWindow::new(u64::MAX, HISTORY_CAP)).collect()),
            settings,
            tick_size,
            scratch: Pool::new(pool_capacity),
            cooldown,
            breaker,
            metrics,
        }
    }
}

impl Detector for CvdDetector {
    fn id(&self) -> &'static str {
        "delta_cvd"
    }

    fn on_enriched_trade(&self, trade: &EnrichedTrade) -> DetectorResult {
        let now_ms = trade.trade.timestamp_ms;
        if self.breaker.is_open(now_ms) {
            return Err(DetectorError::CircuitOpen);
        }

        {
            let mut deltas = self.raw_deltas.lock();
            deltas.push(now_ms, trade.delta);
        }

        let candidates = (|| -> Vec<_> {
            let deltas = self.raw_deltas.lock();
            let mut scratch = self.scratch.checkout();
            let mut histories = self.window_history.lock();

            for (i, &window_ms) in self.settings.window_sizes_ms.iter().enumerate() {
                let cvd = deltas.windowed_sum(now_ms, window_ms);
                let history = &mut histories[i];
                history.push(now_ms, cvd);
                let samples: Vec<f64> = history.values().copied().collect();
                let Some(mean) = financial_math::mean(&samples) else { continue };
                let Some(stddev) = financial_math::stddev(&samples) else { continue };
                if stddev <= 0.0 {
                    continue;
                }
                scratch.z_scores.push((cvd - mean) / stddev);
            }
            drop(deltas);

            if scratch.z_scores.is_empty() {
                return vec![];
            }
            let shortest_z = scratch.z_scores[0];
            if shortest_z.abs() < self.settings.z_score_threshold {
                return vec![];
            }
            let agrees = scratch.z_scores.iter().all(|z| z.signum() == shortest_z.signum());
            if !agrees {
                return vec![];
            }

            let confidence = (shortest_z.abs() / (self.settings.z_score_threshold * 2.0)).clamp(0.0, 1.0);
            let side = if shortest_z > 0.0 { Side::Buy } else { Side::Sell };
            if !self.cooldown.try_fire(side, now_ms) {
                return vec![];
            }

            let price_units = financial_math::price_to_int(
                financial_math::normalize_price_to_tick(trade.trade.price, self.tick_size),
            );
            let mut details = HashMap::new();
            for (i, z) in scratch.z_scores.iter().enumerate() {
                details.insert(format!("z_window_{i}"), *z);
            }

            vec![crate::detectors::SignalCandidate {
                id: Uuid::new_v4(),
                detector_id: "delta_cvd",
                side,
                price: Price::from_units(price_units),
                confidence,
                timestamp_ms: now_ms,
                details,
            }]
        })();

        self.breaker.record_success();
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
    use crate::preprocessor::{AggTrade, Aggressor, OrderFlowPreprocessor};

    fn trade(price: f64, qty: f64, buyer_is_maker: bool, ts: u64) -> AggTrade {
        AggTrade { trade_id: ts, price, quantity: qty, timestamp_ms: ts, buyer_is_maker }
    }

    #[test]
    fn insufficient_history_yields_no_candidate() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let det = CvdDetector::new(settings.cvd, 0.01, Arc::new(PipelineMetrics::new()));
        let enriched = pre.on_agg_trade(trade(100.0, 5.0, false, 1)).unwrap();
        let out = det.on_enriched_trade(&enriched).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn aggressor_matches_buy_on_positive_delta() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let enriched = pre.on_agg_trade(trade(100.0, 5.0, false, 1)).unwrap();
        assert_eq!(enriched.aggressor, Aggressor::Buy);
        assert!(enriched.delta > 0.0);
    }
}
