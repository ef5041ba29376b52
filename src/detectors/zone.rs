//! Accumulation / distribution detector: a multi-timeframe zone lifecycle.
//!
//! Spec's original design emitted a synthetic confidence delta on every
//! trade that touched a zone. This implements the proposed redesign
//! instead: an explicit six-state lifecycle per zone
//! (`Created → Updated → Strengthened → Weakened → Completed/Invalidated`),
//! driven by confluence across the three zone widths rather than by
//! single-trade noise. Only `Strengthened` (above a confidence bar) and
//! `Completed` transitions are surfaced as candidates; the rest are
//! internal bookkeeping.
//!
//! `Accumulation` and `Distribution` share this engine and differ only in
//! which side of aggressive flow they track — buy-side building at a
//! support zone, or sell-side building at a resistance zone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::ZoneDetectorSettings;
use crate::detectors::{next_sequence, CircuitBreaker, Cooldown, Detector, DetectorError, DetectorResult, DetectorStatus, Side};
use crate::financial_math::Price;
use crate::metrics::PipelineMetrics;
use crate::preprocessor::{EnrichedTrade, ZoneSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Accumulation,
    Distribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Updated,
    Strengthened,
    Weakened,
    Completed,
    Invalidated,
}

struct ZoneRecord {
    state: LifecycleState,
    ratio: f64,
    confidence: f64,
    last_update_ms: u64,
}

pub struct ZoneLifecycleDetector {
    id: &'static str,
    bias: Bias,
    settings: ZoneDetectorSettings,
    records: Mutex<HashMap<Price, ZoneRecord>>,
    cooldown: Cooldown,
    breaker: CircuitBreaker,
    metrics: Arc<PipelineMetrics>,
}

impl ZoneLifecycleDetector {
    pub fn accumulation(settings: ZoneDetectorSettings, metrics: Arc<PipelineMetrics>) -> Self {
        Self::new("accumulation", Bias::Accumulation, settings, metrics)
    }

    pub fn distribution(settings: ZoneDetectorSettings, metrics: Arc<PipelineMetrics>) -> Self {
        Self::new("distribution", Bias::Distribution, settings, metrics)
    }

    fn new(id: &'static str, bias: Bias, settings: ZoneDetectorSettings, metrics: Arc<PipelineMetrics>) -> Self {
        let cooldown = Cooldown::new(settings.event_cooldown_ms);
        let breaker = CircuitBreaker::new(settings.max_errors, settings.circuit_breaker_window_ms);
        Self { id, bias, settings, records: Mutex::new(HashMap::new()), cooldown, breaker, metrics }
    }

    fn directional_ratio(&self, zone: &ZoneSnapshot) -> f64 {
        let total = (zone.aggressive_buy_volume + zone.aggressive_sell_volume).max(1e-9);
        match self.bias {
            Bias::Accumulation => zone.aggressive_buy_volume / total,
            Bias::Distribution => zone.aggressive_sell_volume / total,
        }
    }

    fn qualifies(&self, zone: &ZoneSnapshot) -> bool {
        let total = zone.aggressive_buy_volume + zone.aggressive_sell_volume;
        total >= self.settings.volume_threshold && self.directional_ratio(zone) >= self.settings.ratio_threshold
    }

    fn nearest(&self, zones: &[ZoneSnapshot], price: f64) -> Option<ZoneSnapshot> {
        zones
            .iter()
            .filter(|z| (z.center.to_f64() - price).abs() <= self.settings.confluence_max_distance)
            .min_by(|a, b| {
                (a.center.to_f64() - price)
                    .abs()
                    .partial_cmp(&(b.center.to_f64() - price).abs())
                    .unwrap()
            })
            .cloned()
    }

    fn side(&self) -> Side {
        match self.bias {
            Bias::Accumulation => Side::Buy,
            Bias::Distribution => Side::Sell,
        }
    }
}

impl Detector for ZoneLifecycleDetector {
    fn id(&self) -> &'static str {
        self.id
    }

    fn on_enriched_trade(&self, trade: &EnrichedTrade) -> DetectorResult {
        let now_ms = trade.trade.timestamp_ms;
        if self.breaker.is_open(now_ms) {
            return Err(DetectorError::CircuitOpen);
        }

        let zd = &trade.zone_data;
        if zd.zones_5_tick.is_empty() && zd.zones_10_tick.is_empty() && zd.zones_20_tick.is_empty() {
            self.breaker.record_error(now_ms);
            self.metrics.set_circuit_breaker_state(self.id(), self.breaker.gauge_state(now_ms));
            return Err(DetectorError::InsufficientData);
        }

        let candidates = (|| -> Vec<_> {
            let price = trade.trade.price;
            let Some(canonical) = self.nearest(&zd.zones_20_tick, price) else { return vec![] };

            let width_zone_lists: [&[ZoneSnapshot]; 3] = [&zd.zones_5_tick, &zd.zones_10_tick, &zd.zones_20_tick];
            let mut confluence_count = 0usize;
            for zones in width_zone_lists {
                if self.nearest(zones, price).map(|z| self.qualifies(&z)).unwrap_or(false) {
                    confluence_count += 1;
                }
            }
            let alignment_score = confluence_count as f64 / width_zone_lists.len() as f64;

            let ratio = self.directional_ratio(&canonical);
            let mut records = self.records.lock();
            let is_new = !records.contains_key(&canonical.center);
            let record = records.entry(canonical.center).or_insert_with(|| ZoneRecord {
                state: LifecycleState::Created,
                ratio,
                confidence: self.settings.base_confidence,
                last_update_ms: now_ms,
            });

            if !is_new {
                let delta = ratio - record.ratio;
                if confluence_count < self.settings.confluence_min_zones && delta < -self.settings.min_confidence_boost_threshold {
                    record.state = if ratio < 1.0 - self.settings.ratio_threshold {
                        LifecycleState::Invalidated
                    } else {
                        LifecycleState::Weakened
                    };
                } else if delta >= self.settings.min_confidence_boost_threshold {
                    record.state = LifecycleState::Strengthened;
                    record.confidence = (record.confidence + self.settings.min_confidence_boost_threshold).min(1.0);
                } else {
                    record.state = LifecycleState::Updated;
                }
            }
            record.ratio = ratio;
            record.last_update_ms = now_ms;

            if confluence_count >= self.settings.confluence_min_zones
                && alignment_score >= self.settings.alignment_score_threshold
                && ratio >= 1.2 * self.settings.ratio_threshold
            {
                record.state = LifecycleState::Completed;
                record.confidence = (record.confidence + self.settings.completion_boost_threshold).min(1.0);
            }

            let should_emit = matches!(record.state, LifecycleState::Strengthened | LifecycleState::Completed)
                && record.confidence >= self.settings.base_confidence;
            let state_for_removal = record.state;
            let confidence = record.confidence;
            let center = canonical.center;
            drop(records);

            if matches!(state_for_removal, LifecycleState::Invalidated) {
                self.records.lock().remove(&center);
                return vec![];
            }
            if !should_emit {
                return vec![];
            }
            let side = self.side();
            if !self.cooldown.try_fire(side, now_ms) {
                return vec![];
            }

            let mut details = HashMap::new();
            details.insert("ratio".to_string(), ratio);
            details.insert("alignment_score".to_string(), alignment_score);
            details.insert("confluence_count".to_string(), confluence_count as f64);

            vec![crate::detectors::SignalCandidate {
                id: Uuid::new_v4(),
                detector_id: self.id,
                side,
                price: center,
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
    use crate::preprocessor::{AggTrade, OrderFlowPreprocessor};

    fn trade(price: f64, qty: f64, buyer_is_maker: bool, ts: u64) -> AggTrade {
        AggTrade { trade_id: ts, price, quantity: qty, timestamp_ms: ts, buyer_is_maker }
    }

    #[test]
    fn first_touch_creates_a_record_without_emitting() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let det = ZoneLifecycleDetector::accumulation(settings.accumulation, Arc::new(crate::metrics::PipelineMetrics::new()));
        let enriched = pre.on_agg_trade(trade(100.0, 1.0, false, 1)).unwrap();
        let out = det.on_enriched_trade(&enriched).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn sustained_one_sided_flow_eventually_strengthens() {
        let settings = test_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let det = ZoneLifecycleDetector::accumulation(settings.accumulation, Arc::new(crate::metrics::PipelineMetrics::new()));
        let mut emitted_any = false;
        for i in 0..50u64 {
            let enriched = pre.on_agg_trade(trade(100.0, 300.0, false, i * 10)).unwrap();
            let out = det.on_enriched_trade(&enriched).unwrap();
            if !out.is_empty() {
                emitted_any = true;
            }
        }
        assert!(emitted_any);
    }
}
