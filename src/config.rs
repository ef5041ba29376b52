//! Configuration surface.
//!
//! Every tunable named in the spec is explicit here. This is a deliberate
//! departure from the teacher's own `*Config::from_env()` convention (see
//! e.g. `vault::orderflow_paper::OrderflowPaperConfig::from_env`), which
//! parses each env var and silently falls back to a `Default` on parse
//! failure or absence. That pattern is explicitly called out as a flaw to
//! re-architect: configuration here is a fully-specified immutable struct,
//! validated once at startup. A missing field is a deserialization error; an
//! out-of-range field is a validation error. Both are fatal — the process
//! does not start with a guessed value.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Enhancement mode for zone-aware scoring (confluence, cross-timeframe
/// alignment, institutional-volume filtering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementMode {
    Disabled,
    Testing,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub liquidity_gradient: bool,
    pub absorption_velocity: bool,
    pub layered_absorption: bool,
    pub spread_impact: bool,
    pub adaptive_zone: bool,
    pub passive_history: bool,
    pub multi_zone: bool,
}

/// Global, pair-wide settings shared by the book, preprocessor, and all
/// detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub tick_size: f64,
    pub lot_size: f64,
    /// Zone tick-widths, e.g. `[5, 10, 20]` for 5/10/20-tick aggregations.
    pub zone_widths: Vec<u32>,
    /// Rolling time window (ms) over which zone aggregates are computed.
    pub zone_window_ms: u64,
    /// Max resident zone centers per width before LRU eviction.
    pub max_zones: usize,
    /// Max samples retained per rolling window.
    pub max_samples: usize,
    /// Radius (in price units) within which zones across the three widths
    /// are considered confluent with a given trade price, used by the
    /// preprocessor to select the zone neighborhood included on each
    /// enriched trade.
    pub confluence_max_distance: f64,
    pub enhancement_mode: EnhancementMode,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorptionWeights {
    pub aggressive_volume: f64,
    pub absorption_ratio: f64,
    pub passive_refill: f64,
    pub price_efficiency: f64,
    pub spread_impact: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorptionSettings {
    pub min_agg_volume: f64,
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub depletion_fraction: f64,
    pub refill_fraction: f64,
    pub min_refill_events: usize,
    pub price_efficiency_threshold: f64,
    pub expected_movement_scaling: f64,
    pub spread_impact_threshold: f64,
    pub dominance_threshold: f64,
    pub weights: AbsorptionWeights,
    pub final_confidence_required: f64,
    pub event_cooldown_ms: u64,
    pub confluence_max_distance: f64,
    pub confluence_min_zones: usize,
    pub institutional_filter_enabled: bool,
    pub institutional_volume_threshold: f64,
    pub institutional_volume_ratio_threshold: f64,
    /// Fixed confidence boost applied in enhanced mode when zone confluence
    /// across the three tick-widths reaches `confluence_min_zones`.
    pub confluence_confidence_boost: f64,
    /// Fixed confidence boost applied in enhanced mode when the per-width
    /// dominance scores agree (low spread, high mean).
    pub alignment_confidence_boost: f64,
    /// Max stddev across per-width dominance scores for them to count as
    /// "aligned".
    pub alignment_stddev_threshold: f64,
    /// Min mean of per-width dominance scores for them to count as "high".
    pub alignment_mean_threshold: f64,
    pub circuit_breaker_window_ms: u64,
    pub max_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustionWeights {
    pub depletion_ratio: f64,
    pub passive_ratio: f64,
    pub refill_gap: f64,
    pub imbalance: f64,
    pub spread: f64,
    pub passive_velocity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustionSettings {
    pub depletion_ratio_extreme: f64,
    pub depletion_ratio_high: f64,
    pub depletion_ratio_moderate: f64,
    pub passive_ratio_severe: f64,
    pub passive_ratio_moderate: f64,
    pub passive_ratio_some: f64,
    pub imbalance_high_threshold: f64,
    pub imbalance_medium_threshold: f64,
    pub spread_high_threshold: f64,
    pub spread_medium_threshold: f64,
    pub spread_adjustment_enabled: bool,
    pub volume_velocity_enabled: bool,
    pub weights: ExhaustionWeights,
    pub final_confidence_required: f64,
    pub event_cooldown_ms: u64,
    pub circuit_breaker_window_ms: u64,
    pub max_errors: u32,
    pub detector_deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneDetectorSettings {
    pub confluence_max_distance: f64,
    pub confluence_min_zones: usize,
    pub ratio_threshold: f64,
    pub volume_threshold: f64,
    pub alignment_score_threshold: f64,
    pub min_confidence_boost_threshold: f64,
    pub completion_boost_threshold: f64,
    pub base_confidence: f64,
    pub event_cooldown_ms: u64,
    pub circuit_breaker_window_ms: u64,
    pub max_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdSettings {
    /// Window sizes in ms, shortest first. Must contain at least 2 entries.
    pub window_sizes_ms: Vec<u64>,
    pub z_score_threshold: f64,
    pub pool_capacity: usize,
    pub event_cooldown_ms: u64,
    pub circuit_breaker_window_ms: u64,
    pub max_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub signal_processing_timeout_ms: u64,
    pub max_retries: u32,
    pub detector_deadline_ms: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub global: GlobalSettings,
    pub absorption: AbsorptionSettings,
    pub exhaustion: ExhaustionSettings,
    pub accumulation: ZoneDetectorSettings,
    pub distribution: ZoneDetectorSettings,
    pub cvd: CvdSettings,
    pub coordinator: CoordinatorSettings,
}

impl Settings {
    /// Parse from a JSON or TOML-compatible string (via serde_json for the
    /// demo binary and tests) and validate. Every field is required by the
    /// type itself; this additionally rejects out-of-range values.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(s).context("failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let g = &self.global;
        if !(g.tick_size.is_finite() && g.tick_size > 0.0) {
            return Err(CoreError::Configuration(format!("global.tick_size must be a positive finite number")));
        }
        if !(g.lot_size.is_finite() && g.lot_size > 0.0) {
            return Err(CoreError::Configuration(format!("global.lot_size must be a positive finite number")));
        }
        if g.zone_widths.is_empty() {
            return Err(CoreError::Configuration(format!("global.zone_widths must not be empty")));
        }
        if g.zone_widths.len() != 3 {
            return Err(CoreError::Configuration(format!("global.zone_widths must have exactly 3 entries (spec §3: zones_5_tick/10_tick/20_tick)")));
        }
        if g.zone_widths.iter().any(|w| *w == 0) {
            return Err(CoreError::Configuration(format!("global.zone_widths entries must be non-zero")));
        }
        if g.zone_window_ms == 0 {
            return Err(CoreError::Configuration(format!("global.zone_window_ms must be positive")));
        }
        if g.max_zones == 0 || g.max_samples == 0 {
            return Err(CoreError::Configuration(format!("global.max_zones and global.max_samples must be positive")));
        }
        if !(g.confluence_max_distance.is_finite() && g.confluence_max_distance > 0.0) {
            return Err(CoreError::Configuration(format!("global.confluence_max_distance must be a positive finite number")));
        }

        let a = &self.absorption;
        if !(0.0..=1.0).contains(&a.dominance_threshold) {
            return Err(CoreError::Configuration(format!("absorption.dominance_threshold must be in [0,1]")));
        }
        if !(0.0..=1.0).contains(&a.final_confidence_required) {
            return Err(CoreError::Configuration(format!("absorption.final_confidence_required must be in [0,1]")));
        }
        if a.min_ratio < 0.0 || a.max_ratio < a.min_ratio {
            return Err(CoreError::Configuration(format!("absorption.min_ratio/max_ratio out of range")));
        }
        if a.max_errors == 0 {
            return Err(CoreError::Configuration(format!("absorption.max_errors must be positive")));
        }
        if a.circuit_breaker_window_ms == 0 {
            return Err(CoreError::Configuration(format!("absorption.circuit_breaker_window_ms must be positive")));
        }
        if !(a.confluence_confidence_boost.is_finite() && a.confluence_confidence_boost >= 0.0) {
            return Err(CoreError::Configuration(format!("absorption.confluence_confidence_boost must be a non-negative finite number")));
        }
        if !(a.alignment_confidence_boost.is_finite() && a.alignment_confidence_boost >= 0.0) {
            return Err(CoreError::Configuration(format!("absorption.alignment_confidence_boost must be a non-negative finite number")));
        }
        if !(a.alignment_stddev_threshold.is_finite() && a.alignment_stddev_threshold >= 0.0) {
            return Err(CoreError::Configuration(format!("absorption.alignment_stddev_threshold must be a non-negative finite number")));
        }
        if !(0.0..=1.0).contains(&a.alignment_mean_threshold) {
            return Err(CoreError::Configuration(format!("absorption.alignment_mean_threshold must be in [0,1]")));
        }
        check_weights(
            "absorption",
            &[
                a.weights.aggressive_volume,
                a.weights.absorption_ratio,
                a.weights.passive_refill,
                a.weights.price_efficiency,
                a.weights.spread_impact,
            ],
        )?;

        let e = &self.exhaustion;
        if !(0.0..=1.0).contains(&e.final_confidence_required) {
            return Err(CoreError::Configuration(format!("exhaustion.final_confidence_required must be in [0,1]")));
        }
        if e.max_errors == 0 {
            return Err(CoreError::Configuration(format!("exhaustion.max_errors must be positive")));
        }
        if e.circuit_breaker_window_ms == 0 {
            return Err(CoreError::Configuration(format!("exhaustion.circuit_breaker_window_ms must be positive")));
        }
        check_weights(
            "exhaustion",
            &[
                e.weights.depletion_ratio,
                e.weights.passive_ratio,
                e.weights.refill_gap,
                e.weights.imbalance,
                e.weights.spread,
                e.weights.passive_velocity,
            ],
        )?;

        for (name, z) in [("accumulation", &self.accumulation), ("distribution", &self.distribution)] {
            if !(0.0..=1.0).contains(&z.ratio_threshold) {
                return Err(CoreError::Configuration(format!("{name}.ratio_threshold must be in [0,1]")));
            }
            if z.confluence_min_zones == 0 {
                return Err(CoreError::Configuration(format!("{name}.confluence_min_zones must be positive")));
            }
            if z.max_errors == 0 {
                return Err(CoreError::Configuration(format!("{name}.max_errors must be positive")));
            }
            if z.circuit_breaker_window_ms == 0 {
                return Err(CoreError::Configuration(format!("{name}.circuit_breaker_window_ms must be positive")));
            }
        }

        if self.cvd.window_sizes_ms.len() < 2 {
            return Err(CoreError::Configuration(format!("cvd.window_sizes_ms must have at least 2 entries (short + long)")));
        }
        if !self.cvd.window_sizes_ms.windows(2).all(|w| w[0] < w[1]) {
            return Err(CoreError::Configuration(format!("cvd.window_sizes_ms must be strictly increasing, shortest first")));
        }
        if self.cvd.pool_capacity == 0 {
            return Err(CoreError::Configuration(format!("cvd.pool_capacity must be positive")));
        }
        if self.cvd.max_errors == 0 {
            return Err(CoreError::Configuration(format!("cvd.max_errors must be positive")));
        }
        if self.cvd.circuit_breaker_window_ms == 0 {
            return Err(CoreError::Configuration(format!("cvd.circuit_breaker_window_ms must be positive")));
        }

        if self.coordinator.queue_capacity == 0 {
            return Err(CoreError::Configuration(format!("coordinator.queue_capacity must be positive")));
        }
        if self.coordinator.max_retries == 0 {
            return Err(CoreError::Configuration(format!("coordinator.max_retries must be at least 1")));
        }

        Ok(())
    }
}

/// Scoring weights must sum to ~1.0. A mismatch is not fatal (spec §4.4):
/// renormalize and warn, since weights typically come from a tuning file
/// that can drift slightly, not from a structurally broken config.
pub fn check_weights(owner: &str, weights: &[f64]) -> CoreResult<()> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(CoreError::Configuration(format!("{owner} weights must be finite and non-negative")));
    }
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return Err(CoreError::Configuration(format!("{owner} weights must sum to a positive number")));
    }
    Ok(())
}

/// Renormalize a weight vector to sum to 1.0, warning if it drifted.
pub fn renormalize_weights(owner: &str, weights: &mut [f64]) {
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return;
    }
    if (sum - 1.0).abs() > 1e-6 {
        tracing::warn!(owner, sum, "scoring weights did not sum to 1.0, renormalizing");
        for w in weights.iter_mut() {
            *w /= sum;
        }
    }
}

fn base_settings() -> Settings {
    Settings {
        global: GlobalSettings {
            tick_size: 0.01,
            lot_size: 0.0001,
            zone_widths: vec![5, 10, 20],
            zone_window_ms: 60_000,
            max_zones: 500,
            max_samples: 2_000,
            confluence_max_distance: 0.05,
            enhancement_mode: EnhancementMode::Production,
            features: FeatureFlags {
                liquidity_gradient: true,
                absorption_velocity: true,
                layered_absorption: true,
                spread_impact: true,
                adaptive_zone: true,
                passive_history: true,
                multi_zone: true,
            },
        },
        absorption: AbsorptionSettings {
            min_agg_volume: 50.0,
            min_ratio: 0.05,
            max_ratio: 5.0,
            depletion_fraction: 0.2,
            refill_fraction: 0.5,
            min_refill_events: 1,
            price_efficiency_threshold: 0.01,
            expected_movement_scaling: 1.0,
            spread_impact_threshold: 0.05,
            dominance_threshold: 0.65,
            weights: AbsorptionWeights {
                aggressive_volume: 0.2,
                absorption_ratio: 0.3,
                passive_refill: 0.3,
                price_efficiency: 0.15,
                spread_impact: 0.05,
            },
            final_confidence_required: 0.5,
            event_cooldown_ms: 60_000,
            confluence_max_distance: 0.05,
            confluence_min_zones: 2,
            institutional_filter_enabled: false,
            institutional_volume_threshold: 500.0,
            institutional_volume_ratio_threshold: 0.4,
            confluence_confidence_boost: 0.1,
            alignment_confidence_boost: 0.1,
            alignment_stddev_threshold: 0.1,
            alignment_mean_threshold: 0.65,
            circuit_breaker_window_ms: 30_000,
            max_errors: 5,
        },
        exhaustion: ExhaustionSettings {
            depletion_ratio_extreme: 3.0,
            depletion_ratio_high: 2.0,
            depletion_ratio_moderate: 1.5,
            passive_ratio_severe: 0.15,
            passive_ratio_moderate: 0.35,
            passive_ratio_some: 0.6,
            imbalance_high_threshold: 0.7,
            imbalance_medium_threshold: 0.4,
            spread_high_threshold: 0.1,
            spread_medium_threshold: 0.05,
            spread_adjustment_enabled: true,
            volume_velocity_enabled: true,
            weights: ExhaustionWeights {
                depletion_ratio: 0.3,
                passive_ratio: 0.25,
                refill_gap: 0.2,
                imbalance: 0.15,
                spread: 0.05,
                passive_velocity: 0.05,
            },
            final_confidence_required: 0.5,
            event_cooldown_ms: 60_000,
            circuit_breaker_window_ms: 30_000,
            max_errors: 5,
            detector_deadline_ms: 5,
        },
        accumulation: ZoneDetectorSettings {
            confluence_max_distance: 0.05,
            confluence_min_zones: 2,
            ratio_threshold: 0.65,
            volume_threshold: 200.0,
            alignment_score_threshold: 0.6,
            min_confidence_boost_threshold: 0.05,
            completion_boost_threshold: 0.15,
            base_confidence: 0.3,
            event_cooldown_ms: 60_000,
            circuit_breaker_window_ms: 30_000,
            max_errors: 5,
        },
        distribution: ZoneDetectorSettings {
            confluence_max_distance: 0.05,
            confluence_min_zones: 2,
            ratio_threshold: 0.65,
            volume_threshold: 200.0,
            alignment_score_threshold: 0.6,
            min_confidence_boost_threshold: 0.05,
            completion_boost_threshold: 0.15,
            base_confidence: 0.3,
            event_cooldown_ms: 60_000,
            circuit_breaker_window_ms: 30_000,
            max_errors: 5,
        },
        cvd: CvdSettings {
            window_sizes_ms: vec![30_000, 120_000, 300_000],
            z_score_threshold: 2.0,
            pool_capacity: 64,
            event_cooldown_ms: 30_000,
            circuit_breaker_window_ms: 30_000,
            max_errors: 5,
        },
        coordinator: CoordinatorSettings {
            signal_processing_timeout_ms: 250,
            max_retries: 3,
            detector_deadline_ms: 5,
            queue_capacity: 10_000,
        },
    }
}

#[cfg(test)]
pub fn test_settings() -> Settings {
    base_settings()
}

/// Settings builders for integration tests outside this crate. Not
/// `cfg(test)`-gated, since `tests/` binaries compile against the library
/// as an ordinary dependency.
pub mod test_support {
    use super::{base_settings, Settings};

    /// Tuned far looser than production defaults so a handful of
    /// hand-built trades is enough to walk each detector through a full
    /// signal, rather than the weeks of realistic flow production
    /// thresholds assume.
    pub fn scenario_settings() -> Settings {
        let mut s = base_settings();

        s.absorption.min_agg_volume = 50.0;
        s.absorption.min_ratio = 0.5;
        s.absorption.max_ratio = 10.0;
        s.absorption.depletion_fraction = 0.02;
        s.absorption.refill_fraction = 0.02;
        s.absorption.min_refill_events = 1;
        s.absorption.price_efficiency_threshold = 5.0;
        s.absorption.spread_impact_threshold = 1.0;
        s.absorption.dominance_threshold = 0.5;
        s.absorption.final_confidence_required = 0.05;
        s.absorption.event_cooldown_ms = 0;

        s.exhaustion.depletion_ratio_moderate = 0.05;
        s.exhaustion.passive_ratio_some = 0.99;
        s.exhaustion.final_confidence_required = 0.01;
        s.exhaustion.event_cooldown_ms = 0;

        s.accumulation.volume_threshold = 50.0;
        s.accumulation.ratio_threshold = 0.6;
        s.accumulation.confluence_min_zones = 1;
        s.accumulation.alignment_score_threshold = 0.3;
        s.accumulation.min_confidence_boost_threshold = 0.01;
        s.accumulation.base_confidence = 0.2;
        s.accumulation.event_cooldown_ms = 0;
        s.distribution = s.accumulation.clone();

        s.validate().expect("scenario settings must be internally consistent");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_settings_validate() {
        test_settings().validate().unwrap();
    }

    #[test]
    fn rejects_bad_tick_size() {
        let mut s = test_settings();
        s.global.tick_size = 0.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_unbalanced_required_fields() {
        let mut s = test_settings();
        s.global.zone_widths = vec![];
        assert!(s.validate().is_err());
    }

    #[test]
    fn renormalizes_drifted_weights() {
        let mut w = [0.2, 0.2, 0.2, 0.2, 0.1]; // sums to 0.9
        renormalize_weights("test", &mut w);
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
