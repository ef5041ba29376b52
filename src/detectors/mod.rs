//! Detector contract and shared infrastructure.
//!
//! A `Detector` is a narrow trait, not a closed enum, so new patterns can be
//! added without touching the coordinator (mirrors the teacher's
//! `SignalDetector` in `signals/detector.rs`, where each pattern is one
//! independent scan rather than a match arm over a pattern kind). Detectors
//! are registered as `Box<dyn Detector>` with the coordinator.

pub mod absorption;
pub mod cvd;
pub mod exhaustion;
pub mod zone;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::financial_math;
use crate::metrics::BreakerGaugeState;
use crate::preprocessor::EnrichedTrade;
use crate::rolling_window::RollingWindow;

/// Side of a signal candidate. Distinct from `preprocessor::Aggressor`:
/// a signal's side is a detector's interpretation (e.g. absorption flips
/// the dominant aggressor to the opposite side; exhaustion keeps the
/// exhausted side as-is), not a direct copy of the triggering trade's
/// aggressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

/// A candidate trading signal emitted by a detector. Downstream validation,
/// deduplication, and broadcast belong to the `SignalManager` collaborator.
#[derive(Debug, Clone)]
pub struct SignalCandidate {
    pub id: Uuid,
    pub detector_id: &'static str,
    pub side: Side,
    pub price: crate::financial_math::Price,
    pub confidence: f64,
    pub timestamp_ms: u64,
    /// Named diagnostic sub-scores and ratios that fed the confidence
    /// calculation, e.g. `"absorption_ratio" -> 2.3`.
    pub details: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorError {
    /// Input could not be processed (e.g. a required book side missing).
    InsufficientData,
    /// Circuit breaker is open; the detector is skipping evaluation.
    CircuitOpen,
}

pub type DetectorResult = Result<Vec<SignalCandidate>, DetectorError>;

#[derive(Debug, Clone, Copy)]
pub struct DetectorStatus {
    pub circuit_open: bool,
    pub consecutive_errors: u32,
}

/// Common interface every pattern detector implements. `on_enriched_trade`
/// is the hot path; it must not block on anything beyond its own
/// `parking_lot` state.
pub trait Detector: Send + Sync {
    fn id(&self) -> &'static str;
    fn on_enriched_trade(&self, trade: &EnrichedTrade) -> DetectorResult;
    fn status(&self) -> DetectorStatus;
}

/// Consecutive-failure circuit breaker shared by all four detectors,
/// grounded on the teacher's `DataSourceKillSwitch` in `main.rs`: opens
/// after `max_errors` consecutive failures, half-opens (allows one trial
/// evaluation) once `window_ms` has elapsed since opening, and closes again
/// on that trial's success.
pub struct CircuitBreaker {
    max_errors: u32,
    window_ms: u64,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    consecutive_errors: u32,
    opened_at_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(max_errors: u32, window_ms: u64) -> Self {
        Self {
            max_errors,
            window_ms,
            state: Mutex::new(BreakerState { consecutive_errors: 0, opened_at_ms: None }),
        }
    }

    /// Returns `true` if the breaker currently blocks evaluation. A
    /// half-open breaker (window elapsed) reports closed so the caller can
    /// attempt one trial evaluation.
    pub fn is_open(&self, now_ms: u64) -> bool {
        let state = self.state.lock();
        match state.opened_at_ms {
            None => false,
            Some(opened_at) => now_ms.saturating_sub(opened_at) < self.window_ms,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_errors = 0;
        state.opened_at_ms = None;
    }

    pub fn record_error(&self, now_ms: u64) {
        let mut state = self.state.lock();
        state.consecutive_errors += 1;
        if state.consecutive_errors >= self.max_errors && state.opened_at_ms.is_none() {
            state.opened_at_ms = Some(now_ms);
        }
    }

    pub fn status(&self) -> DetectorStatus {
        let state = self.state.lock();
        DetectorStatus {
            circuit_open: state.opened_at_ms.is_some(),
            consecutive_errors: state.consecutive_errors,
        }
    }

    pub fn gauge_state(&self, now_ms: u64) -> BreakerGaugeState {
        if self.is_open(now_ms) {
            BreakerGaugeState::Open
        } else if self.state.lock().opened_at_ms.is_some() {
            BreakerGaugeState::HalfOpen
        } else {
            BreakerGaugeState::Closed
        }
    }
}

/// Per-side event-cooldown gate shared by all detectors: suppresses a
/// repeat emission on the same side within `cooldown_ms` of the last one.
pub struct Cooldown {
    cooldown_ms: u64,
    last_emitted_ms: Mutex<HashMap<Side, u64>>,
}

impl Cooldown {
    pub fn new(cooldown_ms: u64) -> Self {
        Self { cooldown_ms, last_emitted_ms: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` (and records `now_ms`) if a new signal on `side` may
    /// be emitted right now.
    pub fn try_fire(&self, side: Side, now_ms: u64) -> bool {
        let mut last = self.last_emitted_ms.lock();
        let ready = match last.get(&side) {
            Some(&prev) => now_ms.saturating_sub(prev) >= self.cooldown_ms,
            None => true,
        };
        if ready {
            last.insert(side, now_ms);
        }
        ready
    }
}

const ADAPTIVE_WINDOW_MAX_AGE_MS: u64 = 10 * 60_000;
const ADAPTIVE_WINDOW_CAPACITY: usize = 500;
const ADAPTIVE_MIN_SAMPLES: usize = 30;

#[derive(Debug, Clone, Copy)]
pub struct DepletionCutoffs {
    pub moderate: f64,
    pub high: f64,
    pub extreme: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PassiveCutoffs {
    pub some: f64,
    pub moderate: f64,
    pub severe: f64,
}

struct AdaptiveState {
    depletion_samples: RollingWindow<f64>,
    passive_samples: RollingWindow<f64>,
    confidence_samples: RollingWindow<f64>,
    depletion_cutoffs: DepletionCutoffs,
    passive_cutoffs: PassiveCutoffs,
    min_confidence: f64,
    last_refresh_ms: u64,
}

/// Quantile-based cutoffs that gradually replace a detector's static
/// configuration once enough recent observations accumulate. Seeded from
/// the detector's own configured thresholds, which remain in force as the
/// floor/fallback until the first refresh and whenever a window has too few
/// samples to recompute a stable quantile from.
///
/// Each detector instance owns one: there is no cross-detector sharing, so
/// a quiet detector's thresholds never drift from a busy one's traffic.
pub struct AdaptiveThresholds {
    refresh_interval_ms: u64,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveThresholds {
    pub fn new(
        seed_depletion: DepletionCutoffs,
        seed_passive: PassiveCutoffs,
        seed_min_confidence: f64,
        refresh_interval_ms: u64,
    ) -> Self {
        Self {
            refresh_interval_ms,
            state: Mutex::new(AdaptiveState {
                depletion_samples: RollingWindow::new(ADAPTIVE_WINDOW_MAX_AGE_MS, ADAPTIVE_WINDOW_CAPACITY),
                passive_samples: RollingWindow::new(ADAPTIVE_WINDOW_MAX_AGE_MS, ADAPTIVE_WINDOW_CAPACITY),
                confidence_samples: RollingWindow::new(ADAPTIVE_WINDOW_MAX_AGE_MS, ADAPTIVE_WINDOW_CAPACITY),
                depletion_cutoffs: seed_depletion,
                passive_cutoffs: seed_passive,
                min_confidence: seed_min_confidence,
                last_refresh_ms: 0,
            }),
        }
    }

    /// Feed one trade's depletion/passive-ratio observation in, refreshing
    /// the derived cutoffs if `refresh_interval_ms` has elapsed.
    pub fn record_ratios(&self, depletion_ratio: f64, passive_ratio: f64, now_ms: u64) {
        let mut state = self.state.lock();
        state.depletion_samples.push(now_ms, depletion_ratio);
        state.passive_samples.push(now_ms, passive_ratio);
        self.maybe_refresh(&mut state, now_ms);
    }

    /// Feed a computed confidence score in, for detectors that only reach a
    /// confidence value after the ratio gates above have already passed.
    pub fn record_confidence(&self, confidence: f64, now_ms: u64) {
        let mut state = self.state.lock();
        state.confidence_samples.push(now_ms, confidence);
        self.maybe_refresh(&mut state, now_ms);
    }

    fn maybe_refresh(&self, state: &mut AdaptiveState, now_ms: u64) {
        if now_ms.saturating_sub(state.last_refresh_ms) >= self.refresh_interval_ms {
            Self::refresh(state);
            state.last_refresh_ms = now_ms;
        }
    }

    fn refresh(state: &mut AdaptiveState) {
        if state.depletion_samples.len() >= ADAPTIVE_MIN_SAMPLES {
            let values: Vec<f64> = state.depletion_samples.values().copied().collect();
            if let (Some(moderate), Some(high), Some(extreme)) = (
                financial_math::percentile(&values, 60.0),
                financial_math::percentile(&values, 85.0),
                financial_math::percentile(&values, 97.0),
            ) {
                state.depletion_cutoffs = DepletionCutoffs { moderate, high, extreme };
            }
        }
        if state.passive_samples.len() >= ADAPTIVE_MIN_SAMPLES {
            let values: Vec<f64> = state.passive_samples.values().copied().collect();
            // Lower passive ratio is more severe, so "some" depletion is the
            // high quantile and "severe" is the low one.
            if let (Some(some), Some(moderate), Some(severe)) = (
                financial_math::percentile(&values, 40.0),
                financial_math::percentile(&values, 20.0),
                financial_math::percentile(&values, 5.0),
            ) {
                state.passive_cutoffs = PassiveCutoffs { some, moderate, severe };
            }
        }
        if state.confidence_samples.len() >= ADAPTIVE_MIN_SAMPLES {
            let values: Vec<f64> = state.confidence_samples.values().copied().collect();
            if let Some(median) = financial_math::percentile(&values, 50.0) {
                // Never drift the confidence floor below what was configured;
                // adaptively raise it only when recent signals are running
                // well above the configured bar.
                state.min_confidence = state.min_confidence.max(median * 0.8);
            }
        }
    }

    pub fn depletion_cutoffs(&self) -> DepletionCutoffs {
        self.state.lock().depletion_cutoffs
    }

    pub fn passive_cutoffs(&self) -> PassiveCutoffs {
        self.state.lock().passive_cutoffs
    }

    pub fn min_confidence(&self) -> f64 {
        self.state.lock().min_confidence
    }
}

/// Monotonically increasing id source for `SignalCandidate::id` ordering
/// ties in the coordinator's priority queue, independent of `Uuid`'s
/// unordered bytes.
pub static CANDIDATE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_sequence() -> u64 {
    CANDIDATE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}
