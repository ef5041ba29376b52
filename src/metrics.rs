//! Ambient pipeline counters.
//!
//! Mirrors the teacher's `performance::ComponentMetrics` shape (atomics plus
//! a `snapshot()` accessor) but narrowed to the four series this crate
//! actually emits. No HTTP exporter is wired here — that surface is a
//! collaborator's concern, not this crate's.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use metrics::{counter, gauge};

/// Process-wide counters for the signal pipeline. Cheap to clone (all
/// fields are `Arc`-free atomics behind shared references); callers hold
/// this behind an `Arc` when sharing across detector/coordinator tasks.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    detector_errors_count: AtomicU64,
    circuit_breaker_state: AtomicI64,
    queue_depth: AtomicI64,
    enhancement_attempts: AtomicU64,
    enhancement_successes: AtomicU64,
}

/// Circuit breaker state as recorded on the `circuit_breaker_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerGaugeState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerGaugeState {
    fn as_i64(self) -> i64 {
        match self {
            BreakerGaugeState::Closed => 0,
            BreakerGaugeState::Open => 1,
            BreakerGaugeState::HalfOpen => 2,
        }
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_detector_error(&self, detector: &'static str) {
        self.detector_errors_count.fetch_add(1, Ordering::Relaxed);
        counter!("detector_errors_count", "detector" => detector).increment(1);
    }

    pub fn set_circuit_breaker_state(&self, detector: &'static str, state: BreakerGaugeState) {
        self.circuit_breaker_state.store(state.as_i64(), Ordering::Relaxed);
        gauge!("circuit_breaker_state", "detector" => detector).set(state.as_i64() as f64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as i64, Ordering::Relaxed);
        gauge!("queue_depth").set(depth as f64);
    }

    /// Record one enhancement attempt (zone-aware scoring path) and whether
    /// it produced usable zone context.
    pub fn record_enhancement_attempt(&self, succeeded: bool) {
        self.enhancement_attempts.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.enhancement_successes.fetch_add(1, Ordering::Relaxed);
        }
        counter!("enhancement_attempts_count").increment(1);
        if succeeded {
            counter!("enhancement_success_count").increment(1);
        }
    }

    /// Fraction of enhancement attempts that succeeded, `None` if there
    /// have been none yet — never a fabricated 0.0 or 1.0.
    pub fn enhancement_success_rate(&self) -> Option<f64> {
        let attempts = self.enhancement_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return None;
        }
        let successes = self.enhancement_successes.load(Ordering::Relaxed);
        Some(successes as f64 / attempts as f64)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            detector_errors_count: self.detector_errors_count.load(Ordering::Relaxed),
            circuit_breaker_state: self.circuit_breaker_state.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            enhancement_success_rate: self.enhancement_success_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub detector_errors_count: u64,
    pub circuit_breaker_state: i64,
    pub queue_depth: i64,
    pub enhancement_success_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhancement_rate_none_until_first_attempt() {
        let m = PipelineMetrics::new();
        assert_eq!(m.enhancement_success_rate(), None);
        m.record_enhancement_attempt(true);
        m.record_enhancement_attempt(false);
        assert_eq!(m.enhancement_success_rate(), Some(0.5));
    }

    #[test]
    fn snapshot_reflects_recorded_state() {
        let m = PipelineMetrics::new();
        m.record_detector_error("absorption");
        m.set_circuit_breaker_state("exhaustion", BreakerGaugeState::Open);
        m.set_queue_depth(42);
        let snap = m.snapshot();
        assert_eq!(snap.detector_errors_count, 1);
        assert_eq!(snap.circuit_breaker_state, 1);
        assert_eq!(snap.queue_depth, 42);
    }
}
