//! Signal coordinator: runs registered detectors against each enriched
//! trade, queues resulting candidates by priority, and drives them through
//! an external `SignalManager` with bounded retry and a per-attempt
//! deadline.
//!
//! Grounded on `rust-backend/src/vault/orderflow_paper::spawn_orderflow_paper_engine`
//! (mpsc-fed background worker) and `rust-backend/src/signals/correlator.rs`'s
//! `SignalCorrelator`, which is the teacher's own shape for "hand a
//! processed signal to a narrow external collaborator" — generalized here
//! into the `SignalManager` trait so this crate never depends on a
//! concrete downstream implementation. `start()`/`stop()` follow the
//! teacher's `LoadGenerator` (`rust-backend/src/performance/load_generator.rs`):
//! an `Arc<AtomicBool>` flag the worker task polls, flipped by the two
//! public methods rather than tied to construction/drop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CoordinatorSettings;
use crate::detectors::{next_sequence, Detector, DetectorError, SignalCandidate, Side};
use crate::metrics::PipelineMetrics;
use crate::preprocessor::EnrichedTrade;

/// A candidate that has passed the external `SignalManager`'s validation,
/// deduplication, and cross-detector correlation. `final_price` and
/// `final_confidence` may differ from the originating candidate's when
/// correlation with other candidates adjusts them; `correlated_candidates`
/// names the other `SignalCandidate`s (by id) that contributed.
#[derive(Debug, Clone)]
pub struct ConfirmedSignal {
    pub candidate: SignalCandidate,
    pub final_price: crate::financial_math::Price,
    pub final_confidence: f64,
    pub correlated_candidates: Vec<Uuid>,
}

/// External collaborator that consumes validated signal candidates.
/// Deduplication, persistence, and broadcast all live on the other side of
/// this boundary; this crate only defines the contract and dispatches to it.
pub trait SignalManager: Send + Sync {
    fn handle(&self, candidate: SignalCandidate) -> Option<ConfirmedSignal>;
}

/// No-op `SignalManager`, used when no downstream collaborator is wired —
/// e.g. the demo binary. Always returns `None`: nothing is ever confirmed.
pub struct NullSignalManager;

impl SignalManager for NullSignalManager {
    fn handle(&self, candidate: SignalCandidate) -> Option<ConfirmedSignal> {
        tracing::info!(id = %candidate.id, detector = candidate.detector_id, confidence = candidate.confidence, "signal (no manager wired)");
        None
    }
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    DetectorRegistered { detector_id: &'static str },
    SignalQueued { id: Uuid, detector_id: &'static str },
    SignalProcessed { id: Uuid, attempt: u32, confirmed: bool },
    SignalFailed { id: Uuid, attempt: u32, reason: String },
    DetectorError { detector_id: &'static str, reason: &'static str },
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::DetectorRegistered { detector_id } => {
            tracing::info!(detector = *detector_id, "detector registered")
        }
        CoordinatorEvent::SignalQueued { id, detector_id } => {
            tracing::debug!(id = %id, detector = *detector_id, "signal queued")
        }
        CoordinatorEvent::SignalProcessed { id, attempt, confirmed } => {
            tracing::debug!(id = %id, attempt, confirmed, "signal processed")
        }
        CoordinatorEvent::SignalFailed { id, attempt, reason } => {
            tracing::warn!(id = %id, attempt, reason, "signal processing failed")
        }
        CoordinatorEvent::DetectorError { detector_id, reason } => {
            tracing::warn!(detector = *detector_id, reason, "detector error")
        }
    }
}

/// `true` if `side` matches the type family implied by `detector_id` — e.g.
/// the accumulation detector can only ever mean "buy-side building", so a
/// candidate of any other side from it is a bug in the detector, not a
/// legitimate signal.
fn side_matches_type_family(detector_id: &str, side: Side) -> bool {
    match detector_id {
        "accumulation" => side == Side::Buy,
        "distribution" => side == Side::Sell,
        _ => true,
    }
}

/// Schema/sanity check applied to every candidate before it is allowed onto
/// the priority queue: finite confidence in range, a price that resolves to
/// a finite float, a type this registration declared it may emit, and a
/// side consistent with that type.
fn validate_candidate(reg: &RegisteredDetector, candidate: &SignalCandidate) -> bool {
    if !candidate.confidence.is_finite() || !(0.0..=1.0).contains(&candidate.confidence) {
        return false;
    }
    if !candidate.price.to_f64().is_finite() {
        return false;
    }
    if !reg.accepted_types.contains(&candidate.detector_id) {
        return false;
    }
    side_matches_type_family(candidate.detector_id, candidate.side)
}

struct QueuedSignal {
    candidate: SignalCandidate,
    priority: u32,
    sequence: u64,
}

impl QueuedSignal {
    fn new(candidate: SignalCandidate, priority: u32) -> Self {
        Self { sequence: next_sequence(), priority, candidate }
    }
}

impl PartialEq for QueuedSignal {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
            && self.candidate.timestamp_ms == other.candidate.timestamp_ms
            && self.sequence == other.sequence
    }
}
impl Eq for QueuedSignal {}

impl PartialOrd for QueuedSignal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSignal {
    /// Reversed so `BinaryHeap` (a max-heap) pops the lowest `priority`
    /// value first, ties broken by earliest timestamp, then earliest
    /// sequence — deterministic replay for identical input streams.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.candidate.timestamp_ms.cmp(&self.candidate.timestamp_ms))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// One entry in the coordinator's detector registry: the detector itself
/// plus the metadata the coordinator needs to validate and prioritize its
/// output without reaching back into detector-specific logic.
struct RegisteredDetector {
    detector: Box<dyn Detector>,
    accepted_types: Vec<&'static str>,
    priority: u32,
    enabled: bool,
}

pub struct SignalCoordinator {
    settings: CoordinatorSettings,
    detectors: Vec<RegisteredDetector>,
    metrics: Arc<PipelineMetrics>,
    manager: Arc<dyn SignalManager>,
    tx: mpsc::Sender<QueuedSignal>,
    rx: Mutex<Option<mpsc::Receiver<QueuedSignal>>>,
    running: Arc<AtomicBool>,
}

impl SignalCoordinator {
    /// Construct the coordinator. The worker task is not spawned until
    /// `start()` is called, so detectors can be registered first without
    /// racing a live worker.
    pub fn new(settings: CoordinatorSettings, manager: Arc<dyn SignalManager>, metrics: Arc<PipelineMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        Self {
            settings,
            detectors: Vec::new(),
            metrics,
            manager,
            tx,
            rx: Mutex::new(Some(rx)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a detector with an explicit accepted-candidate-type list,
    /// queue priority (lower values are drained first), and enabled flag.
    /// Call before feeding any trades — the registry is not safe to mutate
    /// concurrently with `on_enriched_trade`.
    pub fn register_detector(&mut self, detector: Box<dyn Detector>, accepted_types: Vec<&'static str>, priority: u32, enabled: bool) {
        log_event(&CoordinatorEvent::DetectorRegistered { detector_id: detector.id() });
        self.detectors.push(RegisteredDetector { detector, accepted_types, priority, enabled });
    }

    /// Convenience registration for a detector that only ever emits
    /// candidates under its own id, at default priority, enabled.
    pub fn register(&mut self, detector: Box<dyn Detector>) {
        let accepted_types = vec![detector.id()];
        self.register_detector(detector, accepted_types, 0, true);
    }

    /// Spawn the worker task that drains the priority queue into the
    /// `SignalManager`. Must be called from within a Tokio runtime; calling
    /// it more than once panics, since the channel receiver can only be
    /// taken once.
    pub fn start(&self) -> JoinHandle<()> {
        self.running.store(true, AtomicOrdering::SeqCst);
        let rx = self.rx.lock().take().expect("SignalCoordinator::start called more than once");
        tokio::spawn(Self::worker_loop(rx, self.manager.clone(), self.settings.clone(), self.running.clone()))
    }

    /// Signal the worker task to stop after its current batch. Does not
    /// block on the task actually exiting — hold the `JoinHandle` from
    /// `start()` for that.
    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
    }

    /// Run every registered, enabled detector against `trade`, validate any
    /// resulting candidates, and enqueue the survivors. Synchronous —
    /// detectors must not block.
    pub fn on_enriched_trade(&self, trade: &EnrichedTrade) {
        for reg in &self.detectors {
            if !reg.enabled {
                continue;
            }
            let detector = reg.detector.as_ref();
            let started = std::time::Instant::now();
            let result = detector.on_enriched_trade(trade);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms > self.settings.detector_deadline_ms {
                self.metrics.record_detector_error(detector.id());
                log_event(&CoordinatorEvent::DetectorError { detector_id: detector.id(), reason: "deadline_exceeded" });
            }
            match result {
                Ok(candidates) => {
                    for candidate in candidates {
                        if !validate_candidate(reg, &candidate) {
                            log_event(&CoordinatorEvent::DetectorError { detector_id: detector.id(), reason: "invalid_candidate" });
                            continue;
                        }
                        log_event(&CoordinatorEvent::SignalQueued { id: candidate.id, detector_id: detector.id() });
                        let queued = QueuedSignal::new(candidate, reg.priority);
                        if self.tx.try_send(queued).is_err() {
                            tracing::warn!(detector = detector.id(), "signal queue full, dropping candidate");
                        }
                    }
                }
                Err(DetectorError::InsufficientData) => {
                    self.metrics.record_detector_error(detector.id());
                    log_event(&CoordinatorEvent::DetectorError { detector_id: detector.id(), reason: "insufficient_data" });
                }
                Err(DetectorError::CircuitOpen) => {
                    log_event(&CoordinatorEvent::DetectorError { detector_id: detector.id(), reason: "circuit_open" });
                }
            }
        }
        let depth = self.settings.queue_capacity.saturating_sub(self.tx.capacity());
        self.metrics.set_queue_depth(depth);
    }

    async fn worker_loop(
        mut rx: mpsc::Receiver<QueuedSignal>,
        manager: Arc<dyn SignalManager>,
        settings: CoordinatorSettings,
        running: Arc<AtomicBool>,
    ) {
        let mut heap: BinaryHeap<QueuedSignal> = BinaryHeap::new();
        while running.load(AtomicOrdering::SeqCst) {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(queued) => {
                            heap.push(queued);
                            while let Ok(queued) = rx.try_recv() {
                                heap.push(queued);
                            }
                            while let Some(queued) = heap.pop() {
                                Self::process_with_retry(manager.as_ref(), &settings, queued.candidate).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// `SignalManager::handle` itself never reports failure — it either
    /// confirms a signal or doesn't — so the only retryable failure mode
    /// left is blowing the per-attempt deadline.
    async fn process_with_retry(manager: &dyn SignalManager, settings: &CoordinatorSettings, candidate: SignalCandidate) {
        let id = candidate.id;
        for attempt in 1..=settings.max_retries {
            let candidate_for_attempt = candidate.clone();
            let outcome = tokio::time::timeout(
                Duration::from_millis(settings.signal_processing_timeout_ms),
                async { manager.handle(candidate_for_attempt) },
            )
            .await;

            match outcome {
                Ok(confirmed) => {
                    log_event(&CoordinatorEvent::SignalProcessed { id, attempt, confirmed: confirmed.is_some() });
                    return;
                }
                Err(_elapsed) => {
                    log_event(&CoordinatorEvent::SignalFailed { id, attempt, reason: "timed out".to_string() });
                }
            }
        }
    }
}
