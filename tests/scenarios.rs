//! End-to-end scenarios driving the assembled preprocessor + detector
//! pipeline against small, hand-built trade/depth sequences.

use std::sync::Arc;

use orderflow_engine::config::test_support::scenario_settings;
use orderflow_engine::coordinator::{NullSignalManager, SignalCoordinator};
use orderflow_engine::detectors::absorption::AbsorptionDetector;
use orderflow_engine::detectors::exhaustion::ExhaustionDetector;
use orderflow_engine::detectors::zone::ZoneLifecycleDetector;
use orderflow_engine::detectors::Detector;
use orderflow_engine::metrics::PipelineMetrics;
use orderflow_engine::orderbook::DepthDiff;
use orderflow_engine::preprocessor::{AggTrade, OrderFlowPreprocessor};

fn trade(price: f64, qty: f64, buyer_is_maker: bool, ts: u64) -> AggTrade {
    AggTrade { trade_id: ts, price, quantity: qty, timestamp_ms: ts, buyer_is_maker }
}

/// Scenario A: repeated aggressive buying at the ask, with the ask
/// depleting and refilling each time without the price breaking through —
/// the textbook absorption signature, expected to surface as a sell-side
/// candidate (supply holding the level).
#[test]
fn scenario_a_ask_absorption_emits_sell_side_candidate() {
    let settings = scenario_settings();
    let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    let det = AbsorptionDetector::new(
        settings.absorption.clone(),
        settings.global.tick_size,
        settings.global.enhancement_mode,
        Arc::new(PipelineMetrics::new()),
    );

    pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: 500.0, ask_qty: 0.0, timestamp_ms: 0 }).unwrap();

    let mut emitted = false;
    for i in 0..8u64 {
        let ask_qty = 400.0;
        pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty, timestamp_ms: i * 10 }).unwrap();
        let enriched = pre.on_agg_trade(trade(100.01, 120.0, false, i * 10 + 5)).unwrap();
        pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 380.0, timestamp_ms: i * 10 + 6 }).unwrap();
        let out = det.on_enriched_trade(&enriched).unwrap();
        if out.iter().any(|c| c.side == orderflow_engine::detectors::Side::Sell) {
            emitted = true;
        }
    }
    assert!(emitted, "expected at least one sell-side absorption candidate");
}

/// Scenario B: the mirror image at the bid — aggressive selling absorbed
/// by resting bid liquidity, expected as a buy-side candidate.
#[test]
fn scenario_b_bid_absorption_emits_buy_side_candidate() {
    let settings = scenario_settings();
    let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    let det = AbsorptionDetector::new(
        settings.absorption.clone(),
        settings.global.tick_size,
        settings.global.enhancement_mode,
        Arc::new(PipelineMetrics::new()),
    );

    pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 500.0, timestamp_ms: 0 }).unwrap();

    let mut emitted = false;
    for i in 0..8u64 {
        pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: 400.0, ask_qty: 0.0, timestamp_ms: i * 10 }).unwrap();
        let enriched = pre.on_agg_trade(trade(100.00, 120.0, true, i * 10 + 5)).unwrap();
        pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: 380.0, ask_qty: 0.0, timestamp_ms: i * 10 + 6 }).unwrap();
        let out = det.on_enriched_trade(&enriched).unwrap();
        if out.iter().any(|c| c.side == orderflow_engine::detectors::Side::Buy) {
            emitted = true;
        }
    }
    assert!(emitted, "expected at least one buy-side absorption candidate");
}

/// Scenario C: balanced two-sided chop at modest size produces no
/// absorption or exhaustion candidates — neither side is depleting nor
/// being absorbed.
#[test]
fn scenario_c_balanced_chop_emits_nothing() {
    let settings = scenario_settings();
    let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    let absorption = AbsorptionDetector::new(
        settings.absorption.clone(),
        settings.global.tick_size,
        settings.global.enhancement_mode,
        Arc::new(PipelineMetrics::new()),
    );
    let exhaustion = ExhaustionDetector::new(settings.exhaustion.clone(), settings.global.tick_size, Arc::new(PipelineMetrics::new()));

    pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: 5_000.0, ask_qty: 0.0, timestamp_ms: 0 }).unwrap();
    pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 5_000.0, timestamp_ms: 0 }).unwrap();

    let mut any_signal = false;
    for i in 0..20u64 {
        let buyer_is_maker = i % 2 == 0;
        let price = if buyer_is_maker { 100.00 } else { 100.01 };
        let enriched = pre.on_agg_trade(trade(price, 5.0, buyer_is_maker, i * 10)).unwrap();
        if !absorption.on_enriched_trade(&enriched).unwrap().is_empty() {
            any_signal = true;
        }
        if !exhaustion.on_enriched_trade(&enriched).unwrap().is_empty() {
            any_signal = true;
        }
    }
    assert!(!any_signal, "balanced low-volume chop should not produce signals");
}

/// Scenario D: sustained one-sided aggressive buying at a single price
/// across enough trades for all three zone widths to agree — the
/// accumulation lifecycle should eventually reach a `Strengthened` or
/// `Completed` transition and surface a buy-side candidate.
#[test]
fn scenario_d_accumulation_confluence_emits_buy_side_candidate() {
    let settings = scenario_settings();
    let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    let det = ZoneLifecycleDetector::accumulation(settings.accumulation.clone(), Arc::new(PipelineMetrics::new()));

    let mut emitted = false;
    for i in 0..60u64 {
        let enriched = pre.on_agg_trade(trade(100.00, 250.0, false, i * 10)).unwrap();
        let out = det.on_enriched_trade(&enriched).unwrap();
        if !out.is_empty() {
            emitted = true;
        }
    }
    assert!(emitted, "expected accumulation lifecycle to surface a candidate");
}

/// Scenario E: aggressive selling grinds down bid depth with no refill —
/// exhaustion should report the bid (buy) side giving out.
#[test]
fn scenario_e_bid_exhaustion_emits_buy_side_candidate() {
    let settings = scenario_settings();
    let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    let det = ExhaustionDetector::new(settings.exhaustion.clone(), settings.global.tick_size, Arc::new(PipelineMetrics::new()));

    pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 1_000.0, timestamp_ms: 0 }).unwrap();
    let mut remaining: f64 = 100.0;
    let mut emitted = false;
    for i in 0..10u64 {
        remaining = (remaining - 30.0).max(1.0);
        pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: remaining, ask_qty: 0.0, timestamp_ms: i * 10 }).unwrap();
        let enriched = pre.on_agg_trade(trade(100.00, 30.0, true, i * 10 + 5)).unwrap();
        let out = det.on_enriched_trade(&enriched).unwrap();
        if out.iter().any(|c| c.side == orderflow_engine::detectors::Side::Buy) {
            emitted = true;
        }
    }
    assert!(emitted, "expected exhaustion to report the depleting bid side");
}

/// Scenario F: replaying the same event sequence through a fresh pipeline
/// twice produces the same sequence of emitted candidate sides — the
/// priority queue's tie-break chain (priority, timestamp, sequence) is
/// deterministic for identical input.
#[tokio::test]
async fn scenario_f_identical_replay_is_deterministic() {
    async fn run_once() -> Vec<orderflow_engine::detectors::Side> {
        let settings = scenario_settings();
        let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
        let absorption = AbsorptionDetector::new(
            settings.absorption.clone(),
            settings.global.tick_size,
            settings.global.enhancement_mode,
            Arc::new(PipelineMetrics::new()),
        );

        pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: 500.0, ask_qty: 0.0, timestamp_ms: 0 }).unwrap();

        let mut sides = Vec::new();
        for i in 0..8u64 {
            pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 400.0, timestamp_ms: i * 10 }).unwrap();
            let enriched = pre.on_agg_trade(trade(100.01, 120.0, false, i * 10 + 5)).unwrap();
            pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 380.0, timestamp_ms: i * 10 + 6 }).unwrap();
            for candidate in absorption.on_enriched_trade(&enriched).unwrap() {
                sides.push(candidate.side);
            }
        }
        sides
    }

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

/// Exercises the coordinator end-to-end with a real worker task and the
/// null signal manager, confirming candidates flow through without panics
/// or deadlock.
#[tokio::test]
async fn coordinator_drains_queued_candidates_without_manager() {
    let settings = scenario_settings();
    let pre = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    let metrics = Arc::new(PipelineMetrics::new());
    let manager = Arc::new(NullSignalManager);
    let mut coordinator = SignalCoordinator::new(settings.coordinator.clone(), manager, metrics.clone());
    coordinator.register(Box::new(AbsorptionDetector::new(
        settings.absorption.clone(),
        settings.global.tick_size,
        settings.global.enhancement_mode,
        metrics.clone(),
    )));
    let _worker = coordinator.start();

    pre.on_depth_diff(DepthDiff { price: 100.00, bid_qty: 500.0, ask_qty: 0.0, timestamp_ms: 0 }).unwrap();
    for i in 0..8u64 {
        pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 400.0, timestamp_ms: i * 10 }).unwrap();
        let enriched = pre.on_agg_trade(trade(100.01, 120.0, false, i * 10 + 5)).unwrap();
        pre.on_depth_diff(DepthDiff { price: 100.01, bid_qty: 0.0, ask_qty: 380.0, timestamp_ms: i * 10 + 6 }).unwrap();
        coordinator.on_enriched_trade(&enriched);
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
