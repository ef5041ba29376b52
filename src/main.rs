//! Demo binary: replays a newline-delimited JSON event file (or stdin)
//! through the full pipeline and logs emitted signal candidates.
//!
//! Wiring a real exchange feed, a persistence layer, or an HTTP surface is
//! explicitly out of scope — see `SPEC_FULL.md`'s Non-goals. This binary
//! exists to exercise the assembled crate end-to-end, the way the teacher's
//! own small example binaries do.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use orderflow_engine::config::Settings;
use orderflow_engine::coordinator::{NullSignalManager, SignalCoordinator};
use orderflow_engine::detectors::absorption::AbsorptionDetector;
use orderflow_engine::detectors::cvd::CvdDetector;
use orderflow_engine::detectors::exhaustion::ExhaustionDetector;
use orderflow_engine::detectors::zone::ZoneLifecycleDetector;
use orderflow_engine::metrics::PipelineMetrics;
use orderflow_engine::orderbook::DepthDiff;
use orderflow_engine::preprocessor::{AggTrade, OrderFlowPreprocessor};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "orderflow-engine")]
struct Args {
    /// Path to the configuration file (JSON). Falls back to $CONFIG_PATH.
    #[arg(long, env = "CONFIG_PATH")]
    config: PathBuf,

    /// Newline-delimited JSON event file to replay. Reads stdin if absent.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event {
    Trade {
        trade_id: u64,
        price: f64,
        quantity: f64,
        timestamp_ms: u64,
        buyer_is_maker: bool,
    },
    DepthDiff {
        price: f64,
        bid_qty: f64,
        ask_qty: f64,
        timestamp_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config_str = std::fs::read_to_string(&args.config)?;
    let settings = Settings::from_json_str(&config_str)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(settings, args.events))
}

async fn run(settings: Settings, events_path: Option<PathBuf>) -> anyhow::Result<()> {
    let preprocessor = OrderFlowPreprocessor::new(&settings.global, 1_500, 5_000);
    preprocessor.book().on_stream_connected();

    let metrics = Arc::new(PipelineMetrics::new());
    let manager = Arc::new(NullSignalManager);
    let mut coordinator = SignalCoordinator::new(settings.coordinator.clone(), manager, metrics.clone());

    coordinator.register(Box::new(AbsorptionDetector::new(
        settings.absorption.clone(),
        settings.global.tick_size,
        settings.global.enhancement_mode,
        metrics.clone(),
    )));
    coordinator.register(Box::new(ExhaustionDetector::new(settings.exhaustion.clone(), settings.global.tick_size, metrics.clone())));
    coordinator.register(Box::new(ZoneLifecycleDetector::accumulation(settings.accumulation.clone(), metrics.clone())));
    coordinator.register(Box::new(ZoneLifecycleDetector::distribution(settings.distribution.clone(), metrics.clone())));
    coordinator.register(Box::new(CvdDetector::new(settings.cvd.clone(), settings.global.tick_size, metrics.clone())));
    let _worker = coordinator.start();

    let reader: Box<dyn BufRead> = match &events_path {
        Some(path) => Box::new(std::io::BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)?;
        match event {
            Event::DepthDiff { price, bid_qty, ask_qty, timestamp_ms } => {
                if let Err(fault) = preprocessor.on_depth_diff(DepthDiff { price, bid_qty, ask_qty, timestamp_ms }) {
                    tracing::warn!(?fault, "depth diff rejected");
                }
            }
            Event::Trade { trade_id, price, quantity, timestamp_ms, buyer_is_maker } => {
                let trade = AggTrade { trade_id, price, quantity, timestamp_ms, buyer_is_maker };
                if let Some(enriched) = preprocessor.on_agg_trade(trade) {
                    coordinator.on_enriched_trade(&enriched);
                }
            }
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}
