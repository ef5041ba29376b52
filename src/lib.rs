//! Order-flow signal engine
//!
//! Ingests a single-pair stream of aggregated trades and order-book depth
//! diffs and emits trading-signal candidates for institutional order-flow
//! patterns: liquidity absorption, liquidity exhaustion, and multi-timeframe
//! accumulation/distribution. Downstream validation, deduplication, and
//! broadcast are external collaborators — see `coordinator::SignalManager`.

pub mod config;
pub mod coordinator;
pub mod detectors;
pub mod error;
pub mod financial_math;
pub mod metrics;
pub mod orderbook;
pub mod pool;
pub mod preprocessor;
pub mod rolling_window;

pub use config::Settings;
pub use error::CoreError;
pub use financial_math::{Price, Quantity};
