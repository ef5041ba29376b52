//! Typed error taxonomy for the hot path.
//!
//! The hot path never throws: detector and preprocessor failures become
//! counter increments and circuit-breaker state (see `metrics`), and
//! calculations that cannot be performed return `None`, never a fabricated
//! default. `CoreError` exists for the categories that genuinely need to be
//! matched on by a caller — validation, book consistency, and startup
//! configuration. Everything else (e.g. fatal startup I/O) stays behind
//! `anyhow::Result` at the process boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("order book inconsistency: {0}")]
    BookConsistency(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
