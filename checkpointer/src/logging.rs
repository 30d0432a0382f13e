//! Tracing setup.
//!
//! Structured logs through `tracing`, with JSON output available for log
//! aggregation. Initialize once at startup; the level acts as the
//! default and `RUST_LOG` can still override per-target filters.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    Init(String),
}

/// Initialize the global tracing subscriber.
///
/// `level` is the default directive (e.g. "info"); set `json` for
/// machine-readable output.
pub fn init_logging(level: &str, json: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_reports_error() {
        // First call may or may not win depending on test ordering;
        // the second is guaranteed to fail cleanly either way.
        let _ = init_logging("info", false);
        assert!(init_logging("info", false).is_err());
    }
}
