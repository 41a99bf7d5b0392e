//! `tracing-subscriber` setup for binaries embedding the dispatch core.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Output format of the process-wide log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-line output for development.
    Pretty,
    /// One JSON object per line for log shippers.
    Json,
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info` filter.
///
/// Returns `false` if a global subscriber was already installed, which makes
/// repeated calls (tests, embedding applications) harmless.
#[must_use]
pub fn init(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    }
}
