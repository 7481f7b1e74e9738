//! Logging setup for test runners embedding the engine.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Build the filter from `RUST_LOG`, falling back to `default`
#[must_use]
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a global subscriber.
///
/// Returns `false` if one was already installed (by an earlier call or by the
/// embedding runner); the existing subscriber is kept.
pub fn init_tracing(format: TelemetryFormat) -> bool {
    let filter = env_filter(DEFAULT_FILTER);
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        TelemetryFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        TelemetryFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    installed.is_ok()
}
