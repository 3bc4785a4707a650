//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events. Binaries and tests that want to
//! see them call [`init_tracing`] once at startup.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directive. Falls back to `RUST_LOG`.
pub const ENV_LOG: &str = "INCACHE_LOG";

/// Environment variable selecting JSON output.
pub const ENV_LOG_JSON: &str = "INCACHE_LOG_JSON";

const DEFAULT_FILTER: &str = "incache_include=info,incache_storage=info,warn";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter {filter}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter directive, e.g. `incache_include=debug`
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let filter = lookup(ENV_LOG)
            .or_else(|| lookup("RUST_LOG"))
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let json = lookup(ENV_LOG_JSON)
            .map(|s| s == "true" || s == "1")
            .unwrap_or(false);
        Self { filter, json }
    }
}

/// Install the global subscriber.
///
/// Returns [`TelemetryError::Init`] if a global subscriber is already set,
/// which callers sharing a process (tests) may ignore.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_new(&config.filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: config.filter.clone(),
            reason: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(filter = %config.filter, json = config.json, "Telemetry initialized");
    Ok(())
}
