//! Include cache configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! disable caching unless a session asks for it. Unlike request options,
//! malformed environment values fail fast.

use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable enabling the preemptive refresh worker.
pub const ENV_PREEMPTIVE_ENABLED: &str = "INCACHE_PREEMPTIVE_ENABLED";

/// Environment variable with the default expiry, in seconds.
pub const ENV_DEFAULT_EXPIRES_SECS: &str = "INCACHE_DEFAULT_EXPIRES_SECS";

/// Process-level settings for the include cache manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeCacheConfig {
    /// Whether sessions may run in preemptive mode. When false, sessions
    /// requesting it are downgraded.
    pub preemptive_enabled: bool,
    /// Expiry used when a session does not specify one. Zero disables caching.
    pub default_expires: Duration,
}

impl Default for IncludeCacheConfig {
    fn default() -> Self {
        Self {
            preemptive_enabled: false,
            default_expires: Duration::ZERO,
        }
    }
}

impl IncludeCacheConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the preemptive worker.
    pub fn with_preemptive(mut self, enabled: bool) -> Self {
        self.preemptive_enabled = enabled;
        self
    }

    /// Set the default expiry.
    pub fn with_default_expires(mut self, expires: Duration) -> Self {
        self.default_expires = expires;
        self
    }

    /// Create config from environment variables.
    ///
    /// Environment variables:
    /// - `INCACHE_PREEMPTIVE_ENABLED`: "true"/"false"/"1"/"0" (default: false)
    /// - `INCACHE_DEFAULT_EXPIRES_SECS`: non-negative integer (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_PREEMPTIVE_ENABLED) {
            config.preemptive_enabled = parse_flag(ENV_PREEMPTIVE_ENABLED, &raw)?;
        }

        if let Some(raw) = lookup(ENV_DEFAULT_EXPIRES_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: ENV_DEFAULT_EXPIRES_SECS.to_string(),
                value: raw.clone(),
                reason: "expected a non-negative number of seconds".to_string(),
            })?;
            config.default_expires = Duration::from_secs(secs);
        }

        tracing::debug!(
            preemptive_enabled = config.preemptive_enabled,
            default_expires_secs = config.default_expires.as_secs(),
            "Loaded include cache config"
        );
        Ok(config)
    }
}

/// Parse a boolean flag the way request options and environment both spell it.
pub fn parse_flag(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
