//! Per-session include cache options.

use std::time::Duration;

use incache_core::{parse_flag, ConfigError};

/// Parameter names understood by [`SessionOptions::from_parameters`].
pub const PARAM_SOURCE: &str = "source";
pub const PARAM_EXPIRES: &str = "expires";
pub const PARAM_PURGE: &str = "purge";
pub const PARAM_PREEMPTIVE: &str = "preemptive";
pub const PARAM_PARALLEL: &str = "parallel";

/// Policy requested for one include cache session.
///
/// `expires` left unset means the manager's configured default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub source: Option<String>,
    pub expires: Option<Duration>,
    pub purge: bool,
    pub preemptive: bool,
    pub parallel: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store entries under a resource-backed proxy rooted at `source`.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    pub fn with_preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Build options from named string parameters.
    ///
    /// Booleans accept `true/false`, `yes/no` and `1/0`. `expires` is in
    /// seconds; negative values clamp to zero. An empty `source` counts as
    /// absent.
    pub fn from_parameters<'a, I>(params: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (name, value) in params {
            match name {
                PARAM_SOURCE => {
                    let value = value.trim();
                    options.source = (!value.is_empty()).then(|| value.to_string());
                }
                PARAM_EXPIRES => options.expires = Some(parse_expires(value)?),
                PARAM_PURGE => options.purge = parse_flag(PARAM_PURGE, value)?,
                PARAM_PREEMPTIVE => options.preemptive = parse_flag(PARAM_PREEMPTIVE, value)?,
                PARAM_PARALLEL => options.parallel = parse_flag(PARAM_PARALLEL, value)?,
                other => {
                    tracing::debug!(parameter = %other, "Ignoring unknown include cache parameter")
                }
            }
        }
        Ok(options)
    }
}

fn parse_expires(raw: &str) -> Result<Duration, ConfigError> {
    let secs: i64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: PARAM_EXPIRES.to_string(),
        value: raw.to_string(),
        reason: "expected a number of seconds".to_string(),
    })?;
    Ok(Duration::from_secs(secs.max(0).unsigned_abs()))
}
