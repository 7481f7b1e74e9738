//! Engine configuration
//!
//! Loaded once per run (YAML file, then environment overrides) and handed to
//! a [`Session`](crate::orchestrator::Session) by value.

use crate::result::{FlowError, FlowResult};
use crate::retry::RetryPolicy;
use crate::wait::{
    WaitCondition, WaitDefaults, DEFAULT_POLL_INTERVAL_MS, DEFAULT_WAIT_TIMEOUT_MS, MAX_GRACE_MS,
    MIN_POLL_INTERVAL_MS, NETWORK_IDLE_THRESHOLD_MS,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FLOWGUARD_";

/// Login material for the system under test
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password (never serialized or printed)
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable run parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL that relative navigation paths are joined to
    pub base_url: String,
    /// Default wait timeout
    pub default_timeout_ms: u64,
    /// Default polling interval
    pub poll_interval_ms: u64,
    /// Polling floor
    pub min_poll_interval_ms: u64,
    /// Trailing grace applied after standalone wait steps
    pub grace_period_ms: u64,
    /// Stability window for network quiescence
    pub network_idle_ms: u64,
    /// Retry budget for locator/wait/action steps
    pub retry: RetryPolicy,
    /// Credentials, if the run logs in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            min_poll_interval_ms: MIN_POLL_INTERVAL_MS,
            grace_period_ms: 0,
            network_idle_ms: NETWORK_IDLE_THRESHOLD_MS,
            retry: RetryPolicy::default(),
            credentials: None,
        }
    }
}

impl EngineConfig {
    /// Create a default config
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the default timeout
    #[must_use]
    pub const fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    /// Set the default polling interval
    #[must_use]
    pub const fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the network idle window
    #[must_use]
    pub const fn with_network_idle_ms(mut self, ms: u64) -> Self {
        self.network_idle_ms = ms;
        self
    }

    /// Set the polling floor
    #[must_use]
    pub const fn with_min_poll_interval_ms(mut self, ms: u64) -> Self {
        self.min_poll_interval_ms = ms;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parse YAML
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or the values are invalid.
    pub fn from_yaml_str(yaml: &str) -> FlowResult<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Apply `FLOWGUARD_*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse or the result
    /// is invalid.
    pub fn apply_env(self) -> FlowResult<Self> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse or the result
    /// is invalid.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> FlowResult<Self> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
        let number = |suffix: &str| -> FlowResult<Option<u64>> {
            var(suffix)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|e| {
                        FlowError::config(format!("{ENV_PREFIX}{suffix}={raw:?}: {e}"))
                    })
                })
                .transpose()
        };

        if let Some(url) = var("BASE_URL") {
            self.base_url = url;
        }
        if let Some(ms) = number("TIMEOUT_MS")? {
            self.default_timeout_ms = ms;
        }
        if let Some(ms) = number("POLL_MS")? {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = number("NETWORK_IDLE_MS")? {
            self.network_idle_ms = ms;
        }
        if let Some(n) = number("RETRY_ATTEMPTS")? {
            self.retry.max_attempts = u32::try_from(n)
                .map_err(|_| FlowError::config(format!("{ENV_PREFIX}RETRY_ATTEMPTS too large: {n}")))?;
        }
        match (var("USERNAME"), var("PASSWORD")) {
            (Some(username), password) => {
                self.credentials = Some(Credentials {
                    username,
                    password: password.unwrap_or_default(),
                });
            }
            (None, Some(password)) => {
                if let Some(credentials) = self.credentials.as_mut() {
                    credentials.password = password;
                }
            }
            (None, None) => {}
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants
    ///
    /// # Errors
    ///
    /// Returns a config error on zero timeouts, sub-floor polling, or a zero
    /// retry budget.
    pub fn validate(&self) -> FlowResult<()> {
        if self.default_timeout_ms == 0 {
            return Err(FlowError::config("default_timeout_ms must be greater than 0"));
        }
        if self.min_poll_interval_ms == 0 {
            return Err(FlowError::config("min_poll_interval_ms must be greater than 0"));
        }
        if self.poll_interval_ms < self.min_poll_interval_ms {
            return Err(FlowError::config(format!(
                "poll_interval_ms ({}) is below the floor of {}ms",
                self.poll_interval_ms, self.min_poll_interval_ms
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(FlowError::config("retry.max_attempts must be at least 1"));
        }
        if self.grace_period_ms > MAX_GRACE_MS {
            return Err(FlowError::config(format!(
                "grace_period_ms ({}) exceeds {MAX_GRACE_MS}ms",
                self.grace_period_ms
            )));
        }
        Ok(())
    }

    /// Wait timing derived from this config.
    ///
    /// A zero polling floor (possible for configs built in code and never
    /// validated) falls back to [`MIN_POLL_INTERVAL_MS`].
    #[must_use]
    pub const fn wait_defaults(&self) -> WaitDefaults {
        let floor = if self.min_poll_interval_ms == 0 {
            MIN_POLL_INTERVAL_MS
        } else {
            self.min_poll_interval_ms
        };
        WaitDefaults {
            timeout: Duration::from_millis(self.default_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            min_poll_interval: Duration::from_millis(floor),
            max_grace: Duration::from_millis(MAX_GRACE_MS),
        }
    }

    /// Stability window for network quiescence
    #[must_use]
    pub const fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }

    /// Network-quiescent condition using the configured idle window
    #[must_use]
    pub fn network_quiescent(&self) -> WaitCondition {
        WaitCondition::network_quiescent(self.network_idle())
    }

    /// Join a navigation target to the base URL; absolute URLs pass through
    #[must_use]
    pub fn resolve_url(&self, target: &str) -> String {
        if target.contains("://") || self.base_url.is_empty() {
            return target.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            target.trim_start_matches('/')
        )
    }
}
