//! Configuration for the coordination core.
//!
//! Every timing constant here is an empirically tuned default, not a value
//! derived from identity-provider guarantees, so all of them can be set from
//! a YAML file or overridden through `AUTHCOORD_*` environment variables.
//!
//! ```yaml
//! propagation_window: 30s
//! readiness:
//!   poll_interval: 250ms
//!   timeout: 5s
//! retry:
//!   max_attempts: 3
//!   backoff: exponential_with_jitter
//! rate_limit:
//!   sweep_interval: 1m
//!   policies:
//!     login: { max_attempts: 5, window: 15m, block: 30m }
//! ```

use crate::error::ConfigError;
use crate::rate_limit::PolicyTable;
use crate::retry::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_READINESS_TIMEOUT: &str = "AUTHCOORD_READINESS_TIMEOUT";
pub const ENV_POLL_INTERVAL: &str = "AUTHCOORD_POLL_INTERVAL";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "AUTHCOORD_RETRY_MAX_ATTEMPTS";
pub const ENV_PROPAGATION_WINDOW: &str = "AUTHCOORD_PROPAGATION_WINDOW";
pub const ENV_SWEEP_INTERVAL: &str = "AUTHCOORD_SWEEP_INTERVAL";

// ============================================================================
// Sections
// ============================================================================

/// Readiness polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Delay between probe attempts
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Default overall wait before giving up
    #[serde(default = "default_readiness_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How long a confirmed readiness is reused without re-probing
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

const fn default_readiness_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            timeout: default_readiness_timeout(),
            grace_period: default_grace_period(),
        }
    }
}

/// Coordinated retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Default attempt budget when the caller does not pass one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Delay before the first retry
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Readiness wait granted before each attempt
    #[serde(default = "default_per_attempt_timeout", with = "humantime_serde")]
    pub per_attempt_readiness_timeout: Duration,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_per_attempt_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            per_attempt_readiness_timeout: default_per_attempt_timeout(),
        }
    }
}

/// Rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(flatten)]
    pub table: PolicyTable,

    /// Cadence of the stale-entry sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Also clear the signed-out subject's rate limit records on sign-out
    #[serde(default)]
    pub reset_on_sign_out: bool,
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            table: PolicyTable::default(),
            sweep_interval: default_sweep_interval(),
            reset_on_sign_out: false,
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Permission denials within this long of credential issuance are retried
    #[serde(default = "default_propagation_window", with = "humantime_serde")]
    pub propagation_window: Duration,
}

const fn default_propagation_window() -> Duration {
    Duration::from_secs(30)
}

impl CoordinatorConfig {
    /// Parse and validate YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded coordinator config");
        Ok(config)
    }

    /// Apply `AUTHCOORD_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(d) = env_duration(ENV_READINESS_TIMEOUT)? {
            self.readiness.timeout = d;
        }
        if let Some(d) = env_duration(ENV_POLL_INTERVAL)? {
            self.readiness.poll_interval = d;
        }
        if let Some(d) = env_duration(ENV_PROPAGATION_WINDOW)? {
            self.propagation_window = d;
        }
        if let Some(d) = env_duration(ENV_SWEEP_INTERVAL)? {
            self.rate_limit.sweep_interval = d;
        }
        if let Ok(raw) = std::env::var(ENV_RETRY_MAX_ATTEMPTS) {
            self.retry.max_attempts = raw.trim().parse().map_err(|e| ConfigError::Env {
                var: ENV_RETRY_MAX_ATTEMPTS.to_string(),
                details: format!("{e}"),
            })?;
        }
        Ok(())
    }

    /// Reject values that would make the coordinator spin or never allow anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "readiness.poll_interval must be non-zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.rate_limit.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "rate_limit.sweep_interval must be non-zero".to_string(),
            ));
        }
        let table = &self.rate_limit.table;
        for (name, policy) in table
            .policies
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(std::iter::once(("fallback", &table.fallback)))
        {
            if policy.max_attempts == 0 || policy.window.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "rate limit policy '{name}' needs max_attempts > 0 and a non-zero window"
                )));
            }
        }
        Ok(())
    }
}

fn env_duration(var: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: var.to_string(),
                details: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Serde adapter for humantime duration strings (`"250ms"`, `"15m"`).
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
