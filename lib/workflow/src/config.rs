//! Engine configuration.
//!
//! Loaded via the `config` crate from environment variables prefixed
//! `SWITCHYARD`, with `__` separating nested keys:
//!
//! ```text
//! SWITCHYARD__RETRY__BASE_DELAY_MS=500
//! SWITCHYARD__BREAKER__COUNT_RATE_LIMITS=false
//! SWITCHYARD__NATS__URL=nats://localhost:4222
//! ```
//!
//! Every field has a default, so an empty environment yields a usable config.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::failure::RetryPolicy;
use crate::nats::NatsConfig;
use crate::queue::QueueRouter;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment prefix for engine settings.
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Backoff delays for nodes using the `retry` error policy. The retry
    /// count itself comes from each node's `settings.retry.max_attempts`.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Maximum duration of one node execution, in seconds.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Defaults for circuit breakers.
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Extra node-type to queue routes, layered over the built-in table.
    #[serde(default)]
    pub queues: BTreeMap<String, String>,

    /// Process environment variables with this prefix are visible to
    /// expressions under `env`, with the prefix stripped.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    /// NATS transport; in-memory collaborators are used when absent.
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

/// Retry backoff defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Circuit breaker defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_breaker_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Set to false in development so a noisy rate limit does not trip
    /// breakers.
    #[serde(default = "default_count_rate_limits")]
    pub count_rate_limits: bool,
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_env_prefix() -> String {
    "SWITCHYARD_VAR_".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout_secs() -> u64 {
    30
}

fn default_window_secs() -> u64 {
    60
}

fn default_count_rate_limits() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_breaker_timeout_secs(),
            window_secs: default_window_secs(),
            count_rate_limits: default_count_rate_limits(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            node_timeout_secs: default_node_timeout_secs(),
            breaker: BreakerSettings::default(),
            queues: BTreeMap::new(),
            env_prefix: default_env_prefix(),
            nats: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Loads configuration from an explicit variable map instead of the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_vars(vars: config::Map<String, String>) -> Result<Self, config::ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<config::Map<String, String>>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()
    }

    /// Backoff defaults. Retries stay off unless a node asks for them.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            success_threshold: self.breaker.success_threshold,
            timeout: Duration::from_secs(self.breaker.timeout_secs),
            window: Duration::from_secs(self.breaker.window_secs),
            count_rate_limits: self.breaker.count_rate_limits,
        }
    }

    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    #[must_use]
    pub fn router(&self) -> QueueRouter {
        QueueRouter::default().with_routes(self.queues.clone())
    }

    /// Variables exposed to expressions, read from the process environment.
    #[must_use]
    pub fn expression_env(&self) -> BTreeMap<String, String> {
        env_subset(std::env::vars(), &self.env_prefix)
    }
}

/// Keeps variables starting with `prefix` and strips the prefix.
pub fn env_subset(
    vars: impl IntoIterator<Item = (String, String)>,
    prefix: &str,
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = EngineConfig::from_vars(vars(&[])).expect("config");
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.node_timeout(), Duration::from_secs(300));
        assert_eq!(config.breaker_config(), CircuitBreakerConfig::default());
        assert_eq!(config.env_prefix, "SWITCHYARD_VAR_");
        assert!(config.nats.is_none());
    }

    #[test]
    fn nested_keys_use_double_underscore() {
        let config = EngineConfig::from_vars(vars(&[
            ("SWITCHYARD__RETRY__BASE_DELAY_MS", "500"),
            ("SWITCHYARD__BREAKER__COUNT_RATE_LIMITS", "false"),
            ("SWITCHYARD__NODE_TIMEOUT_SECS", "12"),
            ("SWITCHYARD__QUEUES__LOGIC", "fast"),
            ("UNRELATED", "ignored"),
        ]))
        .expect("config");

        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(500));
        assert!(!config.breaker.count_rate_limits);
        assert_eq!(config.node_timeout_secs, 12);
        assert_eq!(config.router().route("logic.if"), "fast");
    }

    #[test]
    fn default_config_matches_empty_environment() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_policy(), RetryPolicy::no_retry());
    }

    #[test]
    fn env_subset_strips_prefix() {
        let env = env_subset(
            [
                ("SWITCHYARD_VAR_REGION".to_string(), "eu".to_string()),
                ("SWITCHYARD_VAR_".to_string(), "empty".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ],
            "SWITCHYARD_VAR_",
        );
        assert_eq!(env.len(), 1);
        assert_eq!(env["REGION"], "eu");
    }
}
