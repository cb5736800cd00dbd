//! # Environment-Based Configuration
//!
//! Per-connection settings for the pub/sub core, loadable from the
//! environment so deployments can tune them without rebuilds.
//!
//! ## Environment Variables
//!
//! - `AGENTBUS_DEFAULT_TIMEOUT_MS` - Default wait for a publish result in ms (default: 10000)
//! - `AGENTBUS_MAX_PENDING` - Maximum outstanding publish results (default: 10000)
//! - `AGENTBUS_PENDING_TTL_SECS` - Age after which unresolved results are failed (default: 60)
//! - `AGENTBUS_CLEANUP_INTERVAL_SECS` - Interval of the expired-result sweep (default: 30)
//! - `AGENTBUS_METRICS_MAX_TOPICS` - Topic roots tracked by metrics (default: 20)

use std::{env, time::Duration};

use crate::error::PubSubError;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for PubSubError {
    fn from(err: ConfigError) -> Self {
        PubSubError::InvalidConfig(err.to_string())
    }
}

/// Settings for one pub/sub connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Wait applied by [`PubSub::publish_and_wait`](crate::PubSub::publish_and_wait)
    pub default_timeout: Duration,
    /// Cap on outstanding publish results
    pub max_pending: usize,
    /// Unresolved results older than this are failed with `Timeout`
    pub pending_ttl: Duration,
    /// How often the expired-result sweep runs
    pub cleanup_interval: Duration,
    /// Topic roots tracked individually by metrics
    pub metrics_max_topics: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            max_pending: 10_000,
            pending_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            metrics_max_topics: 20,
        }
    }
}

impl PubSubConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any environment variable has an invalid value
    /// or if the configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = get_env_u64("AGENTBUS_DEFAULT_TIMEOUT_MS")? {
            config = config.with_default_timeout(Duration::from_millis(ms));
        }
        if let Some(max) = get_env_usize("AGENTBUS_MAX_PENDING")? {
            config = config.with_max_pending(max);
        }
        if let Some(secs) = get_env_u64("AGENTBUS_PENDING_TTL_SECS")? {
            config = config.with_pending_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = get_env_u64("AGENTBUS_CLEANUP_INTERVAL_SECS")? {
            config = config.with_cleanup_interval(Duration::from_secs(secs));
        }
        if let Some(max) = get_env_usize("AGENTBUS_METRICS_MAX_TOPICS")? {
            config = config.with_metrics_max_topics(max);
        }

        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    #[must_use]
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    #[must_use]
    pub fn with_metrics_max_topics(mut self, max: usize) -> Self {
        self.metrics_max_topics = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "default_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::ValidationError(
                "max_pending must be greater than 0".to_string(),
            ));
        }
        if self.pending_ttl < self.default_timeout {
            return Err(ConfigError::ValidationError(
                "pending_ttl must be >= default_timeout".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid u64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PubSubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_pending, 10_000);
        assert_eq!(config.default_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(
            PubSubConfig::default()
                .with_cleanup_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            PubSubConfig::default()
                .with_default_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validation_messages() {
        let result = PubSubConfig::default().with_max_pending(0).validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("max_pending must be greater than 0")
        );

        let result = PubSubConfig::default()
            .with_default_timeout(Duration::from_secs(120))
            .validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("pending_ttl must be >= default_timeout")
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: PubSubError = ConfigError::ValidationError("bad".into()).into();
        assert!(matches!(err, PubSubError::InvalidConfig(_)));
    }
}
