//! Configuration for bid opening.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings governing opening sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpeningConfig {
    /// Minimum number of attending committee members to start a session
    pub quorum: usize,

    /// Retry policy for key lookups
    pub key_retry: KeyRetryConfig,
}

/// Retry policy for [`RetryingKeyProvider`](crate::keys::RetryingKeyProvider).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for OpeningConfig {
    fn default() -> Self {
        Self {
            quorum: 3,
            key_retry: KeyRetryConfig::default(),
        }
    }
}

impl Default for KeyRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

impl KeyRetryConfig {
    /// Delay after the given failed attempt (1-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl OpeningConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.quorum == 0 {
            return Err(ConfigValidationError::InvalidQuorum(
                "Quorum cannot be zero".into(),
            ));
        }
        if self.key_retry.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidRetry(
                "At least one key lookup attempt is required".into(),
            ));
        }
        if self.key_retry.initial_backoff_ms > self.key_retry.max_backoff_ms {
            return Err(ConfigValidationError::InvalidRetry(
                "Initial backoff exceeds maximum backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid quorum: {0}")]
    InvalidQuorum(String),

    #[error("Invalid key retry policy: {0}")]
    InvalidRetry(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OpeningConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quorum, 3);
    }

    #[test]
    fn test_invalid_quorum_zero() {
        let config = OpeningConfig {
            quorum: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidQuorum(_))
        ));
    }

    #[test]
    fn test_invalid_backoff_order() {
        let mut config = OpeningConfig::default();
        config.key_retry.initial_backoff_ms = 5_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidRetry(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = KeyRetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OpeningConfig = serde_json::from_str(r#"{ "quorum": 5 }"#).unwrap();
        assert_eq!(config.quorum, 5);
        assert_eq!(config.key_retry, KeyRetryConfig::default());
    }
}
