//! Reconnect backoff configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier applied after each consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Check that the settings describe a non-decreasing, bounded schedule
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() {
            return Err(ConfigError::Invalid(
                "backoff.initial must be at least one second".to_string(),
            ));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid(format!(
                "backoff.initial ({:?}) exceeds backoff.max ({:?})",
                self.initial, self.max
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        BackoffConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_shrinking_multiplier() {
        let config = BackoffConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_initial_above_max() {
        let config = BackoffConfig {
            initial: Duration::from_secs(120),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        };
        assert!(config.validate().is_err());
    }
}
