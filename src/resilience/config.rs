//! # Circuit Breaker Settings
//!
//! Runtime settings for a single breaker. The YAML-facing structure lives in
//! `crate::config::CircuitBreakerConfig` and converts into these via
//! `CircuitBreakerComponentConfig::to_resilience_config`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time spent open before a single half-open probe is let through
    pub reset_timeout: Duration,
}

impl CircuitBreakerSettings {
    /// Settings tuned for calls to the remote art platform
    pub fn for_external_api() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self::for_external_api()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(CircuitBreakerSettings::default().validate().is_ok());

        let zero_threshold = CircuitBreakerSettings {
            failure_threshold: 0,
            ..CircuitBreakerSettings::default()
        };
        assert!(zero_threshold.validate().is_err());

        let zero_timeout = CircuitBreakerSettings {
            reset_timeout: Duration::ZERO,
            ..CircuitBreakerSettings::default()
        };
        assert!(zero_timeout.validate().is_err());
    }
}
