//! # Backoff Calculator
//!
//! Retry delay policy for failed publish attempts.
//!
//! - **Server-requested backoff**: a provider wait hint (Retry-After) is used as-is
//! - **Circuit open**: fixed delay, roughly one breaker reset period
//! - **Exponential backoff**: `base * multiplier^attempt`, capped at the maximum

use crate::config::BackoffConfig;
use crate::orchestration::{CategorizedError, ErrorCategory};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before the next attempt
    ///
    /// `attempt` is the number of failed attempts before this one (zero-based).
    pub fn delay_for(
        &self,
        category: ErrorCategory,
        wait_hint: Option<Duration>,
        attempt: u32,
    ) -> Duration {
        if let Some(hint) = wait_hint {
            return hint;
        }

        if category == ErrorCategory::CircuitOpen {
            return Duration::from_millis(self.config.circuit_open_delay_ms);
        }

        self.exponential(attempt)
    }

    pub fn delay_for_error(&self, error: &CategorizedError, attempt: u32) -> Duration {
        self.delay_for(error.category, error.wait_hint, attempt)
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_hint_overrides_everything() {
        let calculator = BackoffCalculator::default();
        assert_eq!(
            calculator.delay_for(
                ErrorCategory::RateLimited,
                Some(Duration::from_millis(5_000)),
                7
            ),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn test_circuit_open_uses_fixed_delay() {
        let calculator = BackoffCalculator::default();
        for attempt in 0..5 {
            assert_eq!(
                calculator.delay_for(ErrorCategory::CircuitOpen, None, attempt),
                Duration::from_secs(30)
            );
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let calculator = BackoffCalculator::default();
        let delay = |attempt| calculator.delay_for(ErrorCategory::Transient, None, attempt);

        assert_eq!(delay(0), Duration::from_millis(2_000));
        assert_eq!(delay(1), Duration::from_millis(4_000));
        assert_eq!(delay(3), Duration::from_millis(16_000));
        assert_eq!(delay(5), Duration::from_millis(64_000));
        assert_eq!(delay(30), Duration::from_millis(64_000));
    }
}
