use artpost_core::collaborators::ProviderError;
use artpost_core::config::{BackoffConfig, RateLimiterConfig};
use artpost_core::error::PublishError;
use artpost_core::orchestration::{ErrorCategory, ErrorClassifier, StandardErrorClassifier};
use artpost_core::queue::BackoffCalculator;
use artpost_core::resilience::{
    AdaptiveRateLimiter, CircuitBreaker, CircuitBreakerSettings, CircuitState,
};
use proptest::prelude::*;
use std::time::Duration;

fn backoff_config_strategy() -> impl Strategy<Value = BackoffConfig> {
    (1u64..10_000, 0u64..200_000, 1.0f64..4.0).prop_map(|(base, extra, multiplier)| {
        BackoffConfig {
            base_delay_ms: base,
            max_delay_ms: base + extra,
            multiplier,
            circuit_open_delay_ms: 30_000,
        }
    })
}

proptest! {
    /// Property: Exponential delays never exceed the cap and never shrink
    #[test]
    fn backoff_is_capped_and_monotonic(config in backoff_config_strategy(), attempt in 0u32..80) {
        let max = Duration::from_millis(config.max_delay_ms);
        let calculator = BackoffCalculator::new(config);

        let current = calculator.delay_for(ErrorCategory::Transient, None, attempt);
        let next = calculator.delay_for(ErrorCategory::Transient, None, attempt + 1);

        prop_assert!(current <= max);
        prop_assert!(next >= current);
    }

    /// Property: A provider wait hint is always honored verbatim
    #[test]
    fn wait_hint_wins(
        config in backoff_config_strategy(),
        hint_ms in 0u64..600_000,
        attempt in 0u32..10,
    ) {
        let calculator = BackoffCalculator::new(config);
        let hint = Duration::from_millis(hint_ms);
        prop_assert_eq!(
            calculator.delay_for(ErrorCategory::RateLimited, Some(hint), attempt),
            hint
        );
    }

    /// Property: The breaker opens exactly at the failure threshold
    #[test]
    fn breaker_opens_at_threshold(threshold in 1u32..20) {
        let breaker = CircuitBreaker::new(
            "publish-api".to_string(),
            CircuitBreakerSettings {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(30),
            },
        );

        for _ in 0..threshold - 1 {
            breaker.record_failure();
        }
        prop_assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        prop_assert_eq!(breaker.state(), CircuitState::Open);
    }

    /// Property: The adaptive budget stays within [min_budget, ceiling]
    #[test]
    fn rate_limit_budget_stays_bounded(
        ceiling in 1u32..100,
        events in prop::collection::vec(any::<bool>(), 1..200),
    ) {
        let config = RateLimiterConfig {
            ceiling,
            recovery_success_streak: 3,
            ..RateLimiterConfig::default()
        };
        let min_budget = config.min_budget;
        let limiter = AdaptiveRateLimiter::new(config);

        for throttled in events {
            if throttled {
                limiter.report_throttled("publish-api", Some(Duration::from_millis(1)));
            } else {
                limiter.report_success("publish-api");
            }
            if let Some(snapshot) = limiter.snapshot("publish-api") {
                prop_assert!(snapshot.budget >= min_budget);
                prop_assert!(snapshot.budget <= ceiling);
            }
        }
    }

    /// Property: Server errors are transient, plain client errors are validation failures
    #[test]
    fn status_codes_map_to_stable_categories(status in 400u16..600) {
        let classifier = StandardErrorClassifier::new();
        let error = PublishError::provider("finalize", ProviderError::http(status, "response"));
        let categorized = classifier.classify_error(&error);

        let expected = match status {
            429 => ErrorCategory::RateLimited,
            401 => ErrorCategory::AuthExpired,
            408 => ErrorCategory::Transient,
            400..=499 => ErrorCategory::Validation,
            _ => ErrorCategory::Transient,
        };
        prop_assert_eq!(categorized.category, expected);
        prop_assert_eq!(categorized.retryable, expected.is_retryable());
    }
}
