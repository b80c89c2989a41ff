//! # Adaptive Rate Limiter
//!
//! Per-dependency token budget refilled once per window. The provider's throttle
//! responses shrink the budget multiplicatively; sustained success grows it back
//! additively up to the configured ceiling.

use crate::collaborators::MAX_RETRY_AFTER;
use crate::config::RateLimiterConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct BucketState {
    /// Tokens granted per window
    budget: u32,
    remaining: u32,
    window_started: Instant,
    /// Provider-advised pause; no tokens are handed out before it passes
    cooldown_until: Option<Instant>,
    success_streak: u32,
    throttle_events: u64,
}

impl BucketState {
    fn new(budget: u32, now: Instant) -> Self {
        Self {
            budget,
            remaining: budget,
            window_started: now,
            cooldown_until: None,
            success_streak: 0,
            throttle_events: 0,
        }
    }

    /// Take a token or report how long until one may be available
    fn try_take(&mut self, window: Duration, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.cooldown_until {
            if until > now {
                return Err(until - now);
            }
            // Cooldown over: start a fresh window with the reduced budget
            self.cooldown_until = None;
            self.window_started = now;
            self.remaining = self.budget;
        }

        if now.duration_since(self.window_started) >= window {
            self.window_started = now;
            self.remaining = self.budget;
        }

        if self.remaining > 0 {
            self.remaining -= 1;
            Ok(())
        } else {
            Err((self.window_started + window).saturating_duration_since(now))
        }
    }
}

/// Proof that a call to a dependency was admitted
#[derive(Debug, Clone)]
pub struct RateLimitPermit {
    pub dependency: String,
    /// Time spent waiting for the token
    pub waited: Duration,
}

/// Point-in-time view of one dependency's bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub budget: u32,
    pub remaining: u32,
    pub cooling_down: bool,
    pub throttle_events: u64,
}

/// AIMD token-bucket limiter keyed by dependency name
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, Arc<Mutex<BucketState>>>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        info!(
            ceiling = config.ceiling,
            window_ms = config.window_ms,
            decrease_factor = config.decrease_factor,
            "🚦 Adaptive rate limiter initialized"
        );

        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, dependency: &str) -> Arc<Mutex<BucketState>> {
        if let Some(bucket) = self.buckets.get(dependency) {
            return Arc::clone(bucket.value());
        }
        let entry = self
            .buckets
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(BucketState::new(
                    self.config.ceiling,
                    Instant::now(),
                )))
            });
        Arc::clone(entry.value())
    }

    /// Wait until the dependency has budget, then take one token
    pub async fn acquire(&self, dependency: &str) -> RateLimitPermit {
        let bucket = self.bucket(dependency);
        let window = self.config.window();
        let started = Instant::now();

        loop {
            // The lock is never held across the sleep
            let wait = match bucket.lock().try_take(window, Instant::now()) {
                Ok(()) => {
                    return RateLimitPermit {
                        dependency: dependency.to_string(),
                        waited: started.elapsed(),
                    }
                }
                Err(wait) => wait,
            };

            debug!(
                dependency = dependency,
                wait_ms = wait.as_millis() as u64,
                "Rate limit budget exhausted, waiting"
            );
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Take a token without waiting
    pub fn try_acquire(&self, dependency: &str) -> Option<RateLimitPermit> {
        let bucket = self.bucket(dependency);
        let taken = bucket
            .lock()
            .try_take(self.config.window(), Instant::now())
            .is_ok();
        taken.then(|| RateLimitPermit {
            dependency: dependency.to_string(),
            waited: Duration::ZERO,
        })
    }

    /// The provider throttled us: pause and shrink the budget
    pub fn report_throttled(&self, dependency: &str, retry_after: Option<Duration>) {
        let bucket = self.bucket(dependency);
        let mut state = bucket.lock();
        let pause = retry_after.unwrap_or_else(|| self.config.window());
        let now = Instant::now();
        // Hints past what `Instant` can represent fall back to the longest honoured wait
        let cooldown_until = now
            .checked_add(pause)
            .or_else(|| now.checked_add(MAX_RETRY_AFTER))
            .unwrap_or(now);

        let previous = state.budget;
        let reduced = (f64::from(state.budget) * self.config.decrease_factor).floor() as u32;
        state.budget = reduced.max(self.config.min_budget);
        state.remaining = 0;
        state.cooldown_until = Some(cooldown_until);
        state.success_streak = 0;
        state.throttle_events += 1;

        warn!(
            dependency = dependency,
            previous_budget = previous,
            new_budget = state.budget,
            pause_ms = pause.as_millis() as u64,
            "🚦 Provider throttled, reducing budget"
        );
    }

    /// A call completed without throttling
    pub fn report_success(&self, dependency: &str) {
        let bucket = self.bucket(dependency);
        let mut state = bucket.lock();
        state.success_streak += 1;

        if state.success_streak >= self.config.recovery_success_streak {
            state.success_streak = 0;
            if state.budget < self.config.ceiling {
                state.budget = (state.budget + self.config.recovery_step).min(self.config.ceiling);
                debug!(
                    dependency = dependency,
                    new_budget = state.budget,
                    "Rate limit budget recovering"
                );
            }
        }
    }

    pub fn snapshot(&self, dependency: &str) -> Option<RateLimiterSnapshot> {
        self.buckets.get(dependency).map(|bucket| {
            let state = bucket.lock();
            RateLimiterSnapshot {
                budget: state.budget,
                remaining: state.remaining,
                cooling_down: state
                    .cooldown_until
                    .map(|until| until > Instant::now())
                    .unwrap_or(false),
                throttle_events: state.throttle_events,
            }
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ceiling: u32, window_ms: u64) -> RateLimiterConfig {
        RateLimiterConfig {
            ceiling,
            window_ms,
            decrease_factor: 0.5,
            min_budget: 1,
            recovery_step: 1,
            recovery_success_streak: 3,
        }
    }

    #[tokio::test]
    async fn test_budget_is_enforced_per_window() {
        let limiter = AdaptiveRateLimiter::new(config(2, 60_000));

        assert!(limiter.try_acquire("publish-api").is_some());
        assert!(limiter.try_acquire("publish-api").is_some());
        assert!(limiter.try_acquire("publish-api").is_none());

        // Dependencies are independent
        assert!(limiter.try_acquire("staging-api").is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_next_window() {
        let limiter = AdaptiveRateLimiter::new(config(1, 50));
        limiter.acquire("publish-api").await;

        let permit = limiter.acquire("publish-api").await;
        assert!(permit.waited >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_throttle_halves_budget_and_pauses() {
        let limiter = AdaptiveRateLimiter::new(config(8, 60_000));
        limiter.try_acquire("publish-api");

        limiter.report_throttled("publish-api", Some(Duration::from_millis(40)));
        let snapshot = limiter.snapshot("publish-api").unwrap();
        assert_eq!(snapshot.budget, 4);
        assert_eq!(snapshot.remaining, 0);
        assert!(snapshot.cooling_down);
        assert!(limiter.try_acquire("publish-api").is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.try_acquire("publish-api").is_some());
        assert_eq!(limiter.snapshot("publish-api").unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn test_unrepresentable_pause_does_not_panic() {
        let limiter = AdaptiveRateLimiter::new(config(4, 60_000));
        limiter.report_throttled("publish-api", Some(Duration::MAX));

        let snapshot = limiter.snapshot("publish-api").unwrap();
        assert!(snapshot.cooling_down);
        assert_eq!(snapshot.budget, 2);
        assert!(limiter.try_acquire("publish-api").is_none());
    }

    #[tokio::test]
    async fn test_budget_never_drops_below_floor() {
        let limiter = AdaptiveRateLimiter::new(config(2, 60_000));
        for _ in 0..5 {
            limiter.report_throttled("publish-api", Some(Duration::from_millis(1)));
        }
        assert_eq!(limiter.snapshot("publish-api").unwrap().budget, 1);
    }

    #[tokio::test]
    async fn test_success_streak_recovers_up_to_ceiling() {
        let limiter = AdaptiveRateLimiter::new(config(4, 60_000));
        limiter.report_throttled("publish-api", Some(Duration::from_millis(1)));
        assert_eq!(limiter.snapshot("publish-api").unwrap().budget, 2);

        for _ in 0..3 {
            limiter.report_success("publish-api");
        }
        assert_eq!(limiter.snapshot("publish-api").unwrap().budget, 3);

        for _ in 0..30 {
            limiter.report_success("publish-api");
        }
        assert_eq!(limiter.snapshot("publish-api").unwrap().budget, 4);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_budget() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(config(5, 60_000)));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire("publish-api").is_some()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
