//! # Publisher Configuration
//!
//! Typed configuration for the publish orchestrator. Values are layered by the
//! [`ConfigManager`]: a base YAML file, an optional environment-specific YAML file and
//! `ARTPOST__SECTION__KEY` environment variables. Every section has defaults, so an
//! empty file is a valid configuration.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use artpost_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let concurrency = manager.config().queue.concurrency;
//! let sweep_every = manager.config().recovery.interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{priority, EntityStatus};
use crate::resilience::CircuitBreakerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/artpost.yaml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Postgres connection settings
    pub database: DatabaseConfig,

    /// Job queue and worker pool
    pub queue: QueueConfig,

    /// Retry backoff policy
    pub backoff: BackoffConfig,

    /// Adaptive rate limiter for remote calls
    pub rate_limiter: RateLimiterConfig,

    /// Circuit breakers per remote dependency
    pub circuit_breakers: CircuitBreakerConfig,

    /// Stuck job recovery sweep
    pub recovery: RecoveryConfig,

    /// Stale lock cleanup sweep
    pub lock_cleanup: LockCleanupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL; `${DATABASE_URL}` expands from the environment
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Some("${DATABASE_URL}".to_string()),
            max_connections: 10,
            acquire_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL, expanding `${DATABASE_URL}`
    pub fn database_url(&self) -> Option<String> {
        match self.url.as_deref() {
            Some(url) if url.starts_with("${DATABASE_URL}") => std::env::var("DATABASE_URL").ok(),
            Some(url) if !url.is_empty() => Some(url.to_string()),
            _ => std::env::var("DATABASE_URL").ok(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

/// Queue, worker pool and scheduling behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Parallel publish workers; kept low because provider limits are per credential
    pub concurrency: usize,
    /// Sleep between dequeue attempts when the queue is empty
    pub poll_interval_ms: u64,
    pub default_priority: i32,
    /// Retry ceiling for a single entity
    pub max_attempts: u32,
    /// Shortest re-queue delay when another worker holds the entity lock
    pub lock_retry_delay_ms: u64,
    /// Longest re-queue delay; the delay grows with the age of the held lock
    pub lock_retry_max_delay_ms: u64,
    /// Job starts allowed per submission window
    pub submission_max_starts: u32,
    pub submission_window_ms: u64,
    /// Active jobs older than this are considered stalled
    pub stall_timeout_seconds: u64,
    pub stall_check_interval_seconds: u64,
    /// Wait for in-flight jobs on shutdown before aborting workers
    pub shutdown_grace_seconds: u64,
    /// Random 0..=N seconds added to scheduled publish times (0 disables)
    pub publish_jitter_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 1000,
            default_priority: priority::NORMAL,
            max_attempts: 3,
            lock_retry_delay_ms: 5_000,
            lock_retry_max_delay_ms: 60_000,
            submission_max_starts: 1,
            submission_window_ms: 2_000,
            stall_timeout_seconds: 600,
            stall_check_interval_seconds: 30,
            shutdown_grace_seconds: 30,
            publish_jitter_seconds: 0,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// Re-queue delay for an entity whose lock has been held for `lock_age`
    ///
    /// Waiting as long as the lock has already been held doubles the gap between
    /// successive checks, so a lease left by a crashed worker is polled less and
    /// less often until the sweeps reclaim it.
    pub fn lock_retry_delay_for(&self, lock_age: Duration) -> Duration {
        let min = self.lock_retry_delay();
        let max = Duration::from_millis(self.lock_retry_max_delay_ms).max(min);
        lock_age.clamp(min, max)
    }

    pub fn submission_window(&self) -> Duration {
        Duration::from_millis(self.submission_window_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Retry delay policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fixed wait after a circuit-open rejection
    pub circuit_open_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 64_000,
            multiplier: 2.0,
            circuit_open_delay_ms: 30_000,
        }
    }
}

/// Self-imposed call budget below the provider's stated limit
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum calls per window once fully recovered
    pub ceiling: u32,
    pub window_ms: u64,
    /// Budget multiplier applied on every throttle response
    pub decrease_factor: f64,
    pub min_budget: u32,
    /// Budget regained after a success streak
    pub recovery_step: u32,
    pub recovery_success_streak: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            ceiling: 20,
            window_ms: 60_000,
            decrease_factor: 0.5,
            min_budget: 1,
            recovery_step: 1,
            recovery_success_streak: 10,
        }
    }
}

impl RateLimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Circuit breaker configuration for every remote dependency
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Disabled breakers pass every call through
    pub enabled: bool,
    pub default_config: CircuitBreakerComponentConfig,
    /// Overrides keyed by dependency name (e.g. `publish-api`)
    pub component_configs: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_config: CircuitBreakerComponentConfig::default(),
            component_configs: HashMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for a dependency, falling back to the default
    pub fn config_for_component(&self, component_name: &str) -> &CircuitBreakerComponentConfig {
        self.component_configs
            .get(component_name)
            .unwrap_or(&self.default_config)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Time spent open before a half-open probe is allowed
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerComponentConfig {
    pub fn to_resilience_config(&self) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

/// Stuck job recovery sweep
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Locks and in-flight statuses older than this are considered stuck
    pub stuck_timeout_seconds: u64,
    pub batch_size: u32,
    pub max_batches_per_cycle: u32,
    /// Partial publishes at or above this retry count are reset to draft
    pub retry_ceiling: i32,
    pub requeue_delay_seconds: u64,
    /// Alert when a single cycle recovers more entities than this
    pub alert_recovered_threshold: usize,
    /// Alert when per-entity failures exceed this share of scanned entities
    pub alert_failure_rate: f64,
    /// Minimum scanned entities before the failure rate is evaluated
    pub alert_min_sample: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 900,
            stuck_timeout_seconds: 3600,
            batch_size: 100,
            max_batches_per_cycle: 10,
            retry_ceiling: 3,
            requeue_delay_seconds: 60,
            alert_recovered_threshold: 25,
            alert_failure_rate: 0.25,
            alert_min_sample: 10,
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn stuck_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_timeout_seconds as i64)
    }

    pub fn requeue_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.requeue_delay_seconds as i64)
    }
}

/// Stale lock cleanup sweep
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockCleanupConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub lock_timeout_seconds: u64,
    /// Statuses eligible for cleanup; empty means any status
    ///
    /// Defaults to the early statuses (`scheduled`, `draft`). Leases on entities in
    /// `uploading`/`publishing` are left to stuck-job recovery, which also repairs
    /// the status. Set an empty list to clear stale leases regardless of status.
    pub statuses: Vec<EntityStatus>,
    pub batch_size: u32,
}

impl Default for LockCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            lock_timeout_seconds: 1800,
            statuses: vec![EntityStatus::Scheduled, EntityStatus::Draft],
            batch_size: 100,
        }
    }
}

impl LockCleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_timeout_seconds as i64)
    }
}

impl PublisherConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue.concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.concurrency",
                "0",
                "at least one worker is required",
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.max_attempts",
                "0",
                "max attempts must be greater than 0",
            ));
        }

        if self.queue.submission_max_starts == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.submission_max_starts",
                "0",
                "submission limiter must allow at least one start per window",
            ));
        }

        if self.backoff.base_delay_ms == 0 || self.backoff.max_delay_ms < self.backoff.base_delay_ms
        {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_delay_ms",
                self.backoff.max_delay_ms.to_string(),
                "max delay must be at least the (non-zero) base delay",
            ));
        }

        if self.backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                self.backoff.multiplier.to_string(),
                "multiplier must be >= 1.0",
            ));
        }

        if self.rate_limiter.ceiling == 0 || self.rate_limiter.min_budget == 0 {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.ceiling",
                self.rate_limiter.ceiling.to_string(),
                "ceiling and min_budget must be greater than 0",
            ));
        }

        if self.rate_limiter.min_budget > self.rate_limiter.ceiling {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.min_budget",
                self.rate_limiter.min_budget.to_string(),
                "min_budget cannot exceed ceiling",
            ));
        }

        if !(0.0..1.0).contains(&self.rate_limiter.decrease_factor) {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.decrease_factor",
                self.rate_limiter.decrease_factor.to_string(),
                "decrease factor must be in [0.0, 1.0)",
            ));
        }

        for (name, component) in std::iter::once(("default", &self.circuit_breakers.default_config))
            .chain(
                self.circuit_breakers
                    .component_configs
                    .iter()
                    .map(|(name, config)| (name.as_str(), config)),
            )
        {
            if component.failure_threshold == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("circuit_breakers.{name}.failure_threshold"),
                    "0",
                    "failure threshold must be greater than 0",
                ));
            }
        }

        if self.recovery.batch_size == 0 || self.lock_cleanup.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch_size",
                "0",
                "sweep batch sizes must be greater than 0",
            ));
        }

        if self.lock_cleanup.lock_timeout_seconds > self.recovery.stuck_timeout_seconds {
            tracing::warn!(
                lock_timeout_seconds = self.lock_cleanup.lock_timeout_seconds,
                stuck_timeout_seconds = self.recovery.stuck_timeout_seconds,
                "Lock cleanup timeout exceeds the recovery timeout; the lighter sweep will rarely act"
            );
        }

        if !(0.0..=1.0).contains(&self.recovery.alert_failure_rate) {
            return Err(ConfigurationError::invalid_value(
                "recovery.alert_failure_rate",
                self.recovery.alert_failure_rate.to_string(),
                "failure rate threshold must be within [0.0, 1.0]",
            ));
        }

        Ok(())
    }
}
