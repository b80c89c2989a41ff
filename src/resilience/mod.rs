//! # Resilience Module
//!
//! Fault tolerance for calls to the remote art platform: one circuit breaker and one
//! adaptive rate limiter bucket per logical dependency (`staging-api`, `publish-api`).
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: stop calling a dependency that keeps failing, probe it once
//!   after the reset timeout
//! - **Adaptive Rate Limiter**: shrink the request budget when the provider throttles,
//!   grow it back after sustained success
//! - **Metrics Collection**: breaker state transitions and failure rates
//!
//! ## Usage
//!
//! ```rust,no_run
//! use artpost_core::resilience::{CircuitBreaker, CircuitBreakerSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CircuitBreakerSettings {
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(30),
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("publish-api".to_string(), settings);
//!
//! let result = circuit_breaker.call(|| async {
//!     Ok::<&str, std::io::Error>("published")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerSettings;
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use rate_limiter::{AdaptiveRateLimiter, RateLimitPermit, RateLimiterSnapshot};
