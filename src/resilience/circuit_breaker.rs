//! # Circuit Breaker Implementation
//!
//! Fault isolation for calls to a remote dependency. Three states:
//! Closed (normal operation), Open (failing fast) and Half-Open (one probe call
//! testing recovery).
//!
//! Exactly one probe is admitted per half-open period. Concurrent callers arriving
//! while the probe is outstanding are rejected as if the circuit were still open.

use crate::resilience::{CircuitBreakerMetrics, CircuitBreakerSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single probe call is allowed through
    HalfOpen,
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation ran and failed
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    metrics: CircuitBreakerMetrics,
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker guarding one remote dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Dependency name for logging and metrics
    name: String,

    settings: CircuitBreakerSettings,

    /// Disabled breakers pass every call through and never trip
    enabled: bool,

    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and settings
    pub fn new(name: String, settings: CircuitBreakerSettings) -> Self {
        info!(
            component = %name,
            failure_threshold = settings.failure_threshold,
            reset_timeout_ms = settings.reset_timeout.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self::build(name, settings, true)
    }

    /// Pass-through breaker used when circuit breakers are disabled
    pub fn disabled(name: String) -> Self {
        debug!(component = %name, "Circuit breaker disabled, calls pass through");
        Self::build(name, CircuitBreakerSettings::default(), false)
    }

    fn build(name: String, settings: CircuitBreakerSettings, enabled: bool) -> Self {
        Self {
            name,
            settings,
            enabled,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current state. An open breaker whose reset timeout elapsed still reports
    /// `Open` until a call arrives to probe it.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Execute an operation, counting every error as a dependency failure
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(operation, |_| true).await
    }

    /// Execute an operation, letting `is_failure` decide which errors count
    ///
    /// Errors for which `is_failure` returns false (e.g. a validation rejection)
    /// prove the dependency answered and are recorded as successes.
    pub async fn call_with<F, T, E, Fut, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        if !self.enabled {
            return operation().await.map_err(CircuitBreakerError::OperationFailed);
        }

        let admission = match self.admit() {
            Some(admission) => admission,
            None => {
                return Err(CircuitBreakerError::CircuitOpen {
                    component: self.name.clone(),
                })
            }
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();
        guard.armed = false;

        let counts_as_failure = match &result {
            Ok(_) => false,
            Err(e) => is_failure(e),
        };
        if counts_as_failure {
            self.on_failure(duration);
        } else {
            self.on_success(duration);
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether a call may proceed, transitioning Open to HalfOpen on timeout
    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.settings.reset_timeout)
                    .unwrap_or(true);

                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.metrics.half_open_calls += 1;
                    inner.metrics.current_state = CircuitState::HalfOpen;
                    info!(component = %self.name, "🟡 Circuit breaker half-open, probing");
                    Some(Admission::Probe)
                } else {
                    inner.metrics.rejected_calls += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.metrics.rejected_calls += 1;
                    None
                } else {
                    inner.probe_in_flight = true;
                    inner.metrics.half_open_calls += 1;
                    Some(Admission::Probe)
                }
            }
        }
    }

    /// Record a dependency success outside of `call`
    pub fn record_success(&self) {
        if self.enabled {
            self.on_success(Duration::ZERO);
        }
    }

    /// Record a dependency failure outside of `call`
    pub fn record_failure(&self) {
        if self.enabled {
            self.on_failure(Duration::ZERO);
        }
    }

    fn on_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        match inner.state {
            CircuitState::HalfOpen => {
                self.close(&mut inner);
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {
                // A call admitted before the trip finished late
                inner.consecutive_failures = 0;
            }
        }
        inner.metrics.consecutive_failures = u64::from(inner.consecutive_failures);
        Self::refresh_rates(&mut inner.metrics);
    }

    fn on_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.metrics.consecutive_failures = u64::from(inner.consecutive_failures);

        warn!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            duration_ms = duration.as_millis() as u64,
            "🔴 Operation failed"
        );

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(component = %self.name, "🔴 Probe failed, re-opening circuit");
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
        Self::refresh_rates(&mut inner.metrics);
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        inner.metrics.trips += 1;
        inner.metrics.current_state = CircuitState::Open;

        error!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            reset_timeout_ms = self.settings.reset_timeout.as_millis() as u64,
            "🚨 Circuit breaker opened"
        );
    }

    fn close(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.metrics.current_state = CircuitState::Closed;

        info!(component = %self.name, "🟢 Circuit breaker closed, dependency recovered");
    }

    /// A probe future was dropped before completing; treat it as a failed probe
    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            warn!(component = %self.name, "Probe call abandoned, re-opening circuit");
            self.open(&mut inner);
        }
    }

    fn refresh_rates(metrics: &mut CircuitBreakerMetrics) {
        if metrics.total_calls > 0 {
            metrics.failure_rate = metrics.failure_count as f64 / metrics.total_calls as f64;
            metrics.average_duration =
                metrics.total_duration / metrics.total_calls.min(u64::from(u32::MAX)) as u32;
        }
    }

    /// Force the circuit open (operational override)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        self.open(&mut inner);
    }

    /// Force the circuit closed (operational override)
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        warn!(component = %self.name, "Circuit breaker forced closed");
        self.close(&mut inner);
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let mut metrics = inner.metrics.clone();
        metrics.current_state = inner.state;
        metrics.consecutive_failures = u64::from(inner.consecutive_failures);
        metrics
    }

    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }
}

/// Re-opens the breaker if a probe call is cancelled mid-flight
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}
