//! # Circuit Breaker Metrics
//!
//! Counters for breaker activity, per breaker and aggregated across every remote
//! dependency.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the protected operation
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Calls rejected without running the operation
    pub rejected_calls: u64,

    pub consecutive_failures: u64,

    /// Probe calls let through while half-open
    pub half_open_calls: u64,

    /// Closed/half-open to open transitions
    pub trips: u64,

    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_calls: 0,
            consecutive_failures: 0,
            half_open_calls: 0,
            trips: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Closed with a reasonable failure rate, or probing for recovery
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated metrics for every breaker in the process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub total_calls: u64,
    pub total_rejections: u64,
    pub open_circuits: usize,
}

impl SystemCircuitBreakerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_circuit_breaker(&mut self, name: String, metrics: CircuitBreakerMetrics) {
        self.total_calls += metrics.total_calls;
        self.total_rejections += metrics.rejected_calls;
        if metrics.current_state == CircuitState::Open {
            self.open_circuits += 1;
        }
        self.circuit_breakers.insert(name, metrics);
    }

    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.circuit_breakers.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    /// Share of breakers that are healthy (1.0 when none exist yet)
    pub fn health_score(&self) -> f64 {
        if self.circuit_breakers.is_empty() {
            return 1.0;
        }
        let healthy = self
            .circuit_breakers
            .values()
            .filter(|m| m.is_healthy())
            .count();
        healthy as f64 / self.circuit_breakers.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_metrics_aggregation() {
        let mut open = CircuitBreakerMetrics::new();
        open.current_state = CircuitState::Open;
        open.total_calls = 7;
        open.rejected_calls = 3;

        let closed = CircuitBreakerMetrics {
            total_calls: 10,
            ..CircuitBreakerMetrics::new()
        };

        let mut system = SystemCircuitBreakerMetrics::new();
        system.add_circuit_breaker("publish-api".to_string(), open);
        system.add_circuit_breaker("staging-api".to_string(), closed);

        assert_eq!(system.total_calls, 17);
        assert_eq!(system.total_rejections, 3);
        assert_eq!(system.open_circuits, 1);
        assert_eq!(system.health_score(), 0.5);
        assert_eq!(system.count_by_state().get(&CircuitState::Open), Some(&1));
    }
}
