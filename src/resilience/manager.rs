//! # Circuit Breaker Manager
//!
//! Hands out one circuit breaker per remote dependency and aggregates their metrics.

use crate::config::CircuitBreakerConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Manager for the circuit breakers of every remote dependency
#[derive(Debug)]
pub struct CircuitBreakerManager {
    /// Circuit breakers by dependency name
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,

    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        info!(
            enabled = config.enabled,
            component_overrides = config.component_configs.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: DashMap::new(),
            config: config.clone(),
        }
    }

    /// Get or create the circuit breaker for a dependency
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(component_name) {
            return Arc::clone(breaker.value());
        }

        // entry() holds the shard lock, so concurrent callers share one breaker
        let entry = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                let breaker = if self.config.enabled {
                    CircuitBreaker::new(
                        component_name.to_string(),
                        self.config
                            .config_for_component(component_name)
                            .to_resilience_config(),
                    )
                } else {
                    CircuitBreaker::disabled(component_name.to_string())
                };
                Arc::new(breaker)
            });

        Arc::clone(entry.value())
    }

    pub fn list_components(&self) -> Vec<String> {
        self.circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get_component_metrics(&self, component_name: &str) -> Option<CircuitBreakerMetrics> {
        self.circuit_breakers
            .get(component_name)
            .map(|breaker| breaker.metrics())
    }

    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for entry in self.circuit_breakers.iter() {
            system_metrics.add_circuit_breaker(entry.key().clone(), entry.value().metrics());
        }
        system_metrics
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open (emergency stop)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed (emergency recovery)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}
