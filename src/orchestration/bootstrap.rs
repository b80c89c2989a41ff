//! # Publish System Bootstrap
//!
//! Wires every service once and hands out a single [`PublishSystem`] handle:
//!
//! - **Configuration**: a [`ConfigManager`] (loaded from YAML + environment, or built
//!   in code for tests)
//! - **Stores**: Postgres via [`PublishSystem::bootstrap_postgres`], or any
//!   [`EntityStore`]/[`JobStore`] pair through the builder (in-memory by default)
//! - **Resilience**: circuit breaker manager and adaptive rate limiter shared by all
//!   workers
//! - **Lifecycle**: `start()` spawns the worker pool and the two sweeps, `stop()` drains
//!   and shuts them down
//!
//! ```rust,no_run
//! use artpost_core::orchestration::PublishSystem;
//! # use artpost_core::collaborators::{AuthExpiryNotifier, CleanupQueue, PublishProvider};
//! # use std::sync::Arc;
//! # async fn example(
//! #     provider: Arc<dyn PublishProvider>,
//! #     cleanup: Arc<dyn CleanupQueue>,
//! #     notifier: Arc<dyn AuthExpiryNotifier>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let system = PublishSystem::builder()
//!     .with_provider(provider)
//!     .with_cleanup(cleanup)
//!     .with_notifier(notifier)
//!     .build()?;
//!
//! system.start();
//! let health = system.health().await;
//! assert!(health.worker_running);
//! system.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::collaborators::{AuthExpiryNotifier, CleanupQueue, PublishProvider};
use crate::config::{ConfigManager, PublisherConfig};
use crate::constants::UploadMode;
use crate::error::{PublishError, Result};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::orchestration::error_classifier::ErrorClassifier;
use crate::orchestration::lock_cleanup::LockCleanup;
use crate::orchestration::periodic::PeriodicTask;
use crate::orchestration::publish_worker::{PublishServices, PublishWorker};
use crate::orchestration::stuck_job_recovery::StuckJobRecovery;
use crate::orchestration::worker_pool::PublishWorkerPool;
use crate::queue::{InMemoryJobStore, JobCounts, JobQueue, JobStore, ScheduleOutcome};
use crate::resilience::{AdaptiveRateLimiter, CircuitBreakerManager};
use crate::store::{EntityStore, InMemoryEntityStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Liveness / readiness signals for probes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub queue_connected: bool,
    pub worker_running: bool,
    pub active_jobs: usize,
    /// Jobs per state, when the queue answered
    pub job_counts: Option<JobCounts>,
    pub open_circuits: usize,
    /// Process is alive and its workers are running
    pub live: bool,
    /// Live and able to reach the queue
    pub ready: bool,
}

/// Handle over the fully wired publish orchestrator
pub struct PublishSystem {
    config_manager: Arc<ConfigManager>,
    services: PublishServices,
    pool: PublishWorkerPool,
    sweeps: Vec<PeriodicTask>,
}

impl std::fmt::Debug for PublishSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishSystem")
            .field("environment", &self.config_manager.environment())
            .field("pool", &self.pool)
            .field("sweeps", &self.sweeps)
            .finish()
    }
}

impl PublishSystem {
    pub fn builder() -> PublishSystemBuilder {
        PublishSystemBuilder::default()
    }

    /// Connect to Postgres, apply migrations and wire the Postgres stores
    #[cfg(feature = "postgres")]
    pub async fn bootstrap_postgres(
        config_manager: Arc<ConfigManager>,
        provider: Arc<dyn PublishProvider>,
        cleanup: Arc<dyn CleanupQueue>,
        notifier: Arc<dyn AuthExpiryNotifier>,
    ) -> Result<Self> {
        use crate::queue::PgJobStore;
        use crate::store::postgres::{connect, run_migrations};
        use crate::store::PgEntityStore;

        info!(
            environment = config_manager.environment(),
            "🚀 BOOTSTRAP: Starting publish system with Postgres stores"
        );

        let pool = connect(&config_manager.config().database).await?;
        run_migrations(&pool).await?;
        info!("✅ BOOTSTRAP: Database connected and migrated");

        Self::builder()
            .with_config_manager(config_manager)
            .with_entity_store(Arc::new(PgEntityStore::new(pool.clone())))
            .with_job_store(Arc::new(PgJobStore::new(pool)))
            .with_provider(provider)
            .with_cleanup(cleanup)
            .with_notifier(notifier)
            .build()
    }

    pub fn config(&self) -> &PublisherConfig {
        self.config_manager.config()
    }

    pub fn services(&self) -> &PublishServices {
        &self.services
    }

    pub fn worker_pool(&self) -> &PublishWorkerPool {
        &self.pool
    }

    /// Schedule publication at `at`; a live job for the entity makes this a no-op
    pub async fn schedule(
        &self,
        entity_id: Uuid,
        owner_id: Uuid,
        at: DateTime<Utc>,
        upload_mode: UploadMode,
    ) -> Result<ScheduleOutcome> {
        self.services
            .queue
            .schedule(entity_id, owner_id, at, upload_mode)
            .await
    }

    pub async fn publish_now(
        &self,
        entity_id: Uuid,
        owner_id: Uuid,
        upload_mode: UploadMode,
    ) -> Result<ScheduleOutcome> {
        self.services
            .queue
            .publish_now(entity_id, owner_id, upload_mode)
            .await
    }

    /// Cancel the entity's job. Returns whether a queued job was removed; a running
    /// attempt is not interrupted, only its follow-up is dropped.
    pub async fn cancel(&self, entity_id: Uuid) -> Result<bool> {
        self.services.queue.cancel(entity_id).await
    }

    /// Start the worker pool and the enabled sweeps
    pub fn start(&self) {
        self.pool.start();
        for sweep in &self.sweeps {
            sweep.start();
        }
        info!(
            sweeps = self.sweeps.len(),
            "🎉 BOOTSTRAP: Publish system started"
        );
    }

    /// Stop the sweeps, then drain the worker pool within the shutdown grace period
    pub async fn stop(&self) {
        for sweep in &self.sweeps {
            sweep.stop().await;
        }
        self.pool.shutdown().await;
        info!("🛑 Publish system stopped");
    }

    pub async fn health(&self) -> HealthStatus {
        let job_counts = match self.services.queue.counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "Queue unreachable during health check");
                None
            }
        };
        let queue_connected = job_counts.is_some();
        let worker_running = self.pool.is_running();
        let open_circuits = self.services.breakers.get_system_metrics().open_circuits;

        HealthStatus {
            queue_connected,
            worker_running,
            active_jobs: self.pool.active_jobs(),
            job_counts,
            open_circuits,
            live: worker_running,
            ready: worker_running && queue_connected,
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.services.metrics.snapshot()
    }
}

/// Assembles a [`PublishSystem`]. Stores default to in-memory, configuration to
/// [`PublisherConfig::default`].
#[derive(Default)]
pub struct PublishSystemBuilder {
    config_manager: Option<Arc<ConfigManager>>,
    entity_store: Option<Arc<dyn EntityStore>>,
    job_store: Option<Arc<dyn JobStore>>,
    provider: Option<Arc<dyn PublishProvider>>,
    cleanup: Option<Arc<dyn CleanupQueue>>,
    notifier: Option<Arc<dyn AuthExpiryNotifier>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
}

impl PublishSystemBuilder {
    pub fn with_config_manager(mut self, config_manager: Arc<ConfigManager>) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    pub fn with_entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entity_store = Some(store);
        self
    }

    pub fn with_job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn PublishProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn CleanupQueue>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AuthExpiryNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Result<PublishSystem> {
        let config_manager = match self.config_manager {
            Some(manager) => manager,
            None => ConfigManager::from_config(PublisherConfig::default(), "development")?,
        };
        let config = config_manager.config().clone();
        config.validate()?;

        let provider = self.provider.ok_or_else(|| missing("publish provider"))?;
        let cleanup = self.cleanup.ok_or_else(|| missing("cleanup queue"))?;
        let notifier = self.notifier.ok_or_else(|| missing("auth expiry notifier"))?;

        let store = self
            .entity_store
            .unwrap_or_else(|| Arc::new(InMemoryEntityStore::new()) as Arc<dyn EntityStore>);
        let job_store = self
            .job_store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()) as Arc<dyn JobStore>);

        info!(
            circuit_breakers_enabled = config.circuit_breakers.enabled,
            concurrency = config.queue.concurrency,
            "🛡️ BOOTSTRAP: Wiring publish services"
        );

        let services = PublishServices {
            store,
            queue: JobQueue::new(job_store, config.queue.clone()),
            provider,
            cleanup,
            notifier,
            breakers: Arc::new(CircuitBreakerManager::from_config(&config.circuit_breakers)),
            rate_limiter: Arc::new(AdaptiveRateLimiter::new(config.rate_limiter.clone())),
            metrics: Arc::new(MetricsCollector::new()),
        };

        let mut worker = PublishWorker::new(services.clone(), &config);
        if let Some(classifier) = self.classifier {
            worker = worker.with_classifier(classifier);
        }
        let pool = PublishWorkerPool::new(
            Arc::new(worker),
            services.queue.clone(),
            services.metrics.clone(),
        );

        let mut sweeps = Vec::new();
        if config.recovery.enabled {
            sweeps.push(PeriodicTask::new(
                Arc::new(StuckJobRecovery::new(services.clone(), config.recovery.clone())),
                config.recovery.interval(),
            ));
        }
        if config.lock_cleanup.enabled {
            sweeps.push(PeriodicTask::new(
                Arc::new(LockCleanup::new(
                    services.store.clone(),
                    services.metrics.clone(),
                    config.lock_cleanup.clone(),
                )),
                config.lock_cleanup.interval(),
            ));
        }

        Ok(PublishSystem {
            config_manager,
            services,
            pool,
            sweeps,
        })
    }
}

fn missing(what: &str) -> PublishError {
    PublishError::ConfigurationError(format!("Publish system requires a {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_config, RecordingCleanup, RecordingNotifier, ScriptedProvider};

    fn system_with(config: PublisherConfig) -> PublishSystem {
        PublishSystem::builder()
            .with_config_manager(ConfigManager::from_config(config, "test").unwrap())
            .with_provider(Arc::new(ScriptedProvider::new()))
            .with_cleanup(Arc::new(RecordingCleanup::new()))
            .with_notifier(Arc::new(RecordingNotifier::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_collaborators() {
        let result = PublishSystem::builder()
            .with_provider(Arc::new(ScriptedProvider::new()))
            .build();
        assert!(matches!(result, Err(PublishError::ConfigurationError(_))));
    }

    #[test]
    fn test_disabled_sweeps_are_not_wired() {
        let mut config = test_config();
        config.recovery.enabled = false;
        let system = system_with(config);
        assert_eq!(system.sweeps.len(), 1);
        assert_eq!(system.sweeps[0].name(), "lock_cleanup");
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let system = system_with(test_config());

        let before = system.health().await;
        assert!(before.queue_connected);
        assert!(!before.worker_running);
        assert!(!before.ready);

        system.start();
        let running = system.health().await;
        assert!(running.live);
        assert!(running.ready);
        assert_eq!(running.open_circuits, 0);

        system.stop().await;
        assert!(!system.health().await.worker_running);
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_through_the_handle() {
        let system = system_with(test_config());
        let entity_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        let at = Utc::now() + chrono::Duration::minutes(10);

        let first = system
            .schedule(entity_id, owner_id, at, UploadMode::Single)
            .await
            .unwrap();
        let second = system
            .schedule(entity_id, owner_id, at, UploadMode::Single)
            .await
            .unwrap();

        assert!(first.was_enqueued());
        assert!(!second.was_enqueued());
        assert_eq!(first.job_id(), second.job_id());
        assert!(system.cancel(entity_id).await.unwrap());
        assert!(!system.cancel(entity_id).await.unwrap());
    }
}
