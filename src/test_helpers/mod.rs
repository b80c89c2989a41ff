// Test Helpers Module - Shared Testing Infrastructure
//
// Scripted collaborators and an in-memory context used by unit tests and by the
// integration tests under `tests/`.

use crate::collaborators::{AuthExpiryNotifier, CleanupQueue, ProviderError, PublishProvider};
use crate::config::PublisherConfig;
use crate::constants::EntityStatus;
use crate::error::{PublishError, Result};
use crate::metrics::MetricsCollector;
use crate::models::{Owner, PublishMetadata, PublishReceipt, PublishableEntity};
use crate::orchestration::{PublishServices, PublishWorker, PublishWorkerPool};
use crate::queue::{InMemoryJobStore, JobQueue};
use crate::resilience::{AdaptiveRateLimiter, CircuitBreakerManager};
use crate::store::{EntityStore, InMemoryEntityStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Defaults with every wait shortened for tests
pub fn test_config() -> PublisherConfig {
    let mut config = PublisherConfig::default();
    config.queue.poll_interval_ms = 10;
    config.queue.lock_retry_delay_ms = 50;
    config.queue.lock_retry_max_delay_ms = 500;
    config.queue.submission_max_starts = 100;
    config.queue.submission_window_ms = 10;
    config.queue.stall_check_interval_seconds = 1;
    config.queue.shutdown_grace_seconds = 2;
    config.queue.publish_jitter_seconds = 0;
    config
}

/// Provider whose answers are scripted per call; unscripted calls succeed
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    stage_script: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
    finalize_script: Mutex<VecDeque<std::result::Result<PublishReceipt, ProviderError>>>,
    stage_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stage(&self, result: std::result::Result<String, ProviderError>) {
        self.stage_script.lock().push_back(result);
    }

    pub fn push_finalize(&self, result: std::result::Result<PublishReceipt, ProviderError>) {
        self.finalize_script.lock().push_back(result);
    }

    /// Fail the next `times` finalize calls with `error`
    pub fn fail_finalize(&self, error: ProviderError, times: usize) {
        for _ in 0..times {
            self.push_finalize(Err(error.clone()));
        }
    }

    pub fn stage_calls(&self) -> usize {
        self.stage_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_for(staging_id: &str) -> PublishReceipt {
        PublishReceipt {
            remote_id: format!("remote-{staging_id}"),
            remote_url: Some(format!("https://gallery.example/art/{staging_id}")),
        }
    }
}

#[async_trait]
impl PublishProvider for ScriptedProvider {
    async fn stage(
        &self,
        entity: &PublishableEntity,
    ) -> std::result::Result<String, ProviderError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.stage_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("stage-{}", entity.id)))
    }

    async fn finalize(
        &self,
        staging_id: &str,
        _metadata: &PublishMetadata,
    ) -> std::result::Result<PublishReceipt, ProviderError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.finalize_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(Self::receipt_for(staging_id)))
    }
}

/// Cleanup queue that records every request
#[derive(Debug, Default)]
pub struct RecordingCleanup {
    requests: Mutex<Vec<(Uuid, Uuid)>>,
}

impl RecordingCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(Uuid, Uuid)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CleanupQueue for RecordingCleanup {
    async fn queue_cleanup(&self, entity_id: Uuid, owner_id: Uuid) -> Result<()> {
        self.requests.lock().push((entity_id, owner_id));
        Ok(())
    }
}

/// Notifier that records every notification, optionally failing after recording
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<(Uuid, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.fail.store(true, Ordering::SeqCst);
        notifier
    }

    pub fn notifications(&self) -> Vec<(Uuid, String)> {
        self.notifications.lock().clone()
    }
}

#[async_trait]
impl AuthExpiryNotifier for RecordingNotifier {
    async fn notify_auth_expired(&self, owner_id: Uuid, entity_title: &str) -> Result<()> {
        self.notifications
            .lock()
            .push((owner_id, entity_title.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::WorkerError("mail relay unavailable".to_string()));
        }
        Ok(())
    }
}

/// Fully wired in-memory services with handles on every fake
pub struct TestContext {
    pub config: PublisherConfig,
    pub entities: Arc<InMemoryEntityStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub provider: Arc<ScriptedProvider>,
    pub cleanup: Arc<RecordingCleanup>,
    pub notifier: Arc<RecordingNotifier>,
    pub services: PublishServices,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: PublisherConfig) -> Self {
        Self::with_notifier(config, RecordingNotifier::new())
    }

    pub fn with_notifier(config: PublisherConfig, notifier: RecordingNotifier) -> Self {
        let entities = Arc::new(InMemoryEntityStore::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let cleanup = Arc::new(RecordingCleanup::new());
        let notifier = Arc::new(notifier);

        let services = PublishServices {
            store: entities.clone(),
            queue: JobQueue::new(jobs.clone(), config.queue.clone()),
            provider: provider.clone(),
            cleanup: cleanup.clone(),
            notifier: notifier.clone(),
            breakers: Arc::new(CircuitBreakerManager::from_config(&config.circuit_breakers)),
            rate_limiter: Arc::new(AdaptiveRateLimiter::new(config.rate_limiter.clone())),
            metrics: Arc::new(MetricsCollector::new()),
        };

        Self {
            config,
            entities,
            jobs,
            provider,
            cleanup,
            notifier,
            services,
        }
    }

    pub fn worker(&self) -> PublishWorker {
        PublishWorker::new(self.services.clone(), &self.config)
    }

    pub fn pool(&self) -> PublishWorkerPool {
        PublishWorkerPool::new(
            Arc::new(self.worker()),
            self.services.queue.clone(),
            self.services.metrics.clone(),
        )
    }

    /// Insert a fresh owner and return its id
    pub async fn owner(&self) -> Uuid {
        let owner = Owner::new(Uuid::new_v4());
        self.entities
            .upsert_owner(&owner)
            .await
            .expect("in-memory owner insert");
        owner.id
    }

    /// Insert an entity shaped by `shape`
    pub async fn entity(
        &self,
        owner_id: Uuid,
        shape: impl FnOnce(&mut PublishableEntity),
    ) -> PublishableEntity {
        let mut entity = PublishableEntity::new(owner_id, "Study in cobalt");
        shape(&mut entity);
        self.entities
            .insert_entity(&entity)
            .await
            .expect("in-memory entity insert");
        entity
    }

    /// Insert a scheduled entity with a job due now
    pub async fn scheduled_entity(&self, owner_id: Uuid) -> PublishableEntity {
        let entity = self
            .entity(owner_id, |e| {
                e.status = EntityStatus::Scheduled;
                e.scheduled_at = Some(Utc::now());
            })
            .await;
        self.services
            .queue
            .publish_now(entity.id, owner_id, entity.upload_mode)
            .await
            .expect("in-memory enqueue");
        entity
    }

    pub async fn reload(&self, entity_id: Uuid) -> PublishableEntity {
        self.entities
            .get_entity(entity_id)
            .await
            .expect("in-memory read")
            .expect("entity exists")
    }

    pub async fn post_count(&self, owner_id: Uuid) -> i64 {
        self.entities
            .get_owner(owner_id)
            .await
            .expect("in-memory read")
            .map(|owner| owner.post_count)
            .unwrap_or(0)
    }

    /// Make every delayed job due
    pub fn fast_forward(&self) -> usize {
        self.jobs.fast_forward(Utc::now())
    }
}
