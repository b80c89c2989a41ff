//! # Publish Worker
//!
//! Drives one entity through a single publish attempt:
//!
//! ```text
//! scheduled ──▶ uploading ──(stage)──▶ publishing ──(finalize)──▶ published
//!     ▲              │                      │
//!     └── retry ◀────┴──────────────────────┴──▶ failed / draft
//! ```
//!
//! Every exit path releases the execution lock, and every failure ends in a
//! persisted status plus message. Provider calls go through the dependency's circuit
//! breaker and adaptive rate limiter. A submission slot is only taken once the lock
//! is held and the provider is about to be called; lock re-queues, discards and
//! ghost completions never spend one.

use crate::collaborators::{AuthExpiryNotifier, CleanupQueue, ProviderError, PublishProvider};
use crate::config::{PublisherConfig, QueueConfig};
use crate::constants::{dependencies, messages, EntityStatus};
use crate::error::{PublishError, Result};
use crate::logging::log_job_operation;
use crate::metrics::MetricsCollector;
use crate::models::{Job, PublishReceipt, PublishableEntity};
use crate::orchestration::error_classifier::{
    CategorizedError, ErrorCategory, ErrorClassifier, StandardErrorClassifier,
};
use crate::orchestration::execution_lock::{ExecutionLockManager, LockToken};
use crate::queue::{BackoffCalculator, JobQueue, SubmissionLimiter};
use crate::resilience::{AdaptiveRateLimiter, CircuitBreakerError, CircuitBreakerManager};
use crate::store::EntityStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Services shared by the worker pool and the sweeps, constructed once and injected
#[derive(Clone)]
pub struct PublishServices {
    pub store: Arc<dyn EntityStore>,
    pub queue: JobQueue,
    pub provider: Arc<dyn PublishProvider>,
    pub cleanup: Arc<dyn CleanupQueue>,
    pub notifier: Arc<dyn AuthExpiryNotifier>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub rate_limiter: Arc<AdaptiveRateLimiter>,
    pub metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for PublishServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishServices")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Result of one publish attempt, already applied to the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// Entity is published. `ghost` means the remote side already had it.
    Published { ghost: bool },
    /// Failed attempt, re-enqueued after `delay`
    Retry {
        delay: Duration,
        category: ErrorCategory,
    },
    /// Another worker holds the entity; re-queued without counting an attempt
    LockUnavailable { delay: Duration },
    /// Terminal failure; `entity_status` is what was persisted, if anything
    Failed {
        category: ErrorCategory,
        entity_status: Option<EntityStatus>,
    },
    /// Nothing to do for this entity; job discarded
    Skipped { reason: String },
}

impl JobOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

pub struct PublishWorker {
    services: PublishServices,
    locks: ExecutionLockManager,
    classifier: Arc<dyn ErrorClassifier>,
    backoff: BackoffCalculator,
    submission: SubmissionLimiter,
    config: QueueConfig,
}

impl std::fmt::Debug for PublishWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishWorker")
            .field("classifier", &self.classifier.classifier_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PublishWorker {
    pub fn new(services: PublishServices, config: &PublisherConfig) -> Self {
        Self {
            locks: ExecutionLockManager::new(services.store.clone()),
            services,
            classifier: Arc::new(StandardErrorClassifier::new()),
            backoff: BackoffCalculator::new(config.backoff.clone()),
            submission: SubmissionLimiter::new(
                config.queue.submission_max_starts,
                config.queue.submission_window(),
            ),
            config: config.queue.clone(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run one attempt for a dequeued job and settle the job record
    #[instrument(skip(self, job), fields(job_id = %job.id, entity_id = %job.payload.entity_id))]
    pub async fn process(&self, job: &Job) -> Result<JobOutcome> {
        let metrics = &self.services.metrics;
        metrics.record_job_started();
        let started = Instant::now();

        let outcome = match self.attempt(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Infrastructure failure outside the entity failure path
                error!(error = %e, "❌ Publish attempt could not run");
                metrics.record_failure(ErrorCategory::Transient);
                if job.attempts_made + 1 < job.max_attempts {
                    JobOutcome::Retry {
                        delay: self.backoff.delay_for(
                            ErrorCategory::Transient,
                            None,
                            job.attempts_made,
                        ),
                        category: ErrorCategory::Transient,
                    }
                } else {
                    JobOutcome::Failed {
                        category: ErrorCategory::Transient,
                        entity_status: None,
                    }
                }
            }
        };

        self.settle(job, &outcome, started.elapsed()).await?;
        Ok(outcome)
    }

    async fn settle(&self, job: &Job, outcome: &JobOutcome, elapsed: Duration) -> Result<()> {
        let queue = &self.services.queue;
        let metrics = &self.services.metrics;

        match outcome {
            JobOutcome::Published { ghost } => {
                queue.complete(job).await?;
                metrics.record_job_completed(elapsed);
                if *ghost {
                    metrics.record_ghost_completion();
                }
                info!(
                    duration_ms = elapsed.as_millis() as u64,
                    ghost = ghost,
                    "✅ Entity published"
                );
            }
            JobOutcome::Retry { delay, category } => {
                if queue.retry(job, *delay, category.as_str()).await? {
                    metrics.record_job_retried();
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        category = %category,
                        "🔄 Publish attempt failed, retry scheduled"
                    );
                } else {
                    info!("Retry dropped: job was cancelled while running");
                }
            }
            JobOutcome::LockUnavailable { delay } => {
                queue.requeue(job, *delay).await?;
                metrics.record_lock_requeue();
                debug!(delay_ms = delay.as_millis() as u64, "Entity locked, job re-queued");
            }
            JobOutcome::Failed {
                category,
                entity_status,
            } => {
                queue.fail(job, category.as_str()).await?;
                metrics.record_job_failed();
                warn!(
                    category = %category,
                    entity_status = ?entity_status,
                    "❌ Publish failed permanently"
                );
            }
            JobOutcome::Skipped { reason } => {
                queue.complete(job).await?;
                metrics.record_job_discarded();
                log_job_operation(
                    "discard",
                    &job.id,
                    job.payload.entity_id,
                    "skipped",
                    Some(reason),
                );
            }
        }
        Ok(())
    }

    async fn attempt(&self, job: &Job) -> Result<JobOutcome> {
        let entity_id = job.payload.entity_id;
        let store = &self.services.store;

        let entity = match store.get_entity(entity_id).await? {
            Some(entity) => entity,
            None => return Ok(JobOutcome::skipped("entity no longer exists")),
        };
        if let Some(reason) = Self::skip_reason(&entity) {
            return Ok(JobOutcome::skipped(reason));
        }

        let lock = match self.locks.try_acquire(entity_id).await? {
            Some(lock) => lock,
            None => {
                let lock_age = entity
                    .execution_locked_at
                    .and_then(|locked_at| (Utc::now() - locked_at).to_std().ok())
                    .unwrap_or_default();
                return Ok(JobOutcome::LockUnavailable {
                    delay: self.config.lock_retry_delay_for(lock_age),
                });
            }
        };

        let result = self.run_locked(job, &lock).await;

        if let Err(e) = self.locks.release(&lock).await {
            error!(error = %e, "Failed to release execution lock, sweeps will reclaim it");
        }

        result
    }

    fn skip_reason(entity: &PublishableEntity) -> Option<String> {
        if entity.status == EntityStatus::Published {
            return Some("entity already published".to_string());
        }
        if !entity.status.is_publishable() && !entity.is_ghost_publish() {
            return Some(format!("entity status is {}", entity.status));
        }
        None
    }

    async fn run_locked(&self, job: &Job, lock: &LockToken) -> Result<JobOutcome> {
        let store = &self.services.store;

        // State may have moved between the first read and the lock
        let entity = match store.get_entity(lock.entity_id).await? {
            Some(entity) => entity,
            None => return Ok(JobOutcome::skipped("entity deleted while locking")),
        };
        if let Some(reason) = Self::skip_reason(&entity) {
            return Ok(JobOutcome::skipped(reason));
        }

        if let Some(remote_id) = entity.remote_id.clone() {
            info!(remote_id = %remote_id, "👻 Remote publish already exists, completing");
            let receipt = PublishReceipt {
                remote_id,
                remote_url: entity.remote_url.clone(),
            };
            self.finish(&entity, &receipt).await?;
            return Ok(JobOutcome::Published { ghost: true });
        }

        self.submission.wait_turn().await;
        match self.publish(&entity).await {
            Ok(receipt) => {
                self.finish(&entity, &receipt).await?;
                Ok(JobOutcome::Published { ghost: false })
            }
            Err(error) => self.handle_failure(job, entity.id, error).await,
        }
    }

    /// Stage (unless already staged), then finalize
    async fn publish(&self, entity: &PublishableEntity) -> Result<PublishReceipt> {
        let store = &self.services.store;
        let provider = self.services.provider.clone();

        store
            .set_status(entity.id, EntityStatus::Uploading, Utc::now())
            .await?;

        let staging_id = match &entity.staging_id {
            Some(staging_id) => {
                debug!(staging_id = %staging_id, "Reusing staged upload");
                staging_id.clone()
            }
            None => {
                let staging_id = self
                    .call_provider(dependencies::STAGING_API, "stage", || provider.stage(entity))
                    .await?;
                store
                    .record_staging(entity.id, &staging_id, Utc::now())
                    .await?;
                staging_id
            }
        };

        store
            .set_status(entity.id, EntityStatus::Publishing, Utc::now())
            .await?;

        let metadata = entity.publish_metadata();
        self.call_provider(dependencies::PUBLISH_API, "finalize", || {
            provider.finalize(&staging_id, &metadata)
        })
        .await
    }

    /// Call the provider through the dependency's breaker and limiter
    async fn call_provider<T, F, Fut>(
        &self,
        dependency: &str,
        operation: &str,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let breaker = self.services.breakers.get_circuit_breaker(dependency);
        let limiter = &self.services.rate_limiter;
        let classifier = &self.classifier;

        let result = breaker
            .call_with(
                || async move {
                    let _permit = limiter.acquire(dependency).await;
                    call().await
                },
                |e: &ProviderError| {
                    classifier
                        .classify_error(&PublishError::provider(operation, e.clone()))
                        .category
                        .counts_against_dependency()
                },
            )
            .await;

        match result {
            Ok(value) => {
                limiter.report_success(dependency);
                Ok(value)
            }
            Err(CircuitBreakerError::CircuitOpen { component }) => {
                Err(PublishError::CircuitBreakerOpen(component))
            }
            Err(CircuitBreakerError::OperationFailed(source)) => {
                let error = PublishError::provider(operation, source);
                if let PublishError::Provider { source, .. } = &error {
                    let category = classifier.classify_error(&error).category;
                    if category == ErrorCategory::RateLimited {
                        limiter.report_throttled(dependency, source.retry_after);
                    }
                }
                Err(error)
            }
        }
    }

    /// Persist publication, count the post once and hand assets to cleanup
    async fn finish(&self, entity: &PublishableEntity, receipt: &PublishReceipt) -> Result<()> {
        let counted = self
            .services
            .store
            .complete_publish(entity.id, receipt, Utc::now())
            .await?;
        debug!(post_counted = counted, "Publish recorded");

        if let Err(e) = self
            .services
            .cleanup
            .queue_cleanup(entity.id, entity.owner_id)
            .await
        {
            warn!(error = %e, "Failed to queue asset cleanup");
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        job: &Job,
        entity_id: Uuid,
        error: PublishError,
    ) -> Result<JobOutcome> {
        let categorized = self.classifier.classify_error(&error);
        self.services.metrics.record_failure(categorized.category);

        // Re-read: staging id and retry count may have changed during the attempt
        let entity = self
            .services
            .store
            .get_entity(entity_id)
            .await?
            .ok_or(PublishError::EntityNotFound(entity_id))?;

        warn!(
            category = %categorized.category,
            retry_count = entity.retry_count,
            error = %error,
            "Publish attempt failed"
        );

        if categorized.category == ErrorCategory::AuthExpired {
            self.pause_owner(&entity).await;
            return self.fail_terminally(&entity, &categorized).await;
        }

        let max_attempts = i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX);
        if categorized.retryable && entity.retry_count < max_attempts {
            let attempt = entity.retry_count.max(0) as u32;
            self.services
                .store
                .record_retry(entity.id, &categorized.message, Utc::now())
                .await?;
            let delay = self.backoff.delay_for_error(&categorized, attempt);
            debug!(job_attempts = job.attempts_made, "Entity retry recorded");
            return Ok(JobOutcome::Retry {
                delay,
                category: categorized.category,
            });
        }

        self.fail_terminally(&entity, &categorized).await
    }

    async fn fail_terminally(
        &self,
        entity: &PublishableEntity,
        categorized: &CategorizedError,
    ) -> Result<JobOutcome> {
        let status = if entity.has_external_trace() {
            EntityStatus::Failed
        } else {
            EntityStatus::Draft
        };
        let message = if categorized.retryable {
            format!("{}: {}", messages::RETRIES_EXHAUSTED, categorized.message)
        } else {
            categorized.message.clone()
        };

        self.services
            .store
            .mark_failed(entity.id, status, &message, Utc::now())
            .await?;

        Ok(JobOutcome::Failed {
            category: categorized.category,
            entity_status: Some(status),
        })
    }

    /// Pause every scheduled entity of the owner and tell them to reconnect
    async fn pause_owner(&self, entity: &PublishableEntity) {
        let services = &self.services;
        services.metrics.record_auth_pause();

        match services
            .store
            .pause_owner_scheduled(entity.owner_id, messages::AUTH_EXPIRED_PAUSED, Utc::now())
            .await
        {
            Ok(paused) => {
                for paused_id in &paused {
                    if let Err(e) = services.queue.cancel(*paused_id).await {
                        warn!(entity_id = %paused_id, error = %e, "Failed to cancel paused job");
                    }
                }
                warn!(
                    owner_id = %entity.owner_id,
                    paused = paused.len(),
                    "🔑 Authorization expired, owner's scheduled posts paused"
                );
            }
            Err(e) => {
                error!(owner_id = %entity.owner_id, error = %e, "Failed to pause owner's posts");
            }
        }

        if let Err(e) = services
            .notifier
            .notify_auth_expired(entity.owner_id, &entity.title)
            .await
        {
            warn!(owner_id = %entity.owner_id, error = %e, "Auth expiry notification failed");
        }
    }
}
