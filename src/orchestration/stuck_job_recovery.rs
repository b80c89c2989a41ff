//! # Stuck Job Recovery
//!
//! Periodic reconciliation of entities left behind by crashed or aborted workers.
//!
//! A candidate is an entity whose lock is older than the stuck timeout, or one sitting
//! unlocked in `uploading`/`publishing` without an update for that long. Candidates
//! are scanned oldest first in keyset-paginated batches, and each one is classified:
//!
//! | Situation | Action |
//! |---|---|
//! | owner no longer exists | queue cleanup, cancel job, delete entity |
//! | `remote_id` set but not published | complete idempotently, queue cleanup |
//! | staged, no `remote_id`, under the retry ceiling | back to `scheduled`, re-schedule |
//! | any other in-flight status | back to `draft`, cancel queued job |
//! | not in flight | lock released; `scheduled` entities re-scheduled |
//!
//! Recovery holds the entity's lock itself while acting, so it never races a worker
//! that picked the entity up between the scan and the action.

use crate::config::RecoveryConfig;
use crate::constants::{messages, EntityStatus};
use crate::error::Result;
use crate::models::{PublishReceipt, PublishableEntity};
use crate::orchestration::execution_lock::ExecutionLockManager;
use crate::orchestration::periodic::{Sweep, SweepReport};
use crate::orchestration::publish_worker::PublishServices;
use crate::store::RecoveryCursor;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

/// What recovery did with one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    OrphanRemoved,
    GhostCompleted,
    Requeued,
    ResetToDraft,
    LockReleased,
    /// Entity changed hands or state before recovery could act
    Skipped,
}

impl RecoveryAction {
    /// Whether the action moved a stuck entity back into a consistent state
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            Self::OrphanRemoved | Self::GhostCompleted | Self::Requeued | Self::ResetToDraft
        )
    }
}

/// Outcome of one recovery cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub batches: u32,
    pub scanned: usize,
    pub orphans_removed: usize,
    pub ghosts_completed: usize,
    pub requeued: usize,
    pub reset_to_draft: usize,
    pub locks_released: usize,
    pub skipped: usize,
    pub failures: usize,
    pub alert: bool,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.orphans_removed + self.ghosts_completed + self.requeued + self.reset_to_draft
    }

    pub fn failure_rate(&self) -> f64 {
        if self.scanned == 0 {
            0.0
        } else {
            self.failures as f64 / self.scanned as f64
        }
    }

    fn record(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::OrphanRemoved => self.orphans_removed += 1,
            RecoveryAction::GhostCompleted => self.ghosts_completed += 1,
            RecoveryAction::Requeued => self.requeued += 1,
            RecoveryAction::ResetToDraft => self.reset_to_draft += 1,
            RecoveryAction::LockReleased => self.locks_released += 1,
            RecoveryAction::Skipped => self.skipped += 1,
        }
    }
}

impl From<RecoveryReport> for SweepReport {
    fn from(report: RecoveryReport) -> Self {
        SweepReport {
            scanned: report.scanned,
            acted: report.recovered() + report.locks_released,
            failures: report.failures,
            alert: report.alert,
        }
    }
}

#[derive(Debug)]
pub struct StuckJobRecovery {
    services: PublishServices,
    locks: ExecutionLockManager,
    config: RecoveryConfig,
}

impl StuckJobRecovery {
    pub fn new(services: PublishServices, config: RecoveryConfig) -> Self {
        Self {
            locks: ExecutionLockManager::new(services.store.clone()),
            services,
            config,
        }
    }

    /// Scan and recover up to `max_batches_per_cycle` batches of candidates
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<RecoveryReport> {
        let cutoff = Utc::now() - self.config.stuck_timeout();
        let mut report = RecoveryReport::default();
        let mut cursor: Option<RecoveryCursor> = None;

        while report.batches < self.config.max_batches_per_cycle {
            let candidates = self
                .services
                .store
                .find_recovery_candidates(cutoff, cursor, self.config.batch_size)
                .await?;
            if candidates.is_empty() {
                break;
            }
            report.batches += 1;
            cursor = candidates.last().map(RecoveryCursor::after);

            for entity in &candidates {
                report.scanned += 1;
                match self.recover_entity(entity).await {
                    Ok(action) => {
                        debug!(
                            entity_id = %entity.id,
                            action = ?action,
                            "Recovery candidate handled"
                        );
                        report.record(action);
                    }
                    Err(e) => {
                        report.failures += 1;
                        warn!(entity_id = %entity.id, error = %e, "Failed to recover entity");
                    }
                }
            }

            if candidates.len() < self.config.batch_size as usize {
                break;
            }
        }

        self.evaluate_alerts(&mut report);
        self.services
            .metrics
            .record_recovery_run(report.recovered() as u64, report.failures as u64);

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                recovered = report.recovered(),
                orphans_removed = report.orphans_removed,
                ghosts_completed = report.ghosts_completed,
                requeued = report.requeued,
                reset_to_draft = report.reset_to_draft,
                locks_released = report.locks_released,
                failures = report.failures,
                "🩺 Stuck job recovery cycle finished"
            );
        }
        Ok(report)
    }

    fn evaluate_alerts(&self, report: &mut RecoveryReport) {
        let too_many_recovered = report.recovered() > self.config.alert_recovered_threshold;
        let too_many_failures = report.scanned >= self.config.alert_min_sample
            && report.failure_rate() > self.config.alert_failure_rate;

        if too_many_recovered || too_many_failures {
            report.alert = true;
            self.services.metrics.record_recovery_alert();
            error!(
                alert = true,
                recovered = report.recovered(),
                failures = report.failures,
                failure_rate = report.failure_rate(),
                "🚨 Stuck job recovery crossed alert threshold"
            );
        }
    }

    async fn recover_entity(&self, candidate: &PublishableEntity) -> Result<RecoveryAction> {
        let store = &self.services.store;

        if !store.owner_exists(candidate.owner_id).await? {
            return self.remove_orphan(candidate).await;
        }

        let released = self.locks.release_stale(candidate).await?;
        if candidate.is_locked() && !released {
            // Lock changed hands since the scan
            return Ok(RecoveryAction::Skipped);
        }

        let lock = match self.locks.try_acquire(candidate.id).await? {
            Some(lock) => lock,
            None => return Ok(RecoveryAction::Skipped),
        };

        let result = match store.get_entity(candidate.id).await {
            Ok(Some(entity)) => self.reconcile(&entity, released).await,
            Ok(None) => Ok(RecoveryAction::Skipped),
            Err(e) => Err(e),
        };

        self.locks.release(&lock).await?;
        result
    }

    async fn remove_orphan(&self, entity: &PublishableEntity) -> Result<RecoveryAction> {
        warn!(
            entity_id = %entity.id,
            owner_id = %entity.owner_id,
            "Owner no longer exists, removing orphaned entity"
        );
        self.services
            .cleanup
            .queue_cleanup(entity.id, entity.owner_id)
            .await?;
        self.services.queue.cancel(entity.id).await?;
        self.services.store.delete_entity(entity.id).await?;
        Ok(RecoveryAction::OrphanRemoved)
    }

    async fn reconcile(
        &self,
        entity: &PublishableEntity,
        stale_lock_released: bool,
    ) -> Result<RecoveryAction> {
        let store = &self.services.store;
        let queue = &self.services.queue;
        let now = Utc::now();

        if let Some(remote_id) = entity.remote_id.clone() {
            if entity.status != EntityStatus::Published {
                let receipt = PublishReceipt {
                    remote_id,
                    remote_url: entity.remote_url.clone(),
                };
                store.complete_publish(entity.id, &receipt, now).await?;
                self.services
                    .cleanup
                    .queue_cleanup(entity.id, entity.owner_id)
                    .await?;
                self.services.metrics.record_ghost_completion();
                info!(entity_id = %entity.id, "👻 Ghost publish completed by recovery");
                return Ok(RecoveryAction::GhostCompleted);
            }
        }

        if entity.status.is_in_flight() {
            let resumable =
                entity.staging_id.is_some() && entity.retry_count < self.config.retry_ceiling;

            if resumable {
                store
                    .reset_for_recovery(
                        entity.id,
                        EntityStatus::Scheduled,
                        messages::RECOVERY_REQUEUED,
                        now,
                    )
                    .await?;
                queue
                    .schedule(
                        entity.id,
                        entity.owner_id,
                        now + self.config.requeue_delay(),
                        entity.upload_mode,
                    )
                    .await?;
                info!(
                    entity_id = %entity.id,
                    retry_count = entity.retry_count + 1,
                    "🔄 Partial publish re-scheduled"
                );
                return Ok(RecoveryAction::Requeued);
            }

            store
                .reset_for_recovery(
                    entity.id,
                    EntityStatus::Draft,
                    messages::RECOVERY_RESET_TO_DRAFT,
                    now,
                )
                .await?;
            queue.cancel(entity.id).await?;
            info!(entity_id = %entity.id, "Interrupted publish reset to draft");
            return Ok(RecoveryAction::ResetToDraft);
        }

        if entity.status == EntityStatus::Scheduled {
            // Idempotent: a live job makes this a no-op
            queue
                .schedule(entity.id, entity.owner_id, now, entity.upload_mode)
                .await?;
        }

        if stale_lock_released {
            Ok(RecoveryAction::LockReleased)
        } else {
            Ok(RecoveryAction::Skipped)
        }
    }
}

#[async_trait]
impl Sweep for StuckJobRecovery {
    fn name(&self) -> &'static str {
        "stuck_job_recovery"
    }

    async fn run_once(&self) -> Result<SweepReport> {
        self.run_cycle().await.map(SweepReport::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobState;
    use crate::test_helpers::TestContext;
    use chrono::Duration;
    use uuid::Uuid;
    use crate::store::EntityStore;

    fn recovery(ctx: &TestContext) -> StuckJobRecovery {
        StuckJobRecovery::new(ctx.services.clone(), ctx.config.recovery.clone())
    }

    /// Entity stuck in `status` behind a lock taken two hours ago
    async fn stuck_entity(
        ctx: &TestContext,
        owner_id: Uuid,
        status: EntityStatus,
        shape: impl FnOnce(&mut PublishableEntity),
    ) -> PublishableEntity {
        let two_hours_ago = Utc::now() - Duration::hours(2);
        ctx.entity(owner_id, |entity| {
            entity.status = status;
            entity.execution_lock_id = Some(Uuid::new_v4());
            entity.execution_locked_at = Some(two_hours_ago);
            entity.updated_at = two_hours_ago;
            shape(entity);
        })
        .await
    }

    #[tokio::test]
    async fn test_partial_publish_is_rescheduled() {
        let ctx = TestContext::new();
        let owner = ctx.owner().await;
        let entity = stuck_entity(&ctx, owner, EntityStatus::Publishing, |e| {
            e.staging_id = Some("stage-1".to_string());
        })
        .await;

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.requeued, 1);

        let current = ctx.reload(entity.id).await;
        assert_eq!(current.status, EntityStatus::Scheduled);
        assert_eq!(current.retry_count, 1);
        assert!(!current.is_locked());
        assert_eq!(
            current.error_message.as_deref(),
            Some(messages::RECOVERY_REQUEUED)
        );

        let job = ctx.services.queue.get(entity.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.run_at > Utc::now() + Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_partial_publish_at_ceiling_resets_to_draft() {
        let ctx = TestContext::new();
        let owner = ctx.owner().await;
        let entity = stuck_entity(&ctx, owner, EntityStatus::Uploading, |e| {
            e.staging_id = Some("stage-1".to_string());
            e.retry_count = 3;
        })
        .await;

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.reset_to_draft, 1);

        let current = ctx.reload(entity.id).await;
        assert_eq!(current.status, EntityStatus::Draft);
        assert_eq!(
            current.error_message.as_deref(),
            Some(messages::RECOVERY_RESET_TO_DRAFT)
        );
    }

    #[tokio::test]
    async fn test_ghost_publish_is_completed_once() {
        let ctx = TestContext::new();
        let owner = ctx.owner().await;
        let entity = stuck_entity(&ctx, owner, EntityStatus::Publishing, |e| {
            e.staging_id = Some("stage-1".to_string());
            e.remote_id = Some("deviation-9".to_string());
        })
        .await;

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.ghosts_completed, 1);

        let current = ctx.reload(entity.id).await;
        assert_eq!(current.status, EntityStatus::Published);
        assert!(current.post_count_incremented);
        assert_eq!(ctx.post_count(owner).await, 1);
        assert_eq!(ctx.cleanup.requests(), vec![(entity.id, owner)]);

        // Second sweep finds nothing left to do
        let again = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(again.scanned, 0);
        assert_eq!(ctx.post_count(owner).await, 1);
    }

    #[tokio::test]
    async fn test_orphan_is_cleaned_and_deleted() {
        let ctx = TestContext::new();
        let entity = stuck_entity(&ctx, Uuid::new_v4(), EntityStatus::Uploading, |_| {}).await;

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(ctx.entities.get_entity(entity.id).await.unwrap().is_none());
        assert_eq!(ctx.cleanup.requests(), vec![(entity.id, entity.owner_id)]);
    }

    #[tokio::test]
    async fn test_fresh_locks_are_left_alone() {
        let ctx = TestContext::new();
        let owner = ctx.owner().await;
        let entity = ctx
            .entity(owner, |e| {
                e.status = EntityStatus::Publishing;
                e.execution_lock_id = Some(Uuid::new_v4());
                e.execution_locked_at = Some(Utc::now() - Duration::minutes(5));
            })
            .await;

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert!(ctx.reload(entity.id).await.is_locked());
    }

    #[tokio::test]
    async fn test_scheduled_entity_only_loses_its_lock() {
        let ctx = TestContext::new();
        let owner = ctx.owner().await;
        let entity = stuck_entity(&ctx, owner, EntityStatus::Scheduled, |_| {}).await;

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.locks_released, 1);
        assert_eq!(report.recovered(), 0);

        let current = ctx.reload(entity.id).await;
        assert_eq!(current.status, EntityStatus::Scheduled);
        assert!(!current.is_locked());
        assert!(ctx.services.queue.get(entity.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_batches_are_bounded_per_cycle() {
        let mut config = crate::test_helpers::test_config();
        config.recovery.batch_size = 2;
        config.recovery.max_batches_per_cycle = 2;
        config.recovery.alert_recovered_threshold = 100;
        let ctx = TestContext::with_config(config);
        let owner = ctx.owner().await;
        for _ in 0..5 {
            stuck_entity(&ctx, owner, EntityStatus::Uploading, |_| {}).await;
        }

        let first = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(first.batches, 2);
        assert_eq!(first.reset_to_draft, 4);

        let second = recovery(&ctx).run_cycle().await.unwrap();
        assert_eq!(second.reset_to_draft, 1);
    }

    #[tokio::test]
    async fn test_alert_when_recovered_exceeds_threshold() {
        let mut config = crate::test_helpers::test_config();
        config.recovery.alert_recovered_threshold = 1;
        let ctx = TestContext::with_config(config);
        let owner = ctx.owner().await;
        for _ in 0..2 {
            stuck_entity(&ctx, owner, EntityStatus::Uploading, |_| {}).await;
        }

        let report = recovery(&ctx).run_cycle().await.unwrap();
        assert!(report.alert);
        assert_eq!(ctx.services.metrics.snapshot().recovery_alerts, 1);
    }
}
