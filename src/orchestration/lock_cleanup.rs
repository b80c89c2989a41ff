//! # Stale Lock Cleanup
//!
//! Lighter, more frequent sweep than stuck job recovery. Releases leases older than
//! the lock timeout for entities in the configured statuses (early lifecycle by
//! default) and touches nothing but the lease.

use crate::config::LockCleanupConfig;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::orchestration::execution_lock::ExecutionLockManager;
use crate::orchestration::periodic::{Sweep, SweepReport};
use crate::store::EntityStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct LockCleanup {
    store: Arc<dyn EntityStore>,
    locks: ExecutionLockManager,
    metrics: Arc<MetricsCollector>,
    config: LockCleanupConfig,
}

impl std::fmt::Debug for LockCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCleanup")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockCleanup {
    pub fn new(
        store: Arc<dyn EntityStore>,
        metrics: Arc<MetricsCollector>,
        config: LockCleanupConfig,
    ) -> Self {
        Self {
            locks: ExecutionLockManager::new(store.clone()),
            store,
            metrics,
            config,
        }
    }

    /// Release every stale lease found in one batch
    pub async fn run_cycle(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - self.config.lock_timeout();
        let stale = self
            .store
            .find_stale_locks(cutoff, &self.config.statuses, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for entity in &stale {
            match self.locks.release_stale(entity).await {
                Ok(true) => {
                    report.acted += 1;
                    info!(
                        entity_id = %entity.id,
                        status = %entity.status,
                        locked_at = ?entity.execution_locked_at,
                        "🔓 Stale execution lock released"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(entity_id = %entity.id, error = %e, "Failed to release stale lock");
                }
            }
        }

        self.metrics.record_lock_cleanup_run(report.acted as u64);
        Ok(report)
    }
}

#[async_trait]
impl Sweep for LockCleanup {
    fn name(&self) -> &'static str {
        "lock_cleanup"
    }

    async fn run_once(&self) -> Result<SweepReport> {
        self.run_cycle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EntityStatus;
    use crate::test_helpers::TestContext;
    use chrono::Duration;
    use uuid::Uuid;

    fn cleanup(ctx: &TestContext) -> LockCleanup {
        LockCleanup::new(
            ctx.services.store.clone(),
            ctx.services.metrics.clone(),
            ctx.config.lock_cleanup.clone(),
        )
    }

    async fn locked(ctx: &TestContext, status: EntityStatus, age: Duration) -> Uuid {
        let owner = ctx.owner().await;
        ctx.entity(owner, |e| {
            e.status = status;
            e.execution_lock_id = Some(Uuid::new_v4());
            e.execution_locked_at = Some(Utc::now() - age);
        })
        .await
        .id
    }

    #[tokio::test]
    async fn test_releases_stale_early_lifecycle_locks_only() {
        let ctx = TestContext::new();
        let stale_scheduled = locked(&ctx, EntityStatus::Scheduled, Duration::minutes(45)).await;
        let fresh_draft = locked(&ctx, EntityStatus::Draft, Duration::minutes(5)).await;
        let stale_publishing = locked(&ctx, EntityStatus::Publishing, Duration::minutes(45)).await;

        let report = cleanup(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.acted, 1);

        let released = ctx.reload(stale_scheduled).await;
        assert!(!released.is_locked());
        assert_eq!(released.status, EntityStatus::Scheduled);
        assert!(ctx.reload(fresh_draft).await.is_locked());
        assert!(ctx.reload(stale_publishing).await.is_locked());
        assert_eq!(ctx.services.metrics.snapshot().locks_released, 1);
    }

    #[tokio::test]
    async fn test_empty_status_list_matches_any_status() {
        let mut config = crate::test_helpers::test_config();
        config.lock_cleanup.statuses.clear();
        let ctx = TestContext::with_config(config);
        let stale_publishing = locked(&ctx, EntityStatus::Publishing, Duration::minutes(45)).await;

        let report = cleanup(&ctx).run_cycle().await.unwrap();
        assert_eq!(report.acted, 1);

        let released = ctx.reload(stale_publishing).await;
        assert!(!released.is_locked());
        assert_eq!(released.status, EntityStatus::Publishing);
    }
}
