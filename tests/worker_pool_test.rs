//! Worker pool and system lifecycle against in-memory stores

mod common;

use artpost_core::config::ConfigManager;
use artpost_core::constants::{EntityStatus, UploadMode};
use artpost_core::models::JobState;
use artpost_core::orchestration::{
    ExecutionLockManager, PublishSystem, RecoveryAction, StuckJobRecovery,
};
use artpost_core::store::{EntityStore, InMemoryEntityStore};
use artpost_core::test_helpers::{
    test_config, RecordingCleanup, RecordingNotifier, ScriptedProvider, TestContext,
};
use artpost_core::{Owner, PublishableEntity};
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Poll until `check` holds or the deadline passes
async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

#[tokio::test]
async fn test_pool_publishes_every_due_entity() {
    init_test_logging();
    let ctx = TestContext::new();
    let owner = ctx.owner().await;
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(ctx.scheduled_entity(owner).await.id);
    }

    let pool = ctx.pool();
    pool.start();
    assert!(pool.is_running());

    let (ctx_ref, ids_ref) = (&ctx, &ids);
    let all_published = eventually(Duration::from_secs(5), move || async move {
        let mut published = true;
        for id in ids_ref {
            published &= ctx_ref.reload(*id).await.status == EntityStatus::Published;
        }
        published
    })
    .await;
    pool.shutdown().await;

    assert!(all_published);
    assert!(!pool.is_running());
    assert_eq!(pool.active_jobs(), 0);
    assert_eq!(ctx.post_count(owner).await, 4);
    assert_eq!(ctx.provider.finalize_calls(), 4);
    assert_eq!(ctx.services.queue.counts().await.unwrap().completed, 4);
}

#[tokio::test]
async fn test_pool_retries_after_throttle() {
    let ctx = TestContext::new();
    let (owner, entity) = scheduled(&ctx).await;
    ctx.provider.push_finalize(Err(throttled(200)));

    let pool = ctx.pool();
    pool.start();
    let (ctx_ref, entity_id) = (&ctx, entity.id);
    let published = eventually(Duration::from_secs(5), move || async move {
        ctx_ref.reload(entity_id).await.status == EntityStatus::Published
    })
    .await;
    pool.shutdown().await;

    assert!(published);
    assert_eq!(ctx.reload(entity.id).await.retry_count, 1);
    assert_eq!(ctx.post_count(owner).await, 1);
    assert_eq!(ctx.services.metrics.snapshot().jobs_retried, 1);
}

#[tokio::test]
async fn test_locked_entity_does_not_hold_up_unrelated_job() {
    let mut config = test_config();
    config.queue.concurrency = 1;
    config.queue.submission_max_starts = 1;
    config.queue.submission_window_ms = 3_000;
    config.queue.lock_retry_delay_ms = 10;
    config.queue.lock_retry_max_delay_ms = 10;
    let ctx = TestContext::with_config(config);
    let owner = ctx.owner().await;

    // Held by a worker that never comes back; its job keeps surfacing first
    let stuck = ctx.scheduled_entity(owner).await;
    let locks = ExecutionLockManager::new(ctx.services.store.clone());
    locks.try_acquire(stuck.id).await.unwrap().unwrap();
    let due = ctx.scheduled_entity(owner).await;

    let pool = ctx.pool();
    pool.start();
    let (ctx_ref, due_id) = (&ctx, due.id);
    let published = eventually(Duration::from_secs(1), move || async move {
        ctx_ref.reload(due_id).await.status == EntityStatus::Published
    })
    .await;
    pool.shutdown().await;

    assert!(published);
    assert_eq!(ctx.provider.finalize_calls(), 1);
    assert!(ctx.services.metrics.snapshot().jobs_requeued_on_lock >= 1);
    let stuck = ctx.reload(stuck.id).await;
    assert_eq!(stuck.status, EntityStatus::Scheduled);
    assert!(stuck.is_locked());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let ctx = TestContext::new();
    let pool = ctx.pool();
    pool.start();
    pool.start();
    pool.shutdown().await;
    pool.shutdown().await;
    assert!(!pool.is_running());
}

#[tokio::test]
async fn test_crashed_publish_is_recovered_and_finished() {
    let ctx = TestContext::new();
    let owner = ctx.owner().await;
    let long_ago = Utc::now() - ChronoDuration::hours(2);
    let entity = ctx
        .entity(owner, |e| {
            e.status = EntityStatus::Publishing;
            e.staging_id = Some("stage-before-crash".to_string());
            e.execution_lock_id = Some(Uuid::new_v4());
            e.execution_locked_at = Some(long_ago);
            e.updated_at = long_ago;
        })
        .await;

    let recovery = StuckJobRecovery::new(ctx.services.clone(), ctx.config.recovery.clone());
    let report = recovery.run_cycle().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert!(RecoveryAction::Requeued.is_recovery());

    let recovered = ctx.reload(entity.id).await;
    assert_eq!(recovered.status, EntityStatus::Scheduled);
    assert!(!recovered.is_locked());
    let job = ctx.services.queue.get(entity.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);

    ctx.fast_forward();
    assert_eq!(drain(&ctx).await, 1);

    let finished = ctx.reload(entity.id).await;
    assert_eq!(finished.status, EntityStatus::Published);
    assert_eq!(
        finished.remote_id.as_deref(),
        Some("remote-stage-before-crash")
    );
    assert_eq!(ctx.provider.stage_calls(), 0);
    assert_eq!(ctx.post_count(owner).await, 1);
}

#[tokio::test]
async fn test_system_publishes_through_shared_store() {
    let store = Arc::new(InMemoryEntityStore::new());
    let provider = Arc::new(ScriptedProvider::new());
    let cleanup = Arc::new(RecordingCleanup::new());

    let owner = Owner::new(Uuid::new_v4());
    store.upsert_owner(&owner).await.unwrap();
    let mut entity = PublishableEntity::new(owner.id, "Harbor at dusk");
    entity.status = EntityStatus::Scheduled;
    store.insert_entity(&entity).await.unwrap();

    let system = PublishSystem::builder()
        .with_config_manager(ConfigManager::from_config(test_config(), "test").unwrap())
        .with_entity_store(store.clone())
        .with_provider(provider.clone())
        .with_cleanup(cleanup.clone())
        .with_notifier(Arc::new(RecordingNotifier::new()))
        .build()
        .unwrap();

    system.start();
    system
        .publish_now(entity.id, owner.id, UploadMode::Single)
        .await
        .unwrap();

    let (store_ref, entity_id) = (&store, entity.id);
    let published = eventually(Duration::from_secs(5), move || async move {
        store_ref
            .get_entity(entity_id)
            .await
            .unwrap()
            .map(|e| e.status == EntityStatus::Published)
            .unwrap_or(false)
    })
    .await;

    let health = system.health().await;
    system.stop().await;

    assert!(published);
    assert!(health.ready);
    assert_eq!(cleanup.requests(), vec![(entity.id, owner.id)]);
    assert_eq!(system.metrics_snapshot().jobs_completed, 1);
    assert_eq!(provider.finalize_calls(), 1);
}
