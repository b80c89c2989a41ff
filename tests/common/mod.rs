//! Shared setup for the integration tests

#![allow(dead_code)]

use artpost_core::collaborators::ProviderError;
use artpost_core::test_helpers::TestContext;
use artpost_core::PublishableEntity;
use std::time::Duration;
use uuid::Uuid;

pub fn init_test_logging() {
    std::env::set_var("ARTPOST_ENV", "test");
    artpost_core::logging::init_structured_logging();
}

pub fn throttled(retry_after_ms: u64) -> ProviderError {
    ProviderError::http(429, "Too Many Requests")
        .with_retry_after(Duration::from_millis(retry_after_ms))
}

pub fn server_error() -> ProviderError {
    ProviderError::http(503, "Service Unavailable")
}

pub fn unauthorized() -> ProviderError {
    ProviderError::http(401, "Unauthorized")
}

/// Owner plus one scheduled entity whose job is due now
pub async fn scheduled(ctx: &TestContext) -> (Uuid, PublishableEntity) {
    let owner = ctx.owner().await;
    let entity = ctx.scheduled_entity(owner).await;
    (owner, entity)
}

/// Run due jobs on the caller's task until the queue is idle
pub async fn drain(ctx: &TestContext) -> usize {
    let worker = ctx.worker();
    let mut processed = 0;
    while let Some(job) = ctx.services.queue.dequeue().await.expect("dequeue") {
        worker.process(&job).await.expect("process");
        processed += 1;
    }
    processed
}
