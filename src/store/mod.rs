//! # Entity Store
//!
//! Persistence seam for publishable entities and their owners. Every mutation the
//! orchestrator performs is a single conditional update (or a single transaction),
//! so concurrent workers and sweeps never need an in-process lock on an entity.
//!
//! - [`memory::InMemoryEntityStore`] - mutex-guarded maps, used by tests and embedders
//! - [`postgres::PgEntityStore`] - sqlx/Postgres implementation

use crate::constants::EntityStatus;
use crate::error::Result;
use crate::models::{Owner, PublishReceipt, PublishableEntity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryEntityStore;
#[cfg(feature = "postgres")]
pub use postgres::PgEntityStore;

/// Keyset position inside the recovery candidate ordering
///
/// Candidates are ordered by `(execution_locked_at, else updated_at)` and then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCursor {
    pub sort_key: DateTime<Utc>,
    pub id: Uuid,
}

impl RecoveryCursor {
    pub fn after(entity: &PublishableEntity) -> Self {
        Self {
            sort_key: entity.execution_locked_at.unwrap_or(entity.updated_at),
            id: entity.id,
        }
    }
}

/// Storage operations used by the publish worker and the reconciliation sweeps
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    async fn get_entity(&self, id: Uuid) -> Result<Option<PublishableEntity>>;

    async fn insert_entity(&self, entity: &PublishableEntity) -> Result<()>;

    async fn get_owner(&self, owner_id: Uuid) -> Result<Option<Owner>>;

    async fn upsert_owner(&self, owner: &Owner) -> Result<()>;

    async fn owner_exists(&self, owner_id: Uuid) -> Result<bool> {
        Ok(self.get_owner(owner_id).await?.is_some())
    }

    /// Set the lock only if none is held. Returns whether the lock was taken.
    async fn try_acquire_lock(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Clear the lock only if `token` still holds it
    async fn release_lock(&self, id: Uuid, token: Uuid) -> Result<bool>;

    async fn set_status(&self, id: Uuid, status: EntityStatus, now: DateTime<Utc>) -> Result<()>;

    /// Persist the provider staging reference
    async fn record_staging(&self, id: Uuid, staging_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Count a retry and move the entity back to `scheduled`. Returns the new retry count.
    async fn record_retry(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> Result<i32>;

    /// Mark published with the provider receipt and bump the owner's post counter
    /// exactly once, in one transaction.
    ///
    /// Idempotent: returns whether the counter was incremented by this call.
    async fn complete_publish(
        &self,
        id: Uuid,
        receipt: &PublishReceipt,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Terminal failure path: persist status (`failed` or `draft`) and message
    async fn mark_failed(
        &self,
        id: Uuid,
        status: EntityStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Recovery reset: set status and message and count the reset as a retry
    async fn reset_for_recovery(
        &self,
        id: Uuid,
        status: EntityStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Move every `scheduled` entity of the owner to `draft` in one statement.
    /// Returns the paused entity ids.
    async fn pause_owner_scheduled(
        &self,
        owner_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;

    async fn delete_entity(&self, id: Uuid) -> Result<bool>;

    /// Entities holding a lock taken before `stuck_before`, or sitting unlocked in an
    /// in-flight status not touched since `stuck_before`. Oldest first.
    async fn find_recovery_candidates(
        &self,
        stuck_before: DateTime<Utc>,
        after: Option<RecoveryCursor>,
        limit: u32,
    ) -> Result<Vec<PublishableEntity>>;

    /// Entities whose lock was taken before `locked_before`. An empty status list
    /// matches every status.
    async fn find_stale_locks(
        &self,
        locked_before: DateTime<Utc>,
        statuses: &[EntityStatus],
        limit: u32,
    ) -> Result<Vec<PublishableEntity>>;

    async fn ping(&self) -> Result<()>;
}
