//! # Execution Lock Manager
//!
//! Advisory per-entity lease. Acquisition is a compare-and-swap on the nullable
//! `execution_lock_id` column; release only clears a lock still holding our token.
//! A worker that crashes leaves its lease behind for the sweeps to reclaim.

use crate::error::Result;
use crate::models::PublishableEntity;
use crate::store::EntityStore;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Proof of lock ownership for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    pub entity_id: Uuid,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.token, self.entity_id)
    }
}

#[derive(Clone)]
pub struct ExecutionLockManager {
    store: Arc<dyn EntityStore>,
}

impl fmt::Debug for ExecutionLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLockManager").finish_non_exhaustive()
    }
}

impl ExecutionLockManager {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Take the entity's lock if nobody holds it
    pub async fn try_acquire(&self, entity_id: Uuid) -> Result<Option<LockToken>> {
        let token = Uuid::new_v4();
        let now = Utc::now();

        if self.store.try_acquire_lock(entity_id, token, now).await? {
            debug!(entity_id = %entity_id, token = %token, "🔒 Execution lock acquired");
            Ok(Some(LockToken {
                entity_id,
                token,
                acquired_at: now,
            }))
        } else {
            debug!(entity_id = %entity_id, "Execution lock held elsewhere");
            Ok(None)
        }
    }

    /// Release our lock. Returns false when the lock was already taken away.
    pub async fn release(&self, lock: &LockToken) -> Result<bool> {
        let released = self.store.release_lock(lock.entity_id, lock.token).await?;
        if released {
            debug!(entity_id = %lock.entity_id, "🔓 Execution lock released");
        } else {
            warn!(
                entity_id = %lock.entity_id,
                token = %lock.token,
                "Execution lock was no longer ours at release"
            );
        }
        Ok(released)
    }

    /// Release a lock found stale by a sweep, conditional on the stale token
    pub async fn release_stale(&self, entity: &PublishableEntity) -> Result<bool> {
        match entity.execution_lock_id {
            Some(token) => self.store.release_lock(entity.id, token).await,
            None => Ok(false),
        }
    }

    /// A lock older than `timeout` never means "in progress"
    pub fn is_stale(entity: &PublishableEntity, timeout: Duration) -> bool {
        entity.has_stale_lock(timeout, Utc::now())
    }
}
