//! # Publishable Entity
//!
//! The unit of work: one art post owned by one user, carrying its scheduling data,
//! its external linkage on the provider, retry bookkeeping and the advisory
//! execution lock.
//!
//! ## Lock Invariant
//!
//! `execution_lock_id.is_some()` if and only if `execution_locked_at.is_some()`. A lock
//! older than the configured timeout is stale and never means "in progress".

use crate::constants::{EntityStatus, UploadMode};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An art post scheduled for publication on the remote platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishableEntity {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub status: EntityStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub actual_publish_at: Option<DateTime<Utc>>,
    pub upload_mode: UploadMode,
    /// Provider-side staging (stash) reference
    pub staging_id: Option<String>,
    pub remote_id: Option<String>,
    pub remote_url: Option<String>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub execution_lock_id: Option<Uuid>,
    pub execution_locked_at: Option<DateTime<Utc>>,
    /// Set once the owner's post counter has been bumped for this entity
    pub post_count_incremented: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishableEntity {
    /// New draft entity with no external trace
    pub fn new(owner_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            title: title.into(),
            description: None,
            tags: Vec::new(),
            status: EntityStatus::Draft,
            scheduled_at: None,
            actual_publish_at: None,
            upload_mode: UploadMode::Single,
            staging_id: None,
            remote_id: None,
            remote_url: None,
            retry_count: 0,
            last_retry_at: None,
            error_message: None,
            execution_lock_id: None,
            execution_locked_at: None,
            post_count_incremented: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.execution_lock_id.is_some()
    }

    /// True when a lock exists and was taken before `now - timeout`
    pub fn has_stale_lock(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        match self.execution_locked_at {
            Some(locked_at) => self.execution_lock_id.is_some() && locked_at < now - timeout,
            None => false,
        }
    }

    /// Whether anything of this entity already exists on the provider side
    pub fn has_external_trace(&self) -> bool {
        self.staging_id.is_some() || self.remote_id.is_some()
    }

    /// Remote side confirmed publication but the local record never caught up
    pub fn is_ghost_publish(&self) -> bool {
        self.remote_id.is_some() && self.status != EntityStatus::Published
    }

    /// Metadata sent along with the finalize call
    pub fn publish_metadata(&self) -> PublishMetadata {
        PublishMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            upload_mode: self.upload_mode,
        }
    }
}

/// Account that owns publishable entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: Uuid,
    pub post_count: i64,
}

impl Owner {
    pub fn new(id: Uuid) -> Self {
        Self { id, post_count: 0 }
    }
}

/// Metadata accompanying a finalize request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub upload_mode: UploadMode,
}

/// Provider confirmation of a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub remote_id: String,
    pub remote_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_is_unlocked_draft() {
        let entity = PublishableEntity::new(Uuid::new_v4(), "Sunset study");
        assert_eq!(entity.status, EntityStatus::Draft);
        assert!(!entity.is_locked());
        assert!(!entity.has_external_trace());
        assert!(!entity.post_count_incremented);
    }

    #[test]
    fn test_stale_lock_detection() {
        let now = Utc::now();
        let mut entity = PublishableEntity::new(Uuid::new_v4(), "Ink sketch");
        assert!(!entity.has_stale_lock(Duration::minutes(30), now));

        entity.execution_lock_id = Some(Uuid::new_v4());
        entity.execution_locked_at = Some(now - Duration::minutes(10));
        assert!(!entity.has_stale_lock(Duration::minutes(30), now));

        entity.execution_locked_at = Some(now - Duration::minutes(31));
        assert!(entity.has_stale_lock(Duration::minutes(30), now));
    }

    #[test]
    fn test_ghost_publish_detection() {
        let mut entity = PublishableEntity::new(Uuid::new_v4(), "Portrait");
        entity.status = EntityStatus::Publishing;
        assert!(!entity.is_ghost_publish());

        entity.remote_id = Some("r1".to_string());
        assert!(entity.is_ghost_publish());

        entity.status = EntityStatus::Published;
        assert!(!entity.is_ghost_publish());
    }
}
