//! In-memory entity store with the same conditional-update semantics as Postgres.

use super::{EntityStore, RecoveryCursor};
use crate::constants::EntityStatus;
use crate::error::{PublishError, Result};
use crate::models::{Owner, PublishReceipt, PublishableEntity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    entities: HashMap<Uuid, PublishableEntity>,
    owners: HashMap<Uuid, Owner>,
}

/// Mutex-guarded entity and owner tables
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    tables: Mutex<Tables>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.tables.lock().entities.len()
    }

    /// Apply `f` to an existing entity, bumping `updated_at`
    fn update<T>(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut PublishableEntity) -> T,
    ) -> Result<T> {
        let mut tables = self.tables.lock();
        let entity = tables
            .entities
            .get_mut(&id)
            .ok_or(PublishError::EntityNotFound(id))?;
        let result = f(entity);
        entity.updated_at = now;
        Ok(result)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get_entity(&self, id: Uuid) -> Result<Option<PublishableEntity>> {
        Ok(self.tables.lock().entities.get(&id).cloned())
    }

    async fn insert_entity(&self, entity: &PublishableEntity) -> Result<()> {
        self.tables
            .lock()
            .entities
            .insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_owner(&self, owner_id: Uuid) -> Result<Option<Owner>> {
        Ok(self.tables.lock().owners.get(&owner_id).cloned())
    }

    async fn upsert_owner(&self, owner: &Owner) -> Result<()> {
        self.tables.lock().owners.insert(owner.id, owner.clone());
        Ok(())
    }

    async fn try_acquire_lock(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.entities.get_mut(&id) {
            Some(entity) if entity.execution_lock_id.is_none() => {
                entity.execution_lock_id = Some(token);
                entity.execution_locked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, id: Uuid, token: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.entities.get_mut(&id) {
            Some(entity) if entity.execution_lock_id == Some(token) => {
                entity.execution_lock_id = None;
                entity.execution_locked_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(&self, id: Uuid, status: EntityStatus, now: DateTime<Utc>) -> Result<()> {
        self.update(id, now, |entity| entity.status = status)
    }

    async fn record_staging(&self, id: Uuid, staging_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.update(id, now, |entity| {
            entity.staging_id = Some(staging_id.to_string())
        })
    }

    async fn record_retry(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> Result<i32> {
        self.update(id, now, |entity| {
            entity.retry_count += 1;
            entity.last_retry_at = Some(now);
            entity.status = EntityStatus::Scheduled;
            entity.error_message = Some(message.to_string());
            entity.retry_count
        })
    }

    async fn complete_publish(
        &self,
        id: Uuid,
        receipt: &PublishReceipt,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Tables { entities, owners } = &mut *tables;
        let entity = entities.get_mut(&id).ok_or(PublishError::EntityNotFound(id))?;

        entity.remote_id = Some(receipt.remote_id.clone());
        if receipt.remote_url.is_some() {
            entity.remote_url = receipt.remote_url.clone();
        }
        entity.status = EntityStatus::Published;
        entity.actual_publish_at = entity.actual_publish_at.or(Some(now));
        entity.error_message = None;
        entity.updated_at = now;

        if entity.post_count_incremented {
            return Ok(false);
        }
        entity.post_count_incremented = true;
        if let Some(owner) = owners.get_mut(&entity.owner_id) {
            owner.post_count += 1;
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        status: EntityStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, now, |entity| {
            entity.status = status;
            entity.error_message = Some(message.to_string());
        })
    }

    async fn reset_for_recovery(
        &self,
        id: Uuid,
        status: EntityStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, now, |entity| {
            entity.status = status;
            entity.error_message = Some(message.to_string());
            entity.retry_count += 1;
            entity.last_retry_at = Some(now);
        })
    }

    async fn pause_owner_scheduled(
        &self,
        owner_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut tables = self.tables.lock();
        let mut paused = Vec::new();
        for entity in tables.entities.values_mut() {
            if entity.owner_id == owner_id && entity.status == EntityStatus::Scheduled {
                entity.status = EntityStatus::Draft;
                entity.error_message = Some(message.to_string());
                entity.updated_at = now;
                paused.push(entity.id);
            }
        }
        Ok(paused)
    }

    async fn delete_entity(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.lock().entities.remove(&id).is_some())
    }

    async fn find_recovery_candidates(
        &self,
        stuck_before: DateTime<Utc>,
        after: Option<RecoveryCursor>,
        limit: u32,
    ) -> Result<Vec<PublishableEntity>> {
        let tables = self.tables.lock();
        let mut candidates: Vec<PublishableEntity> = tables
            .entities
            .values()
            .filter(|entity| {
                let stale_lock = entity
                    .execution_locked_at
                    .map(|locked_at| locked_at < stuck_before)
                    .unwrap_or(false);
                let legacy_stuck = entity.execution_lock_id.is_none()
                    && entity.status.is_in_flight()
                    && entity.updated_at < stuck_before;
                stale_lock || legacy_stuck
            })
            .filter(|entity| match after {
                Some(cursor) => {
                    let key = RecoveryCursor::after(entity);
                    (key.sort_key, key.id) > (cursor.sort_key, cursor.id)
                }
                None => true,
            })
            .cloned()
            .collect();

        candidates.sort_by_key(|entity| {
            let key = RecoveryCursor::after(entity);
            (key.sort_key, key.id)
        });
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn find_stale_locks(
        &self,
        locked_before: DateTime<Utc>,
        statuses: &[EntityStatus],
        limit: u32,
    ) -> Result<Vec<PublishableEntity>> {
        let tables = self.tables.lock();
        let mut stale: Vec<PublishableEntity> = tables
            .entities
            .values()
            .filter(|entity| {
                entity.execution_lock_id.is_some()
                    && entity
                        .execution_locked_at
                        .map(|locked_at| locked_at < locked_before)
                        .unwrap_or(false)
                    && (statuses.is_empty() || statuses.contains(&entity.status))
            })
            .cloned()
            .collect();

        stale.sort_by_key(|entity| (entity.execution_locked_at, entity.id));
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded(status: EntityStatus) -> (InMemoryEntityStore, PublishableEntity) {
        let store = InMemoryEntityStore::new();
        let owner = Owner::new(Uuid::new_v4());
        store.upsert_owner(&owner).await.unwrap();
        let mut entity = PublishableEntity::new(owner.id, "Harbour at dusk");
        entity.status = status;
        store.insert_entity(&entity).await.unwrap();
        (store, entity)
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_token_checked() {
        let (store, entity) = seeded(EntityStatus::Scheduled).await;
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store.try_acquire_lock(entity.id, first, now).await.unwrap());
        assert!(!store.try_acquire_lock(entity.id, second, now).await.unwrap());

        assert!(!store.release_lock(entity.id, second).await.unwrap());
        assert!(store.release_lock(entity.id, first).await.unwrap());
        assert!(store.try_acquire_lock(entity.id, second, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_publish_counts_once() {
        let (store, entity) = seeded(EntityStatus::Publishing).await;
        let receipt = PublishReceipt {
            remote_id: "dev-1".to_string(),
            remote_url: Some("https://art.example/dev-1".to_string()),
        };

        assert!(store
            .complete_publish(entity.id, &receipt, Utc::now())
            .await
            .unwrap());
        assert!(!store
            .complete_publish(entity.id, &receipt, Utc::now())
            .await
            .unwrap());

        let owner = store.get_owner(entity.owner_id).await.unwrap().unwrap();
        assert_eq!(owner.post_count, 1);
        let stored = store.get_entity(entity.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntityStatus::Published);
        assert!(stored.actual_publish_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_owner_only_touches_scheduled() {
        let (store, scheduled) = seeded(EntityStatus::Scheduled).await;
        let mut publishing = PublishableEntity::new(scheduled.owner_id, "Second");
        publishing.status = EntityStatus::Publishing;
        store.insert_entity(&publishing).await.unwrap();

        let paused = store
            .pause_owner_scheduled(scheduled.owner_id, "paused", Utc::now())
            .await
            .unwrap();

        assert_eq!(paused, vec![scheduled.id]);
        let untouched = store.get_entity(publishing.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, EntityStatus::Publishing);
    }

    #[tokio::test]
    async fn test_recovery_candidates_ordering_and_cursor() {
        let store = InMemoryEntityStore::new();
        let owner = Uuid::new_v4();
        let now = Utc::now();

        let mut old_lock = PublishableEntity::new(owner, "old lock");
        old_lock.status = EntityStatus::Uploading;
        old_lock.execution_lock_id = Some(Uuid::new_v4());
        old_lock.execution_locked_at = Some(now - Duration::hours(3));

        let mut legacy = PublishableEntity::new(owner, "legacy");
        legacy.status = EntityStatus::Publishing;
        legacy.updated_at = now - Duration::hours(2);

        let mut fresh = PublishableEntity::new(owner, "fresh lock");
        fresh.status = EntityStatus::Publishing;
        fresh.execution_lock_id = Some(Uuid::new_v4());
        fresh.execution_locked_at = Some(now - Duration::minutes(5));
        fresh.updated_at = now - Duration::hours(2);

        for entity in [&old_lock, &legacy, &fresh] {
            store.insert_entity(entity).await.unwrap();
        }

        let cutoff = now - Duration::hours(1);
        let batch = store
            .find_recovery_candidates(cutoff, None, 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![old_lock.id, legacy.id]);

        let next = store
            .find_recovery_candidates(cutoff, Some(RecoveryCursor::after(&batch[0])), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, legacy.id);
    }

    #[tokio::test]
    async fn test_stale_lock_status_filter() {
        let (store, mut entity) = seeded(EntityStatus::Draft).await;
        let now = Utc::now();
        entity.execution_lock_id = Some(Uuid::new_v4());
        entity.execution_locked_at = Some(now - Duration::hours(1));
        store.insert_entity(&entity).await.unwrap();

        let cutoff = now - Duration::minutes(30);
        assert_eq!(
            store
                .find_stale_locks(cutoff, &[EntityStatus::Scheduled], 10)
                .await
                .unwrap()
                .len(),
            0
        );
        assert_eq!(store.find_stale_locks(cutoff, &[], 10).await.unwrap().len(), 1);
    }
}
