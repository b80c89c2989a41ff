//! # Postgres Entity Store
//!
//! sqlx implementation of [`EntityStore`]. Locks are compare-and-swap updates on the
//! nullable `execution_lock_id` column; publish completion runs in one transaction so
//! the owner's post counter moves together with `post_count_incremented`.

use super::{EntityStore, RecoveryCursor};
use crate::constants::EntityStatus;
use crate::error::{PublishError, Result};
use crate::models::{Owner, PublishReceipt, PublishableEntity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Schema migrations embedded at compile time from `migrations/`
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply pending schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        PublishError::DatabaseError(format!("Migration failed: {e}"))
    })?;
    info!("🗄️ Database migrations applied");
    Ok(())
}

/// Connect a pool from the database section of the configuration
pub async fn connect(config: &crate::config::DatabaseConfig) -> Result<PgPool> {
    let url = config.database_url().ok_or_else(|| {
        PublishError::ConfigurationError(
            "database.url is not set (and DATABASE_URL is not exported)".to_string(),
        )
    })?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&url)
        .await?;

    debug!(max_connections = config.max_connections, "Database pool connected");
    Ok(pool)
}

const ENTITY_COLUMNS: &str = r#"
    id, owner_id, title, description, tags, status, scheduled_at, actual_publish_at,
    upload_mode, staging_id, remote_id, remote_url, retry_count, last_retry_at,
    error_message, execution_lock_id, execution_locked_at, post_count_incremented,
    created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct EntityRow {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    description: Option<String>,
    tags: Vec<String>,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    actual_publish_at: Option<DateTime<Utc>>,
    upload_mode: String,
    staging_id: Option<String>,
    remote_id: Option<String>,
    remote_url: Option<String>,
    retry_count: i32,
    last_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    execution_lock_id: Option<Uuid>,
    execution_locked_at: Option<DateTime<Utc>>,
    post_count_incremented: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for PublishableEntity {
    type Error = PublishError;

    fn try_from(row: EntityRow) -> Result<Self> {
        Ok(PublishableEntity {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            description: row.description,
            tags: row.tags,
            status: row.status.parse().map_err(PublishError::DatabaseError)?,
            scheduled_at: row.scheduled_at,
            actual_publish_at: row.actual_publish_at,
            upload_mode: row.upload_mode.parse().map_err(PublishError::DatabaseError)?,
            staging_id: row.staging_id,
            remote_id: row.remote_id,
            remote_url: row.remote_url,
            retry_count: row.retry_count,
            last_retry_at: row.last_retry_at,
            error_message: row.error_message,
            execution_lock_id: row.execution_lock_id,
            execution_locked_at: row.execution_locked_at,
            post_count_incremented: row.post_count_incremented,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_entities(rows: Vec<EntityRow>) -> Result<Vec<PublishableEntity>> {
    rows.into_iter().map(PublishableEntity::try_from).collect()
}

fn status_strings(statuses: &[EntityStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Postgres-backed entity store
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn expect_row(id: Uuid, rows_affected: u64) -> Result<()> {
        if rows_affected == 0 {
            Err(PublishError::EntityNotFound(id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn get_entity(&self, id: Uuid) -> Result<Option<PublishableEntity>> {
        let query = format!("SELECT {ENTITY_COLUMNS} FROM publishable_entities WHERE id = $1");
        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PublishableEntity::try_from).transpose()
    }

    async fn insert_entity(&self, entity: &PublishableEntity) -> Result<()> {
        let query = format!(
            "INSERT INTO publishable_entities ({ENTITY_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
              $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        );
        sqlx::query(&query)
            .bind(entity.id)
            .bind(entity.owner_id)
            .bind(&entity.title)
            .bind(&entity.description)
            .bind(&entity.tags)
            .bind(entity.status.as_str())
            .bind(entity.scheduled_at)
            .bind(entity.actual_publish_at)
            .bind(entity.upload_mode.as_str())
            .bind(&entity.staging_id)
            .bind(&entity.remote_id)
            .bind(&entity.remote_url)
            .bind(entity.retry_count)
            .bind(entity.last_retry_at)
            .bind(&entity.error_message)
            .bind(entity.execution_lock_id)
            .bind(entity.execution_locked_at)
            .bind(entity.post_count_incremented)
            .bind(entity.created_at)
            .bind(entity.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_owner(&self, owner_id: Uuid) -> Result<Option<Owner>> {
        let row: Option<(Uuid, i64)> =
            sqlx::query_as("SELECT id, post_count FROM owners WHERE id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, post_count)| Owner { id, post_count }))
    }

    async fn upsert_owner(&self, owner: &Owner) -> Result<()> {
        sqlx::query(
            "INSERT INTO owners (id, post_count) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET post_count = EXCLUDED.post_count",
        )
        .bind(owner.id)
        .bind(owner.post_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn owner_exists(&self, owner_id: Uuid) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM owners WHERE id = $1)")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn try_acquire_lock(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publishable_entities
            SET execution_lock_id = $2, execution_locked_at = $3
            WHERE id = $1 AND execution_lock_id IS NULL
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, id: Uuid, token: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publishable_entities
            SET execution_lock_id = NULL, execution_locked_at = NULL
            WHERE id = $1 AND execution_lock_id = $2
            "#,
        )
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(&self, id: Uuid, status: EntityStatus, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE publishable_entities SET status = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn record_staging(&self, id: Uuid, staging_id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE publishable_entities SET staging_id = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(staging_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn record_retry(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> Result<i32> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE publishable_entities
            SET retry_count = retry_count + 1, last_retry_at = $3, status = 'scheduled',
                error_message = $2, updated_at = $3
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(count,)| count)
            .ok_or(PublishError::EntityNotFound(id))
    }

    async fn complete_publish(
        &self,
        id: Uuid,
        receipt: &PublishReceipt,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE publishable_entities
            SET remote_id = $2, remote_url = COALESCE($3, remote_url), status = 'published',
                actual_publish_at = COALESCE(actual_publish_at, $4), error_message = NULL,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&receipt.remote_id)
        .bind(&receipt.remote_url)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        Self::expect_row(id, updated.rows_affected())?;

        // Compare-and-set guard: only the first completion bumps the counter
        let counted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE publishable_entities
            SET post_count_incremented = TRUE
            WHERE id = $1 AND post_count_incremented = FALSE
            RETURNING owner_id
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((owner_id,)) = counted {
            sqlx::query("UPDATE owners SET post_count = post_count + 1 WHERE id = $1")
                .bind(owner_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(counted.is_some())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        status: EntityStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE publishable_entities
            SET status = $2, error_message = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn reset_for_recovery(
        &self,
        id: Uuid,
        status: EntityStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE publishable_entities
            SET status = $2, error_message = $3, retry_count = retry_count + 1,
                last_retry_at = $4, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn pause_owner_scheduled(
        &self,
        owner_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE publishable_entities
            SET status = 'draft', error_message = $2, updated_at = $3
            WHERE owner_id = $1 AND status = 'scheduled'
            RETURNING id
            "#,
        )
        .bind(owner_id)
        .bind(message)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_entity(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM publishable_entities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_recovery_candidates(
        &self,
        stuck_before: DateTime<Utc>,
        after: Option<RecoveryCursor>,
        limit: u32,
    ) -> Result<Vec<PublishableEntity>> {
        let query = format!(
            r#"
            SELECT {ENTITY_COLUMNS}
            FROM publishable_entities
            WHERE (
                    execution_locked_at < $1
                    OR (execution_lock_id IS NULL
                        AND status IN ('uploading', 'publishing')
                        AND updated_at < $1)
                  )
              AND ($2::TIMESTAMPTZ IS NULL
                   OR (COALESCE(execution_locked_at, updated_at), id) > ($2, $3))
            ORDER BY COALESCE(execution_locked_at, updated_at) ASC, id ASC
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, EntityRow>(&query)
            .bind(stuck_before)
            .bind(after.map(|cursor| cursor.sort_key))
            .bind(after.map(|cursor| cursor.id))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        into_entities(rows)
    }

    async fn find_stale_locks(
        &self,
        locked_before: DateTime<Utc>,
        statuses: &[EntityStatus],
        limit: u32,
    ) -> Result<Vec<PublishableEntity>> {
        let query = format!(
            r#"
            SELECT {ENTITY_COLUMNS}
            FROM publishable_entities
            WHERE execution_lock_id IS NOT NULL
              AND execution_locked_at < $1
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
            ORDER BY execution_locked_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, EntityRow>(&query)
            .bind(locked_before)
            .bind(status_strings(statuses))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        into_entities(rows)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
