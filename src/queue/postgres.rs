//! # Postgres Job Store
//!
//! Jobs live in `publish_jobs`. De-duplication is an `INSERT ... ON CONFLICT DO UPDATE
//! ... WHERE state IN ('completed', 'failed')` so only terminal rows are replaced, and
//! dequeue claims with `FOR UPDATE SKIP LOCKED` so concurrent workers never contend
//! on the same row.

use super::{CancelOutcome, JobCounts, JobStore};
use crate::error::{PublishError, Result};
use crate::models::{Job, JobState, PublishJobPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id, entity_id, owner_id, upload_mode, state, priority, attempts_made, max_attempts,
    run_at, started_at, cancel_requested, last_error, created_at
"#;

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    entity_id: Uuid,
    owner_id: Uuid,
    upload_mode: String,
    state: String,
    priority: i32,
    attempts_made: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = PublishError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            payload: PublishJobPayload {
                entity_id: row.entity_id,
                owner_id: row.owner_id,
                upload_mode: row.upload_mode.parse().map_err(PublishError::QueueError)?,
            },
            state: row.state.parse().map_err(PublishError::QueueError)?,
            priority: row.priority,
            attempts_made: row.attempts_made.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            run_at: row.run_at,
            started_at: row.started_at,
            cancel_requested: row.cancel_requested,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

/// Postgres-backed job store
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_unless_live(&self, job: Job) -> Result<bool> {
        let query = format!(
            r#"
            INSERT INTO publish_jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, FALSE, NULL, $10)
            ON CONFLICT (id) DO UPDATE SET
                entity_id = EXCLUDED.entity_id,
                owner_id = EXCLUDED.owner_id,
                upload_mode = EXCLUDED.upload_mode,
                state = EXCLUDED.state,
                priority = EXCLUDED.priority,
                attempts_made = EXCLUDED.attempts_made,
                max_attempts = EXCLUDED.max_attempts,
                run_at = EXCLUDED.run_at,
                started_at = NULL,
                cancel_requested = FALSE,
                last_error = NULL,
                created_at = EXCLUDED.created_at
            WHERE publish_jobs.state IN ('completed', 'failed')
            "#
        );

        let result = sqlx::query(&query)
            .bind(&job.id)
            .bind(job.payload.entity_id)
            .bind(job.payload.owner_id)
            .bind(job.payload.upload_mode.as_str())
            .bind(job.state.as_str())
            .bind(job.priority)
            .bind(job.attempts_made as i32)
            .bind(job.max_attempts as i32)
            .bind(job.run_at)
            .bind(job.created_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let query = format!(
            r#"
            WITH next_job AS (
                SELECT id FROM publish_jobs
                WHERE state IN ('waiting', 'delayed') AND run_at <= $1
                ORDER BY priority DESC, run_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE publish_jobs
            SET state = 'active', started_at = $1
            FROM next_job
            WHERE publish_jobs.id = next_job.id
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(',')
                .map(|column| format!("publish_jobs.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to dequeue publish job: {}", e);
                PublishError::QueueError(format!("Dequeue failed: {e}"))
            })?;

        if let Some(row) = &row {
            debug!(job_id = %row.id, "Claimed publish job");
        }
        row.map(Job::try_from).transpose()
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM publish_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE publish_jobs SET state = 'completed', started_at = NULL WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publish_jobs
            SET state = 'failed', started_at = NULL, attempts_made = attempts_made + 1,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        count_attempt: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let dropped = sqlx::query(
            "DELETE FROM publish_jobs WHERE id = $1 AND cancel_requested = TRUE",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if dropped.rows_affected() > 0 {
            tx.commit().await?;
            return Ok(false);
        }

        let state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let updated = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET state = $2, run_at = $3, started_at = NULL,
                attempts_made = attempts_made + CASE WHEN $4 THEN 1 ELSE 0 END,
                last_error = COALESCE($5, last_error)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(run_at)
        .bind(count_attempt)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let removed = sqlx::query(
            "DELETE FROM publish_jobs WHERE id = $1 AND state IN ('waiting', 'delayed')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if removed.rows_affected() > 0 {
            return Ok(CancelOutcome::Removed);
        }

        let flagged = sqlx::query(
            "UPDATE publish_jobs SET cancel_requested = TRUE WHERE id = $1 AND state = 'active'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if flagged.rows_affected() > 0 {
            Ok(CancelOutcome::FlaggedActive)
        } else {
            Ok(CancelOutcome::NotFound)
        }
    }

    async fn recover_stalled(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET state = 'waiting', started_at = NULL
            WHERE state = 'active' AND (started_at IS NULL OR started_at < $1)
            "#,
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM publish_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            let state: JobState = state.parse().map_err(PublishError::QueueError)?;
            counts.add(state, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
