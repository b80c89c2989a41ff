//! # Publish Job Queue
//!
//! Durable, de-duplicating queue of publish jobs. Job ids are derived from the entity
//! id, and the store's insert is a single atomic "insert unless a live job exists"
//! operation, so scheduling the same entity twice is a no-op.
//!
//! - [`JobStore`] - storage seam (in-memory and Postgres implementations)
//! - [`JobQueue`] - schedule / publish-now / cancel and the worker-facing operations
//! - [`BackoffCalculator`] - retry delay policy
//! - [`SubmissionLimiter`] - spaces out job starts against the provider

pub mod backoff;
pub mod limiter;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use backoff::BackoffCalculator;
pub use limiter::SubmissionLimiter;
pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PgJobStore;

use crate::config::QueueConfig;
use crate::constants::UploadMode;
use crate::error::Result;
use crate::models::{publish_job_id, Job, JobState, PublishJobPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// A waiting or delayed job was removed
    Removed,
    /// The job is running; its retry or re-queue will be dropped
    FlaggedActive,
    /// No live job exists
    NotFound,
}

/// Job count per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Delayed => self.delayed += count,
            JobState::Active => self.active += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
        }
    }

    /// Waiting, delayed and active jobs
    pub fn live(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }
}

/// Storage for publish jobs
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert the job unless a live job with the same id exists. A terminal job with
    /// the same id is replaced. Returns whether the job was inserted.
    async fn insert_unless_live(&self, job: Job) -> Result<bool>;

    /// Claim the most urgent due job, moving it to `active`
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    async fn fail(&self, job_id: &str, error: &str) -> Result<()>;

    /// Return an active job to the schedule at `run_at`
    ///
    /// `count_attempt` increments `attempts_made`. A job flagged `cancel_requested` is
    /// removed instead; returns whether it was re-scheduled.
    async fn reschedule(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        count_attempt: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Remove a waiting/delayed job or flag an active one
    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome>;

    /// Return active jobs started before `started_before` to `waiting`
    async fn recover_stalled(&self, started_before: DateTime<Utc>) -> Result<u64>;

    async fn counts(&self) -> Result<JobCounts>;

    async fn ping(&self) -> Result<()>;
}

/// Whether a schedule request created a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleOutcome {
    Enqueued { job_id: String, run_at: DateTime<Utc> },
    AlreadyQueued { job_id: String },
}

impl ScheduleOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Enqueued { job_id, .. } | Self::AlreadyQueued { job_id } => job_id,
        }
    }

    pub fn was_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// Publish job queue over a [`JobStore`]
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Schedule publication at `at`. A live job for the entity makes this a no-op.
    pub async fn schedule(
        &self,
        entity_id: Uuid,
        owner_id: Uuid,
        at: DateTime<Utc>,
        upload_mode: UploadMode,
    ) -> Result<ScheduleOutcome> {
        let run_at = at + self.jitter();
        self.enqueue(entity_id, owner_id, run_at, upload_mode, Utc::now())
            .await
    }

    /// Publish as soon as a worker is free
    pub async fn publish_now(
        &self,
        entity_id: Uuid,
        owner_id: Uuid,
        upload_mode: UploadMode,
    ) -> Result<ScheduleOutcome> {
        let now = Utc::now();
        self.enqueue(entity_id, owner_id, now, upload_mode, now).await
    }

    async fn enqueue(
        &self,
        entity_id: Uuid,
        owner_id: Uuid,
        run_at: DateTime<Utc>,
        upload_mode: UploadMode,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let payload = PublishJobPayload {
            entity_id,
            owner_id,
            upload_mode,
        };
        // delay = max(0, at - now)
        let run_at = run_at.max(now);
        let job = Job::new(
            payload,
            run_at,
            self.config.default_priority,
            self.config.max_attempts,
            now,
        );
        let job_id = job.id.clone();

        if self.store.insert_unless_live(job).await? {
            info!(
                job_id = %job_id,
                entity_id = %entity_id,
                run_at = %run_at,
                "📅 Publish job enqueued"
            );
            Ok(ScheduleOutcome::Enqueued { job_id, run_at })
        } else {
            debug!(job_id = %job_id, "Live publish job already exists, skipping");
            Ok(ScheduleOutcome::AlreadyQueued { job_id })
        }
    }

    /// Random extra delay for scheduled (not immediate) publishes
    fn jitter(&self) -> chrono::Duration {
        match self.config.publish_jitter_seconds {
            0 => chrono::Duration::zero(),
            max => {
                let seconds = rand::thread_rng().gen_range(0..=max);
                chrono::Duration::seconds(seconds as i64)
            }
        }
    }

    /// Cancel the entity's job. Returns true when a queued job was removed.
    pub async fn cancel(&self, entity_id: Uuid) -> Result<bool> {
        let job_id = publish_job_id(entity_id);
        let outcome = self.store.cancel(&job_id).await?;
        match outcome {
            CancelOutcome::Removed => info!(job_id = %job_id, "🛑 Publish job cancelled"),
            CancelOutcome::FlaggedActive => info!(
                job_id = %job_id,
                "Publish job is running; its follow-up will be dropped"
            ),
            CancelOutcome::NotFound => debug!(job_id = %job_id, "No live publish job to cancel"),
        }
        Ok(outcome == CancelOutcome::Removed)
    }

    pub async fn dequeue(&self) -> Result<Option<Job>> {
        self.store.dequeue(Utc::now()).await
    }

    pub async fn get(&self, entity_id: Uuid) -> Result<Option<Job>> {
        self.store.get(&publish_job_id(entity_id)).await
    }

    pub async fn complete(&self, job: &Job) -> Result<()> {
        self.store.complete(&job.id).await
    }

    pub async fn fail(&self, job: &Job, error: &str) -> Result<()> {
        self.store.fail(&job.id, error).await
    }

    /// Re-enqueue after a failed attempt. Returns false when a cancel dropped it.
    pub async fn retry(&self, job: &Job, delay: Duration, error: &str) -> Result<bool> {
        let now = Utc::now();
        self.store
            .reschedule(&job.id, now + to_chrono(delay), true, Some(error), now)
            .await
    }

    /// Re-enqueue without counting an attempt (lock unavailable, stuck recovery)
    pub async fn requeue(&self, job: &Job, delay: Duration) -> Result<bool> {
        let now = Utc::now();
        self.store
            .reschedule(&job.id, now + to_chrono(delay), false, None, now)
            .await
    }

    /// Return jobs active for longer than the stall timeout to `waiting`
    pub async fn recover_stalled(&self) -> Result<u64> {
        let cutoff = Utc::now() - to_chrono(self.config.stall_timeout());
        self.store.recover_stalled(cutoff).await
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        self.store.counts().await
    }

    pub async fn is_connected(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
