//! In-memory job store. Every operation runs under one mutex, which gives the same
//! atomicity the Postgres store gets from single statements.

use super::{CancelOutcome, JobCounts, JobStore};
use crate::error::{PublishError, Result};
use crate::models::{Job, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored job, terminal ones included
    pub fn all_jobs(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    /// Make every delayed job due now. Returns how many moved.
    pub fn fast_forward(&self, now: DateTime<Utc>) -> usize {
        let mut moved = 0;
        for job in self.jobs.lock().values_mut() {
            if matches!(job.state, JobState::Waiting | JobState::Delayed) && job.run_at > now {
                job.state = JobState::Waiting;
                job.run_at = now;
                moved += 1;
            }
        }
        moved
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_unless_live(&self, job: Job) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get(&job.id) {
            if existing.state.is_live() {
                return Ok(false);
            }
        }
        jobs.insert(job.id.clone(), job);
        Ok(true)
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock();
        let next_id = jobs
            .values()
            .filter(|job| job.is_due(now))
            // Highest priority first, then earliest run_at
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.run_at.cmp(&b.run_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|job| job.id.clone());

        Ok(next_id.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.state = JobState::Active;
                job.started_at = Some(now);
                job.clone()
            })
        }))
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| PublishError::QueueError(format!("Job {job_id} not found")))?;
        job.state = JobState::Completed;
        job.started_at = None;
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| PublishError::QueueError(format!("Job {job_id} not found")))?;
        job.state = JobState::Failed;
        job.started_at = None;
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());
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
        let mut jobs = self.jobs.lock();
        let cancelled = match jobs.get(job_id) {
            Some(job) => job.cancel_requested,
            None => return Ok(false),
        };
        if cancelled {
            jobs.remove(job_id);
            return Ok(false);
        }

        if let Some(job) = jobs.get_mut(job_id) {
            job.state = if run_at > now {
                JobState::Delayed
            } else {
                JobState::Waiting
            };
            job.run_at = run_at;
            job.started_at = None;
            if count_attempt {
                job.attempts_made += 1;
            }
            if let Some(error) = error {
                job.last_error = Some(error.to_string());
            }
        }
        Ok(true)
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut jobs = self.jobs.lock();
        let state = match jobs.get(job_id) {
            Some(job) => job.state,
            None => return Ok(CancelOutcome::NotFound),
        };

        match state {
            JobState::Waiting | JobState::Delayed => {
                jobs.remove(job_id);
                Ok(CancelOutcome::Removed)
            }
            JobState::Active => {
                if let Some(job) = jobs.get_mut(job_id) {
                    job.cancel_requested = true;
                }
                Ok(CancelOutcome::FlaggedActive)
            }
            JobState::Completed | JobState::Failed => Ok(CancelOutcome::NotFound),
        }
    }

    async fn recover_stalled(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let mut recovered = 0;
        for job in jobs.values_mut() {
            let stalled = job.state == JobState::Active
                && job.started_at.map(|t| t < started_before).unwrap_or(true);
            if stalled {
                job.state = JobState::Waiting;
                job.started_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let jobs = self.jobs.lock();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::UploadMode;
    use crate::models::PublishJobPayload;
    use chrono::Duration;
    use uuid::Uuid;

    fn job(priority: i32, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        let payload = PublishJobPayload {
            entity_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            upload_mode: UploadMode::Single,
        };
        Job::new(payload, run_at, priority, 3, now)
    }

    #[tokio::test]
    async fn test_terminal_job_is_replaced() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = job(2, now, now);
        let id = first.id.clone();

        assert!(store.insert_unless_live(first.clone()).await.unwrap());
        store.dequeue(now).await.unwrap();
        store.complete(&id).await.unwrap();

        assert!(store.insert_unless_live(first).await.unwrap());
        assert_eq!(
            store.get(&id).await.unwrap().map(|j| j.state),
            Some(JobState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_run_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let early_normal = job(2, now - Duration::minutes(10), now);
        let late_high = job(3, now - Duration::minutes(1), now);
        let future = job(4, now + Duration::minutes(1), now);

        for j in [&early_normal, &late_high, &future] {
            store.insert_unless_live(j.clone()).await.unwrap();
        }

        assert_eq!(store.dequeue(now).await.unwrap().unwrap().id, late_high.id);
        assert_eq!(
            store.dequeue(now).await.unwrap().unwrap().id,
            early_normal.id
        );
        assert!(store.dequeue(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_does_not_count_attempt() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let j = job(2, now, now);
        store.insert_unless_live(j.clone()).await.unwrap();
        store.dequeue(now).await.unwrap();

        assert!(store
            .reschedule(&j.id, now + Duration::seconds(5), false, None, now)
            .await
            .unwrap());
        let stored = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts_made, 0);
        assert_eq!(stored.state, JobState::Delayed);

        store.dequeue(now + Duration::seconds(5)).await.unwrap();
        store
            .reschedule(&j.id, now, true, Some("HTTP 502"), now)
            .await
            .unwrap();
        let stored = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 502"));
    }

    #[tokio::test]
    async fn test_recover_stalled_returns_old_active_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let stalled = job(2, now - Duration::minutes(30), now);
        store.insert_unless_live(stalled.clone()).await.unwrap();
        store.dequeue(now - Duration::minutes(20)).await.unwrap();

        let recovered = store
            .recover_stalled(now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(store.counts().await.unwrap().waiting, 1);
    }
}
