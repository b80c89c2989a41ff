//! # Publish Job
//!
//! Durable queue record. Job ids are derived from the entity id so the queue can
//! de-duplicate: there is never more than one live (waiting, delayed or active) job
//! per entity.

use crate::constants::{UploadMode, PUBLISH_JOB_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Deterministic job id for an entity
pub fn publish_job_id(entity_id: Uuid) -> String {
    format!("{PUBLISH_JOB_PREFIX}{entity_id}")
}

/// Queue lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Due now, waiting for a worker
    Waiting,
    /// Due at `run_at`
    Delayed,
    /// Claimed by a worker
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Live jobs block new inserts for the same entity
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed | Self::Active)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job state: {s}")),
        }
    }
}

/// What a worker needs to process the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishJobPayload {
    pub entity_id: Uuid,
    pub owner_id: Uuid,
    pub upload_mode: UploadMode,
}

/// Durable queue record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: PublishJobPayload,
    pub state: JobState,
    pub priority: i32,
    /// Failed attempts so far
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be dequeued
    pub run_at: DateTime<Utc>,
    /// When the current active claim began
    pub started_at: Option<DateTime<Utc>>,
    /// Cancel arrived while the job was active
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// New job due at `run_at`
    pub fn new(
        payload: PublishJobPayload,
        run_at: DateTime<Utc>,
        priority: i32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: publish_job_id(payload.entity_id),
            payload,
            state,
            priority,
            attempts_made: 0,
            max_attempts,
            run_at,
            started_at: None,
            cancel_requested: false,
            last_error: None,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payload() -> PublishJobPayload {
        PublishJobPayload {
            entity_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            upload_mode: UploadMode::Single,
        }
    }

    #[test]
    fn test_job_id_is_deterministic() {
        let entity_id = Uuid::new_v4();
        assert_eq!(publish_job_id(entity_id), publish_job_id(entity_id));
        assert!(publish_job_id(entity_id).starts_with("publish-"));
    }

    #[test]
    fn test_new_job_state_depends_on_run_at() {
        let now = Utc::now();
        let delayed = Job::new(payload(), now + Duration::seconds(30), 2, 3, now);
        assert_eq!(delayed.state, JobState::Delayed);
        assert!(!delayed.is_due(now));
        assert!(delayed.is_due(now + Duration::seconds(30)));

        let waiting = Job::new(payload(), now, 2, 3, now);
        assert_eq!(waiting.state, JobState::Waiting);
        assert!(waiting.is_due(now));
    }

    #[test]
    fn test_live_states() {
        assert!(JobState::Active.is_live());
        assert!(JobState::Delayed.is_live());
        assert!(!JobState::Completed.is_live());
        assert!(!JobState::Failed.is_live());
    }
}
