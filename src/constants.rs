//! # System Constants
//!
//! Lifecycle states, status groups and well-known names shared by the queue, the
//! publish worker and the reconciliation sweeps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of deterministic job ids (`publish-<entity id>`)
pub const PUBLISH_JOB_PREFIX: &str = "publish-";

/// Logical remote dependencies guarded by their own breaker and limiter
pub mod dependencies {
    pub const STAGING_API: &str = "staging-api";
    pub const PUBLISH_API: &str = "publish-api";
}

/// Job priorities (higher is more urgent). Every publish job uses `NORMAL` today.
pub mod priority {
    pub const LOW: i32 = 1;
    pub const NORMAL: i32 = 2;
    pub const HIGH: i32 = 3;
    pub const URGENT: i32 = 4;
}

/// Lifecycle of a publishable entity
///
/// `draft → scheduled → uploading → publishing → published`, with `failed` reachable
/// from every non-terminal state. `review` is a human gate ahead of `draft`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Review,
    Draft,
    Scheduled,
    Uploading,
    Publishing,
    Published,
    Failed,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Uploading => "uploading",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// No further transitions happen from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published)
    }

    /// Statuses that only exist while a worker is talking to the provider
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Uploading | Self::Publishing)
    }

    /// Statuses a dequeued publish job is allowed to act on
    pub fn is_publishable(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Uploading | Self::Publishing)
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "review" => Ok(Self::Review),
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "uploading" => Ok(Self::Uploading),
            "publishing" => Ok(Self::Publishing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid entity status: {s}")),
        }
    }
}

/// How the entity's assets are pushed to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    #[default]
    Single,
    Multiple,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multiple => "multiple",
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UploadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "multiple" => Ok(Self::Multiple),
            _ => Err(format!("Invalid upload mode: {s}")),
        }
    }
}

/// Status groupings used by the sweeps
pub mod status_groups {
    use super::EntityStatus;

    /// Legacy intermediate statuses a crashed worker can leave behind
    pub const IN_FLIGHT: &[EntityStatus] = &[EntityStatus::Uploading, EntityStatus::Publishing];

    /// Early lifecycle statuses covered by the lock cleanup sweep
    pub const EARLY_LIFECYCLE: &[EntityStatus] = &[EntityStatus::Scheduled, EntityStatus::Draft];
}

/// Human-readable messages persisted on entities
pub mod messages {
    pub const AUTH_EXPIRED_PAUSED: &str =
        "Publishing paused: the platform authorization expired. Reconnect your account and reschedule.";
    pub const RECOVERY_REQUEUED: &str =
        "Publishing was interrupted after upload; it has been rescheduled automatically.";
    pub const RECOVERY_RESET_TO_DRAFT: &str =
        "Publishing was interrupted and could not be resumed. Please schedule it again.";
    pub const RETRIES_EXHAUSTED: &str = "Publishing failed after the maximum number of attempts";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            EntityStatus::Review,
            EntityStatus::Draft,
            EntityStatus::Scheduled,
            EntityStatus::Uploading,
            EntityStatus::Publishing,
            EntityStatus::Published,
            EntityStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EntityStatus>(), Ok(status));
        }
        assert!("archived".parse::<EntityStatus>().is_err());
    }

    #[test]
    fn test_status_groups() {
        assert!(EntityStatus::Publishing.is_in_flight());
        assert!(!EntityStatus::Scheduled.is_in_flight());
        assert!(EntityStatus::Scheduled.is_publishable());
        assert!(!EntityStatus::Draft.is_publishable());
        assert!(EntityStatus::Published.is_terminal());
        assert!(!EntityStatus::Failed.is_terminal());
    }

    #[test]
    fn test_upload_mode_serde() {
        let json = serde_json::to_string(&UploadMode::Multiple).unwrap();
        assert_eq!(json, "\"multiple\"");
        assert_eq!(UploadMode::default(), UploadMode::Single);
    }
}
