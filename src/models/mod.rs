//! # Data Models
//!
//! The publishable entity (an art post), its owner, and the durable queue record that
//! drives one entity through its publish lifecycle.
//!
//! - [`entity`] - [`PublishableEntity`], [`Owner`] and provider receipts
//! - [`job`] - [`Job`], [`JobState`] and the job payload

pub mod entity;
pub mod job;

pub use entity::{Owner, PublishMetadata, PublishReceipt, PublishableEntity};
pub use job::{publish_job_id, Job, JobState, PublishJobPayload};
