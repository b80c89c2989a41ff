#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ArtPost Core Rust
//!
//! Durable publish-job orchestration for scheduling art posts onto a remote,
//! rate-limited publishing platform.
//!
//! ## Overview
//!
//! An owner schedules a publishable entity for a point in time. A durable job queue
//! hands the due job to a worker pool, which stages the artwork, finalizes the
//! publication on the provider and records the outcome. Everything in between is
//! built to survive crashes, provider throttling and concurrent workers:
//!
//! - **Exactly-once effect**: an advisory execution lock per entity plus
//!   "ghost publish" detection (remote id present, local record behind)
//! - **Classified failures**: every error maps onto a retry category with its own
//!   backoff policy; auth expiry pauses the owner's whole schedule
//! - **Resilience**: a circuit breaker and an adaptive (AIMD) rate limiter per
//!   remote dependency
//! - **Self-healing**: periodic stuck-job recovery and stale-lock cleanup sweeps
//!
//! ## Module Organization
//!
//! - [`models`] - entities, owners and queue records
//! - [`store`] - entity persistence (in-memory and Postgres)
//! - [`queue`] - durable job queue, backoff and submission spacing
//! - [`resilience`] - circuit breakers and the adaptive rate limiter
//! - [`orchestration`] - workers, sweeps and the system bootstrap
//! - [`collaborators`] - provider, cleanup and notification seams
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use artpost_core::orchestration::PublishSystem;
//! use artpost_core::test_helpers::{RecordingCleanup, RecordingNotifier, ScriptedProvider};
//! use artpost_core::constants::UploadMode;
//! use std::sync::Arc;
//!
//! # async fn example() -> artpost_core::Result<()> {
//! let system = PublishSystem::builder()
//!     .with_provider(Arc::new(ScriptedProvider::new()))
//!     .with_cleanup(Arc::new(RecordingCleanup::new()))
//!     .with_notifier(Arc::new(RecordingNotifier::new()))
//!     .build()?;
//!
//! system.start();
//! # let (entity_id, owner_id) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
//! system.publish_now(entity_id, owner_id, UploadMode::Single).await?;
//! system.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests run against the in-memory stores; nothing needs a database:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod queue;
pub mod resilience;
pub mod store;
pub mod test_helpers;

pub use collaborators::{AuthExpiryNotifier, CleanupQueue, ProviderError, PublishProvider};
pub use config::{ConfigManager, PublisherConfig};
pub use constants::{EntityStatus, UploadMode};
pub use error::{PublishError, Result};
pub use models::{Job, JobState, Owner, PublishableEntity};
pub use orchestration::{HealthStatus, PublishSystem, PublishSystemBuilder};
