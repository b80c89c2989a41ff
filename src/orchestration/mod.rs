//! # Publish Orchestration
//!
//! Everything between a due job and a persisted outcome.
//!
//! ## Core Components
//!
//! - **PublishWorker**: runs one attempt through lock, stage, finalize and settlement
//! - **PublishWorkerPool**: fixed set of workers with submission spacing and stall checks
//! - **ErrorClassifier**: maps failures onto the retry taxonomy
//! - **ExecutionLockManager**: per-entity lease via compare-and-swap on the store
//! - **StuckJobRecovery** / **LockCleanup**: periodic reconciliation sweeps
//! - **PublishSystem**: wiring, lifecycle and health
//!
//! ```text
//! JobQueue ──dequeue──▶ PublishWorkerPool ──▶ PublishWorker ──▶ PublishProvider
//!                                                │    ▲
//!                                   ExecutionLock│    │CircuitBreaker + RateLimiter
//!                                                ▼    │
//!                                            EntityStore ◀── StuckJobRecovery / LockCleanup
//! ```

pub mod bootstrap;
pub mod error_classifier;
pub mod execution_lock;
pub mod lock_cleanup;
pub mod periodic;
pub mod publish_worker;
pub mod stuck_job_recovery;
pub mod worker_pool;

pub use bootstrap::{HealthStatus, PublishSystem, PublishSystemBuilder};
pub use error_classifier::{
    CategorizedError, ErrorCategory, ErrorClassifier, StandardErrorClassifier,
};
pub use execution_lock::{ExecutionLockManager, LockToken};
pub use lock_cleanup::LockCleanup;
pub use periodic::{PeriodicTask, Sweep, SweepReport};
pub use publish_worker::{JobOutcome, PublishServices, PublishWorker};
pub use stuck_job_recovery::{RecoveryAction, RecoveryReport, StuckJobRecovery};
pub use worker_pool::PublishWorkerPool;
