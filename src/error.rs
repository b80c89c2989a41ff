//! Error types for the publish orchestrator.

use crate::collaborators::ProviderError;
use crate::config::ConfigurationError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Structured failure returned by the remote publishing provider
    #[error("Provider error during {operation}: {source}")]
    Provider {
        operation: String,
        source: ProviderError,
    },
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Entity {0} not found")]
    EntityNotFound(Uuid),
    /// Internal invariant violation, never retried
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Worker error: {0}")]
    WorkerError(String),
}

impl PublishError {
    /// Wrap a provider failure with the operation that produced it
    pub fn provider(operation: impl Into<String>, source: ProviderError) -> Self {
        PublishError::Provider {
            operation: operation.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for PublishError {
    fn from(err: sqlx::Error) -> Self {
        PublishError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(error: serde_json::Error) -> Self {
        PublishError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<ConfigurationError> for PublishError {
    fn from(error: ConfigurationError) -> Self {
        PublishError::ConfigurationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PublishError>;
