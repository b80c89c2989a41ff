//! # Publish Error Classification
//!
//! Maps every failure a publish attempt can produce onto a small taxonomy that
//! drives retry decisions.
//!
//! ## Overview
//!
//! Provider failures arrive as a structured [`ProviderError`] built at the call
//! boundary, so classification is a pure function over status codes, provider error
//! codes and transport flags. No free-form message parsing happens here.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  PublishError   │────▶│ ErrorClassifier │────▶│ CategorizedError │
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//! ```
//!
//! | Category | Retried | Source |
//! |---|---|---|
//! | `RateLimited` | yes, after the wait hint | 429, `rate_limited` codes |
//! | `AuthExpired` | never | 401, token-expired codes |
//! | `CircuitOpen` | yes, fixed delay | breaker rejection |
//! | `Transient` | yes, exponential | timeouts, connection errors, 5xx, 408, store errors |
//! | `Validation` | never | other 4xx |
//! | `Fatal` | never | invariant violations, configuration |
//!
//! ## Usage
//!
//! ```rust
//! use artpost_core::collaborators::ProviderError;
//! use artpost_core::error::PublishError;
//! use artpost_core::orchestration::error_classifier::{
//!     ErrorCategory, ErrorClassifier, StandardErrorClassifier,
//! };
//! use std::time::Duration;
//!
//! let classifier = StandardErrorClassifier::new();
//! let error = PublishError::provider(
//!     "finalize",
//!     ProviderError::http(429, "slow down").with_retry_after(Duration::from_secs(5)),
//! );
//!
//! let categorized = classifier.classify_error(&error);
//! assert_eq!(categorized.category, ErrorCategory::RateLimited);
//! assert_eq!(categorized.wait_hint, Some(Duration::from_secs(5)));
//! ```

use crate::collaborators::{ProviderError, TransportFailure};
use crate::error::PublishError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Provider error codes that mean the caller is being throttled
const RATE_LIMIT_CODES: &[&str] = &["rate_limited", "rate_limit_exceeded", "too_many_requests"];

/// Provider error codes that mean the owner's authorization is gone
const AUTH_EXPIRED_CODES: &[&str] = &[
    "invalid_token",
    "token_expired",
    "expired_token",
    "invalid_grant",
    "unauthorized",
];

/// Error taxonomy for publish failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Provider throttled the request
    RateLimited,

    /// Owner's provider authorization expired, needs a human to reconnect
    AuthExpired,

    /// Circuit breaker rejected the call without invoking the provider
    CircuitOpen,

    /// May succeed on retry
    Transient,

    /// Provider rejected the content, retrying cannot help
    Validation,

    /// Internal failure, terminal
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Transient => "TRANSIENT",
            Self::Validation => "VALIDATION",
            Self::Fatal => "FATAL",
        }
    }

    /// Whether the category is ever retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::CircuitOpen | Self::Transient)
    }

    /// Whether the failure says anything about the dependency's health
    ///
    /// Throttling, validation and auth responses prove the provider answered.
    pub fn counts_against_dependency(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub const ALL: [ErrorCategory; 6] = [
        Self::RateLimited,
        Self::AuthExpired,
        Self::CircuitOpen,
        Self::Transient,
        Self::Validation,
        Self::Fatal,
    ];
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a publish failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizedError {
    pub category: ErrorCategory,

    pub retryable: bool,

    /// Provider-requested wait before the next attempt
    pub wait_hint: Option<Duration>,

    /// Message persisted on the entity
    pub message: String,
}

impl CategorizedError {
    fn new(category: ErrorCategory, message: String) -> Self {
        Self {
            category,
            retryable: category.is_retryable(),
            wait_hint: None,
            message,
        }
    }

    fn with_wait_hint(mut self, wait_hint: Option<Duration>) -> Self {
        self.wait_hint = wait_hint;
        self
    }
}

/// Classification strategy seam
pub trait ErrorClassifier: Send + Sync {
    fn classify_error(&self, error: &PublishError) -> CategorizedError;

    fn classifier_name(&self) -> &'static str;
}

/// Rule set described in the module docs
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_provider_error(&self, operation: &str, source: &ProviderError) -> CategorizedError {
        let message = format!("{operation} failed: {source}");
        let code = source.code.as_deref().map(str::to_ascii_lowercase);
        let code_in = |codes: &[&str]| code.as_deref().map(|c| codes.contains(&c)).unwrap_or(false);

        if source.status == Some(429) || code_in(RATE_LIMIT_CODES) {
            return CategorizedError::new(ErrorCategory::RateLimited, message)
                .with_wait_hint(source.retry_after);
        }

        if source.status == Some(401) || code_in(AUTH_EXPIRED_CODES) {
            return CategorizedError::new(ErrorCategory::AuthExpired, message);
        }

        if let Some(transport) = source.transport {
            let message = match transport {
                TransportFailure::Timeout => format!("{operation} timed out: {}", source.message),
                TransportFailure::Connection => {
                    format!("{operation} could not connect: {}", source.message)
                }
            };
            return CategorizedError::new(ErrorCategory::Transient, message);
        }

        match source.status {
            Some(408) => CategorizedError::new(ErrorCategory::Transient, message),
            Some(status) if (400..500).contains(&status) => {
                CategorizedError::new(ErrorCategory::Validation, message)
            }
            Some(_) | None => CategorizedError::new(ErrorCategory::Transient, message),
        }
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify_error(&self, error: &PublishError) -> CategorizedError {
        match error {
            PublishError::Provider { operation, source } => {
                self.classify_provider_error(operation, source)
            }
            PublishError::CircuitBreakerOpen(component) => CategorizedError::new(
                ErrorCategory::CircuitOpen,
                format!("Remote dependency {component} is unavailable (circuit open)"),
            ),
            PublishError::Timeout(_)
            | PublishError::DatabaseError(_)
            | PublishError::QueueError(_)
            | PublishError::WorkerError(_) => {
                CategorizedError::new(ErrorCategory::Transient, error.to_string())
            }
            PublishError::ValidationError(_) => {
                CategorizedError::new(ErrorCategory::Validation, error.to_string())
            }
            PublishError::ConfigurationError(_)
            | PublishError::EntityNotFound(_)
            | PublishError::InvariantViolation(_) => {
                CategorizedError::new(ErrorCategory::Fatal, error.to_string())
            }
        }
    }

    fn classifier_name(&self) -> &'static str {
        "standard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn classify(error: PublishError) -> CategorizedError {
        StandardErrorClassifier::new().classify_error(&error)
    }

    fn provider(source: ProviderError) -> PublishError {
        PublishError::provider("finalize", source)
    }

    #[test]
    fn test_rate_limited_carries_wait_hint() {
        let result = classify(provider(
            ProviderError::http(429, "Too Many Requests").with_retry_after(Duration::from_secs(5)),
        ));
        assert_eq!(result.category, ErrorCategory::RateLimited);
        assert!(result.retryable);
        assert_eq!(result.wait_hint, Some(Duration::from_secs(5)));

        let by_code = classify(provider(
            ProviderError::http(400, "quota").with_code("rate_limited"),
        ));
        assert_eq!(by_code.category, ErrorCategory::RateLimited);
    }

    #[test]
    fn test_auth_expired_is_never_retried() {
        let unauthorized = classify(provider(ProviderError::http(401, "Unauthorized")));
        assert_eq!(unauthorized.category, ErrorCategory::AuthExpired);
        assert!(!unauthorized.retryable);

        let by_code = classify(provider(
            ProviderError::http(400, "token expired").with_code("invalid_token"),
        ));
        assert_eq!(by_code.category, ErrorCategory::AuthExpired);
    }

    #[test]
    fn test_client_errors_are_validation_except_408() {
        let rejected = classify(provider(ProviderError::http(422, "title too long")));
        assert_eq!(rejected.category, ErrorCategory::Validation);
        assert!(!rejected.retryable);

        let request_timeout = classify(provider(ProviderError::http(408, "Request Timeout")));
        assert_eq!(request_timeout.category, ErrorCategory::Transient);
    }

    #[test]
    fn test_transient_sources() {
        for error in [
            provider(ProviderError::http(503, "maintenance")),
            provider(ProviderError::timeout("30s elapsed")),
            provider(ProviderError::connection("connection reset")),
            PublishError::DatabaseError("pool timed out".to_string()),
            PublishError::Timeout("stage".to_string()),
        ] {
            let result = classify(error);
            assert_eq!(result.category, ErrorCategory::Transient);
            assert!(result.retryable);
            assert_eq!(result.wait_hint, None);
        }
    }

    #[test]
    fn test_circuit_open_and_fatal() {
        let open = classify(PublishError::CircuitBreakerOpen("publish-api".to_string()));
        assert_eq!(open.category, ErrorCategory::CircuitOpen);
        assert!(open.retryable);

        let fatal = classify(PublishError::InvariantViolation("lock mismatch".to_string()));
        assert_eq!(fatal.category, ErrorCategory::Fatal);
        assert!(!fatal.retryable);

        let missing = classify(PublishError::EntityNotFound(Uuid::new_v4()));
        assert_eq!(missing.category, ErrorCategory::Fatal);
    }

    #[test]
    fn test_only_transient_counts_against_dependency() {
        for category in ErrorCategory::ALL {
            assert_eq!(
                category.counts_against_dependency(),
                category == ErrorCategory::Transient
            );
        }
    }
}
