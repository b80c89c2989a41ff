//! # External Collaborators
//!
//! Interfaces the orchestrator consumes but does not implement: the remote publishing
//! provider, the storage cleanup queue and the auth-expiry notifier.
//!
//! Provider failures are reported as a structured [`ProviderError`] built once at the
//! call boundary, so downstream classification never re-parses free-form strings.

use crate::models::{PublishMetadata, PublishReceipt, PublishableEntity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Longest provider-requested wait that is honoured; larger hints are clamped
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(86_400);

/// Transport-level failure that never produced an HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connection,
}

/// Structured failure returned by the remote provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// HTTP status, when the provider answered at all
    pub status: Option<u16>,
    /// Provider error code (e.g. `invalid_token`, `rate_limited`)
    pub code: Option<String>,
    /// Human-readable provider message
    pub message: String,
    /// Explicit wait requested by the provider
    pub retry_after: Option<Duration>,
    /// Set when the request never completed
    pub transport: Option<TransportFailure>,
}

impl ProviderError {
    /// Failure carrying an HTTP status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
            retry_after: None,
            transport: None,
        }
    }

    /// Request timed out before a response arrived
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
            transport: Some(TransportFailure::Timeout),
        }
    }

    /// Connection refused / reset before a response arrived
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
            transport: Some(TransportFailure::Connection),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after.min(MAX_RETRY_AFTER));
        self
    }

    /// Build a provider error from a raw HTTP response
    ///
    /// `Retry-After` is honoured as delta-seconds or as an HTTP date. For throttling
    /// responses without the header, a wait embedded in the message ("retry after 30
    /// seconds", "try again in 1500 ms") is used instead. Either way the wait is
    /// capped at [`MAX_RETRY_AFTER`].
    pub fn from_response(
        status: u16,
        headers: &HashMap<String, String>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let mut retry_after = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, value)| parse_retry_after(value, Utc::now()));

        if retry_after.is_none() && status == 429 {
            retry_after = parse_wait_from_message(&message);
        }

        Self {
            status: Some(status),
            code: code.map(str::to_string),
            message,
            retry_after,
            transport: None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.transport) {
            (Some(status), _) => write!(f, "HTTP {status}: {}", self.message),
            (None, Some(TransportFailure::Timeout)) => write!(f, "timeout: {}", self.message),
            (None, Some(TransportFailure::Connection)) => {
                write!(f, "connection failure: {}", self.message)
            }
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Parse a `Retry-After` header value (delta-seconds or RFC 2822 date)
///
/// The result never exceeds [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let millis = date
        .with_timezone(&Utc)
        .signed_duration_since(now)
        .num_milliseconds();
    (millis > 0).then(|| Duration::from_millis(millis as u64).min(MAX_RETRY_AFTER))
}

/// Extract "<n> seconds" / "<n> ms" style waits from a throttle message
fn parse_wait_from_message(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.' || c == ':')
        .filter(|t| !t.is_empty())
        .collect();

    let wait = tokens.windows(2).find_map(|pair| {
        let amount = pair[0].parse::<u64>().ok()?;
        match pair[1] {
            "ms" | "millisecond" | "milliseconds" => Some(Duration::from_millis(amount)),
            "s" | "sec" | "secs" | "second" | "seconds" => Some(Duration::from_secs(amount)),
            "min" | "mins" | "minute" | "minutes" => {
                Some(Duration::from_secs(amount.saturating_mul(60)))
            }
            _ => None,
        }
    })?;
    Some(wait.min(MAX_RETRY_AFTER))
}

/// Remote art platform API
#[async_trait]
pub trait PublishProvider: Send + Sync {
    /// Upload the entity's content to the provider's staging area
    async fn stage(&self, entity: &PublishableEntity) -> Result<String, ProviderError>;

    /// Publish previously staged content
    async fn finalize(
        &self,
        staging_id: &str,
        metadata: &PublishMetadata,
    ) -> Result<PublishReceipt, ProviderError>;
}

/// Local asset cleanup, fire-and-forget and idempotent per entity
#[async_trait]
pub trait CleanupQueue: Send + Sync {
    async fn queue_cleanup(&self, entity_id: Uuid, owner_id: Uuid) -> crate::error::Result<()>;
}

/// Out-of-band notification when an owner's provider authorization expires
#[async_trait]
pub trait AuthExpiryNotifier: Send + Sync {
    async fn notify_auth_expired(
        &self,
        owner_id: Uuid,
        entity_title: &str,
    ) -> crate::error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("120", Utc::now()),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let parsed = parse_retry_after("Fri, 01 Mar 2024 12:00:30 +0000", now);
        assert_eq!(parsed, Some(Duration::from_secs(30)));

        let past = parse_retry_after("Fri, 01 Mar 2024 11:59:00 +0000", now);
        assert_eq!(past, None);
    }

    #[test]
    fn test_from_response_prefers_header() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "3".to_string());
        let error = ProviderError::from_response(429, &headers, None, "slow down for 10 seconds");
        assert_eq!(error.retry_after, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_from_response_falls_back_to_message() {
        let headers = HashMap::new();
        let error = ProviderError::from_response(
            429,
            &headers,
            Some("rate_limited"),
            "Rate limit exceeded. Retry after 1500 ms",
        );
        assert_eq!(error.retry_after, Some(Duration::from_millis(1500)));
        assert_eq!(error.code.as_deref(), Some("rate_limited"));

        let not_throttled = ProviderError::from_response(500, &headers, None, "wait 5 seconds");
        assert_eq!(not_throttled.retry_after, None);
    }

    #[test]
    fn test_oversized_retry_after_header_is_clamped() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), u64::MAX.to_string());
        let error = ProviderError::from_response(429, &headers, None, "Too Many Requests");
        assert_eq!(error.retry_after, Some(MAX_RETRY_AFTER));

        let now = Utc::now();
        let ten_years = (now + chrono::Duration::days(3650)).to_rfc2822();
        assert_eq!(parse_retry_after(&ten_years, now), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_oversized_message_wait_is_clamped() {
        let headers = HashMap::new();
        let error = ProviderError::from_response(
            429,
            &headers,
            None,
            "retry after 307445734561825862 minutes",
        );
        assert_eq!(error.retry_after, Some(MAX_RETRY_AFTER));

        let hinted = ProviderError::http(429, "slow down").with_retry_after(Duration::MAX);
        assert_eq!(hinted.retry_after, Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_display_includes_status() {
        let error = ProviderError::http(503, "maintenance");
        assert_eq!(error.to_string(), "HTTP 503: maintenance");
        assert_eq!(
            ProviderError::timeout("30s elapsed").to_string(),
            "timeout: 30s elapsed"
        );
    }
}
