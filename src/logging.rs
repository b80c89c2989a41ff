//! # Structured Logging Module
//!
//! Environment-aware structured logging for the worker pool and the sweeps.
//! `RUST_LOG` wins when set; otherwise the level follows the detected environment.
//! `ARTPOST_LOG_FORMAT=json` switches the console output to JSON lines.

use crate::config::ConfigManager;
use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = wants_json(std::env::var("ARTPOST_LOG_FORMAT").ok().as_deref());

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn wants_json(format: Option<&str>) -> bool {
    format
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log structured data for publish job operations
pub fn log_job_operation(
    operation: &str,
    job_id: &str,
    entity_id: Uuid,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        entity_id = %entity_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

/// Log structured data for sweep runs
pub fn log_sweep_operation(
    sweep: &str,
    scanned: usize,
    acted: usize,
    failures: usize,
    duration_ms: u64,
) {
    tracing::info!(
        sweep = %sweep,
        scanned = scanned,
        acted = acted,
        failures = failures,
        duration_ms = duration_ms,
        timestamp = %Utc::now().to_rfc3339(),
        "🧹 SWEEP_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
