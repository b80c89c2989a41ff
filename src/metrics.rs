//! # Publish Metrics
//!
//! Counters and latency samples for the worker pool and the reconciliation sweeps.
//! Recording never fails and never influences control flow; readers take a
//! serialisable [`MetricsSnapshot`].

use crate::orchestration::ErrorCategory;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bounded latency window
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Throughput is reported over this trailing window
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    completed_at: Instant,
    duration: Duration,
}

/// Latency distribution over the retained samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,

    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    /// Re-queued because another worker held the entity lock
    pub jobs_requeued_on_lock: u64,
    /// Dropped because the entity was missing or not publishable
    pub jobs_discarded: u64,
    pub jobs_stalled: u64,
    pub ghost_completions: u64,
    pub auth_pauses: u64,

    pub failures_by_category: HashMap<String, u64>,

    pub latency: LatencyStats,
    /// Completions during the last minute
    pub throughput_per_minute: u64,

    pub recovery_runs: u64,
    pub recovery_recovered: u64,
    pub recovery_failures: u64,
    pub recovery_alerts: u64,
    pub lock_cleanup_runs: u64,
    pub locks_released: u64,
}

/// Process-wide metrics sink, shared by reference
#[derive(Debug)]
pub struct MetricsCollector {
    started_at: Instant,

    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_requeued_on_lock: AtomicU64,
    jobs_discarded: AtomicU64,
    jobs_stalled: AtomicU64,
    ghost_completions: AtomicU64,
    auth_pauses: AtomicU64,

    recovery_runs: AtomicU64,
    recovery_recovered: AtomicU64,
    recovery_failures: AtomicU64,
    recovery_alerts: AtomicU64,
    lock_cleanup_runs: AtomicU64,
    locks_released: AtomicU64,

    failures_by_category: Mutex<HashMap<ErrorCategory, u64>>,
    latencies: Mutex<VecDeque<LatencySample>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_requeued_on_lock: AtomicU64::new(0),
            jobs_discarded: AtomicU64::new(0),
            jobs_stalled: AtomicU64::new(0),
            ghost_completions: AtomicU64::new(0),
            auth_pauses: AtomicU64::new(0),
            recovery_runs: AtomicU64::new(0),
            recovery_recovered: AtomicU64::new(0),
            recovery_failures: AtomicU64::new(0),
            recovery_alerts: AtomicU64::new(0),
            lock_cleanup_runs: AtomicU64::new(0),
            locks_released: AtomicU64::new(0),
            failures_by_category: Mutex::new(HashMap::new()),
            latencies: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn record_job_started(&self) {
        Self::bump(&self.jobs_started, 1);
    }

    /// Successful publish, with the attempt's wall time
    pub fn record_job_completed(&self, duration: Duration) {
        Self::bump(&self.jobs_completed, 1);
        let mut latencies = self.latencies.lock();
        if latencies.len() >= MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(LatencySample {
            completed_at: Instant::now(),
            duration,
        });
    }

    /// Any failed attempt, retried or terminal
    pub fn record_failure(&self, category: ErrorCategory) {
        *self.failures_by_category.lock().entry(category).or_insert(0) += 1;
    }

    pub fn record_job_failed(&self) {
        Self::bump(&self.jobs_failed, 1);
    }

    pub fn record_job_retried(&self) {
        Self::bump(&self.jobs_retried, 1);
    }

    pub fn record_lock_requeue(&self) {
        Self::bump(&self.jobs_requeued_on_lock, 1);
    }

    pub fn record_job_discarded(&self) {
        Self::bump(&self.jobs_discarded, 1);
    }

    pub fn record_jobs_stalled(&self, count: u64) {
        Self::bump(&self.jobs_stalled, count);
    }

    pub fn record_ghost_completion(&self) {
        Self::bump(&self.ghost_completions, 1);
    }

    pub fn record_auth_pause(&self) {
        Self::bump(&self.auth_pauses, 1);
    }

    pub fn record_recovery_run(&self, recovered: u64, failures: u64) {
        Self::bump(&self.recovery_runs, 1);
        Self::bump(&self.recovery_recovered, recovered);
        Self::bump(&self.recovery_failures, failures);
    }

    pub fn record_recovery_alert(&self) {
        Self::bump(&self.recovery_alerts, 1);
    }

    pub fn record_lock_cleanup_run(&self, released: u64) {
        Self::bump(&self.lock_cleanup_runs, 1);
        Self::bump(&self.locks_released, released);
    }

    fn latency_stats(samples: &VecDeque<LatencySample>) -> LatencyStats {
        if samples.is_empty() {
            return LatencyStats::default();
        }

        let mut millis: Vec<f64> = samples
            .iter()
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .collect();
        millis.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let percentile = |p: f64| {
            let index = ((millis.len() as f64 * p).ceil() as usize).saturating_sub(1);
            millis[index.min(millis.len() - 1)]
        };

        LatencyStats {
            samples: millis.len(),
            avg_ms: millis.iter().sum::<f64>() / millis.len() as f64,
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
            max_ms: millis[millis.len() - 1],
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let (latency, throughput_per_minute) = {
            let latencies = self.latencies.lock();
            let recent = latencies
                .iter()
                .filter(|s| s.completed_at.elapsed() <= THROUGHPUT_WINDOW)
                .count() as u64;
            (Self::latency_stats(&latencies), recent)
        };

        let failures_by_category = self
            .failures_by_category
            .lock()
            .iter()
            .map(|(category, count)| (category.as_str().to_string(), *count))
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            jobs_started: load(&self.jobs_started),
            jobs_completed: load(&self.jobs_completed),
            jobs_failed: load(&self.jobs_failed),
            jobs_retried: load(&self.jobs_retried),
            jobs_requeued_on_lock: load(&self.jobs_requeued_on_lock),
            jobs_discarded: load(&self.jobs_discarded),
            jobs_stalled: load(&self.jobs_stalled),
            ghost_completions: load(&self.ghost_completions),
            auth_pauses: load(&self.auth_pauses),
            failures_by_category,
            latency,
            throughput_per_minute,
            recovery_runs: load(&self.recovery_runs),
            recovery_recovered: load(&self.recovery_recovered),
            recovery_failures: load(&self.recovery_failures),
            recovery_alerts: load(&self.recovery_alerts),
            lock_cleanup_runs: load(&self.lock_cleanup_runs),
            locks_released: load(&self.locks_released),
        }
    }
}
