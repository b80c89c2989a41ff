//! # Periodic Tasks
//!
//! Runs a [`Sweep`] on a fixed interval until stopped. The ticker is a
//! `tokio::time::interval`, whose first tick completes immediately: every sweep
//! runs once at startup, then every `interval` after that.
//!
//! A failing run is logged and the next tick tries again. Runs never overlap; a tick
//! missed while a run is still going is delayed rather than bursted.

use crate::error::Result;
use crate::logging::{log_error, log_sweep_operation};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What a single sweep run did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Entities examined
    pub scanned: usize,
    /// Entities acted on (recovered, released, ...)
    pub acted: usize,
    /// Per-entity failures that did not abort the run
    pub failures: usize,
    /// Whether the run crossed an alert threshold
    pub alert: bool,
}

/// A unit of periodic reconciliation work
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<SweepReport>;
}

pub struct PeriodicTask {
    sweep: Arc<dyn Sweep>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("sweep", &self.sweep.name())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicTask {
    pub fn new(sweep: Arc<dyn Sweep>, interval: Duration) -> Self {
        Self {
            sweep,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: watch::channel(false).0,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.sweep.name()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(sweep = self.sweep.name(), "Periodic task already running");
            return;
        }

        let sweep = self.sweep.clone();
        let running = self.running.clone();
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.interval.max(Duration::from_millis(1));

        info!(
            sweep = sweep.name(),
            interval_seconds = period.as_secs(),
            "⏱️ Periodic task started, first run is immediate"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        Self::run_sweep(sweep.as_ref()).await;
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }

            debug!(sweep = sweep.name(), "Periodic task loop exited");
        });

        *self.handle.lock() = Some(handle);
    }

    async fn run_sweep(sweep: &dyn Sweep) {
        let started = Instant::now();
        match sweep.run_once().await {
            Ok(report) => log_sweep_operation(
                sweep.name(),
                report.scanned,
                report.acted,
                report.failures,
                started.elapsed().as_millis() as u64,
            ),
            Err(e) => log_error(
                sweep.name(),
                "run_once",
                &e.to_string(),
                Some("retrying next tick"),
            ),
        }
    }

    /// Stop ticking. A run already in progress is allowed to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(sweep = self.sweep.name(), error = %e, "Periodic task panicked");
                }
            }
        }
        info!(sweep = self.sweep.name(), "Periodic task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use std::sync::atomic::AtomicUsize;

    struct CountingSweep {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Sweep for CountingSweep {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self) -> Result<SweepReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PublishError::DatabaseError("down".to_string()));
            }
            Ok(SweepReport::default())
        }
    }

    fn counting(fail: bool) -> Arc<CountingSweep> {
        Arc::new(CountingSweep {
            runs: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_is_immediate() {
        let sweep = counting(false);
        let task = PeriodicTask::new(sweep.clone(), Duration::from_secs(300));

        task.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 2);

        task.stop().await;
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_retries_on_next_tick() {
        let sweep = counting(true);
        let task = PeriodicTask::new(sweep.clone(), Duration::from_secs(60));

        task.start();
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 3);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_runs_after_stop() {
        let sweep = counting(false);
        let task = PeriodicTask::new(sweep.clone(), Duration::from_secs(60));

        task.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.stop().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 1);
    }
}
