//! # Publish Worker Pool
//!
//! Fixed set of tokio tasks that claim due jobs and hand them to the
//! [`PublishWorker`], which spaces out provider calls. A background loop returns
//! stalled jobs to the queue.
//!
//! Shutdown pauses the loops, waits up to the grace period for in-flight attempts
//! and then aborts whatever is still running. Anything aborted mid-attempt leaves a
//! lock and an active job behind; the sweeps and the stall check reclaim both.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::orchestration::publish_worker::{JobOutcome, PublishWorker};
use crate::queue::JobQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Back-off after a dequeue error before polling again
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct PublishWorkerPool {
    worker: Arc<PublishWorker>,
    queue: JobQueue,
    metrics: Arc<MetricsCollector>,
    config: QueueConfig,
    running: Arc<AtomicBool>,
    active_jobs: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PublishWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishWorkerPool")
            .field("concurrency", &self.config.concurrency)
            .field("running", &self.is_running())
            .field("active_jobs", &self.active_jobs())
            .finish_non_exhaustive()
    }
}

impl PublishWorkerPool {
    pub fn new(
        worker: Arc<PublishWorker>,
        queue: JobQueue,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let config = queue.config().clone();

        Self {
            worker,
            queue,
            metrics,
            config,
            running: Arc::new(AtomicBool::new(false)),
            active_jobs: Arc::new(AtomicUsize::new(0)),
            shutdown: watch::channel(false).0,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Attempts currently between claim and settlement
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Spawn the worker loops and the stall check
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Publish worker pool already running");
            return;
        }

        info!(
            concurrency = self.config.concurrency,
            "🚀 WORKER POOL: Starting publish workers"
        );

        self.shutdown.send_replace(false);
        let mut handles = self.handles.lock();
        for worker_index in 0..self.config.concurrency {
            handles.push(self.spawn_worker_loop(worker_index));
        }
        handles.push(self.spawn_stall_check());
    }

    fn spawn_worker_loop(&self, worker_index: usize) -> JoinHandle<()> {
        let worker = self.worker.clone();
        let queue = self.queue.clone();
        let running = self.running.clone();
        let active_jobs = self.active_jobs.clone();
        let mut shutdown = self.shutdown.subscribe();
        let poll_interval = self.config.poll_interval();

        tokio::spawn(async move {
            debug!(worker_index, "Publish worker loop started");

            while running.load(Ordering::SeqCst) {
                let idle = match queue.dequeue().await {
                    Ok(Some(job)) => {
                        active_jobs.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = worker.process(&job).await {
                            error!(job_id = %job.id, error = %e, "Failed to settle publish job");
                        }
                        active_jobs.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    Ok(None) => poll_interval,
                    Err(e) => {
                        error!(worker_index, error = %e, "Failed to dequeue publish job");
                        DEQUEUE_ERROR_BACKOFF
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => {}
                }
            }

            debug!(worker_index, "Publish worker loop stopped");
        })
    }

    fn spawn_stall_check(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let running = self.running.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.stall_check_interval();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match queue.recover_stalled().await {
                            Ok(0) => {}
                            Ok(stalled) => {
                                metrics.record_jobs_stalled(stalled);
                                warn!(stalled, "⏰ Stalled publish jobs returned to the queue");
                            }
                            Err(e) => error!(error = %e, "Stall check failed"),
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            }
        })
    }

    /// Claim and process one due job, if any, on the caller's task
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        match self.queue.dequeue().await? {
            Some(job) => {
                self.active_jobs.fetch_add(1, Ordering::SeqCst);
                let outcome = self.worker.process(&job).await;
                self.active_jobs.fetch_sub(1, Ordering::SeqCst);
                outcome.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Pause the loops, wait for in-flight attempts, then abort stragglers
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let mut handles = std::mem::take(&mut *self.handles.lock());
        let grace = self.config.shutdown_grace();
        info!(
            active_jobs = self.active_jobs(),
            grace_seconds = grace.as_secs(),
            "🛑 WORKER POOL: Shutting down"
        );

        let drained = tokio::time::timeout(
            grace,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;

        if drained.is_err() {
            warn!(
                active_jobs = self.active_jobs(),
                "Shutdown grace elapsed, aborting publish workers"
            );
            for handle in &handles {
                handle.abort();
            }
            self.active_jobs.store(0, Ordering::SeqCst);
        }

        info!("✅ WORKER POOL: Stopped");
    }
}
