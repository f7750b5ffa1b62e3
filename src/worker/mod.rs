//! Fixed-size worker pool.
//!
//! `max_parallel` tasks pull from the shared [`JobQueue`] and hand each job
//! to the [`JobExecutor`]. A worker runs one job at a time, so the number of
//! running jobs never exceeds the pool size.

pub mod executor;
pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::LoadGauge;
use crate::job::JobId;
use crate::queue::JobQueue;

pub use executor::{JobExecutor, RunOutcome};
pub use retry::RetryPolicy;

/// Per-job cooperative cancellation flags.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    flags: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl CancelRegistry {
    fn flags(&self) -> MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
        match self.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Subscribe to the flag of `job_id`, keeping a cancel that arrived first.
    fn register(&self, job_id: JobId) -> watch::Receiver<bool> {
        self.flags()
            .entry(job_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn remove(&self, job_id: JobId) {
        self.flags().remove(&job_id);
    }

    fn len(&self) -> usize {
        self.flags().len()
    }

    /// Raise the flag of `job_id`.
    pub fn cancel(&self, job_id: JobId) {
        self.flags()
            .entry(job_id)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    cancels: Arc<CancelRegistry>,
}

impl WorkerPool {
    /// Spawn `size` workers on the current runtime.
    pub fn spawn(
        size: usize,
        queue: Arc<JobQueue>,
        executor: Arc<JobExecutor>,
        gauge: Arc<LoadGauge>,
        idle_poll: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let cancels = Arc::new(CancelRegistry::default());

        let handles = (0..size.max(1))
            .map(|worker| {
                let worker_loop = WorkerLoop {
                    worker,
                    queue: queue.clone(),
                    executor: executor.clone(),
                    gauge: gauge.clone(),
                    cancels: cancels.clone(),
                    idle_poll,
                };
                tokio::spawn(worker_loop.run(shutdown.subscribe()))
            })
            .collect();

        info!(workers = size.max(1), "worker pool started");
        Self {
            handles,
            shutdown,
            cancels,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Ask a running job to stop at its next cancellation point.
    pub fn cancel(&self, job_id: JobId) {
        self.cancels.cancel(job_id);
    }

    /// Signal every worker and wait for them to exit. Jobs mid-generation
    /// finish their current call first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(err) = result {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

struct WorkerLoop {
    worker: usize,
    queue: Arc<JobQueue>,
    executor: Arc<JobExecutor>,
    gauge: Arc<LoadGauge>,
    cancels: Arc<CancelRegistry>,
    idle_poll: Duration,
}

impl WorkerLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.worker, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let job = tokio::select! {
                job = self.queue.dequeue_timeout(self.idle_poll) => job,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Some(job) = job else {
                continue;
            };

            let job_id = job.id;
            self.gauge.set_queued(self.queue.len());
            let running = self.gauge.running_started();
            debug!(worker = self.worker, job_id = %job_id, running, "job picked up");

            let cancel = self.cancels.register(job_id);
            let outcome = self.executor.execute(job, cancel, shutdown.clone()).await;
            debug!(worker = self.worker, job_id = %job_id, outcome = ?outcome, "job released");

            // Once finished, queue cancels answer NotFound and never reach
            // the registry, so the entry can go.
            self.queue.finish(job_id);
            self.cancels.remove(job_id);
            self.gauge.running_finished();
        }
        debug!(worker = self.worker, "worker stopped");
    }
}
