//! Public entry point tying admission, queue, workers, checkpoints and
//! progress together.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admission::{Admission, AdmissionController, DenialReason, LoadGauge};
use crate::checkpoint::{CheckpointStore, JobRecord};
use crate::config::OrchestratorConfig;
use crate::error::ForgeResult;
use crate::external::{CostLedger, Generator, ProgressSink};
use crate::job::{BatchId, GenerationRequest, JobId, JobStatus};
use crate::progress::{spawn_dispatcher, BatchProgress, BatchTracker};
use crate::queue::{CancelError, JobQueue};
use crate::worker::{JobExecutor, WorkerPool};

const DISPATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to one request of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Accepted(JobId),
    Denied(DenialReason),
    /// Admitted but the queue had no room; retry later
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub batch_id: BatchId,
    /// One entry per request, in request order
    pub outcomes: Vec<SubmissionOutcome>,
}

impl BatchSubmission {
    pub fn accepted(&self) -> Vec<JobId> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                SubmissionOutcome::Accepted(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn denied(&self) -> Vec<DenialReason> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                SubmissionOutcome::Denied(reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still queued and is now cancelled
    Cancelled,
    /// The job is running; it stops at its next cancellation point
    Requested,
}

/// Outcome of replaying persisted job records at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Re-enqueued to continue from their checkpoints
    pub resumed: Vec<JobId>,
    /// Charged before the crash; finalized without charging again
    pub completed: Vec<JobId>,
    /// Out of attempts
    pub failed: Vec<JobId>,
    /// No queue room; left on disk for the next recovery
    pub deferred: Vec<JobId>,
    /// Batches the resumed jobs belong to
    pub batches: Vec<BatchId>,
}

/// External collaborators of an [`Orchestrator`].
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub ledger: Arc<dyn CostLedger>,
    pub sink: Arc<dyn ProgressSink>,
    pub store: Arc<CheckpointStore>,
}

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    queue: Arc<JobQueue>,
    store: Arc<CheckpointStore>,
    admission: Arc<AdmissionController>,
    tracker: Arc<BatchTracker>,
    gauge: Arc<LoadGauge>,
    executor: Arc<JobExecutor>,
    pool: WorkerPool,
    dispatcher: JoinHandle<()>,
}

impl Orchestrator {
    /// Validate `config` and start the worker pool and progress dispatcher on
    /// the current tokio runtime.
    pub fn start(config: OrchestratorConfig, collaborators: Collaborators) -> ForgeResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let Collaborators {
            generator,
            ledger,
            sink,
            store,
        } = collaborators;

        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let gauge = LoadGauge::new(config.queue_capacity + config.max_parallel);
        let (tracker, events) = BatchTracker::new(config.progress_channel_capacity);
        let dispatcher = spawn_dispatcher(events, sink);
        let admission = Arc::new(AdmissionController::new(
            config.clone(),
            ledger,
            gauge.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(
            config.clone(),
            store.clone(),
            generator,
            admission.clone(),
            tracker.clone(),
        ));
        let pool = WorkerPool::spawn(
            config.max_parallel,
            queue.clone(),
            executor.clone(),
            gauge.clone(),
            config.idle_poll(),
        );

        info!(
            max_parallel = config.max_parallel,
            queue_capacity = config.queue_capacity,
            max_retries = config.max_retries,
            "orchestrator started"
        );
        Ok(Self {
            config,
            queue,
            store,
            admission,
            tracker,
            gauge,
            executor,
            pool,
            dispatcher,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Admit and enqueue each request under a fresh batch id.
    pub async fn submit_batch(&self, requests: Vec<GenerationRequest>) -> BatchSubmission {
        let batch_id = BatchId::new();
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let job = match self.admission.admit(request, batch_id).await {
                Admission::Accepted(job) => job,
                Admission::Denied(reason) => {
                    outcomes.push(SubmissionOutcome::Denied(reason));
                    continue;
                }
            };

            let job_id = job.id;
            if let Err(err) = self.store.save_record(&JobRecord::new(job.clone())).await {
                warn!(job_id = %job_id, error = %err, "failed to persist admitted job");
            }
            self.tracker.register(&job);

            match self.queue.enqueue(job) {
                Ok(()) => outcomes.push(SubmissionOutcome::Accepted(job_id)),
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "admitted job not enqueued");
                    self.tracker.forget(job_id);
                    self.admission.release(job_id);
                    if let Err(err) = self.store.clear_record(job_id).await {
                        warn!(job_id = %job_id, error = %err, "failed to clear job record");
                    }
                    outcomes.push(SubmissionOutcome::QueueFull);
                }
            }
        }
        self.gauge.set_queued(self.queue.len());

        let submission = BatchSubmission { batch_id, outcomes };
        info!(
            batch_id = %batch_id,
            requested = submission.outcomes.len(),
            accepted = submission.accepted().len(),
            "batch submitted"
        );
        submission
    }

    /// Cancel a job. Queued jobs are cancelled at once; running jobs are
    /// asked to stop cooperatively.
    pub async fn cancel(&self, job_id: JobId) -> ForgeResult<CancelOutcome> {
        match self.queue.cancel(job_id) {
            Ok(job) => {
                self.gauge.set_queued(self.queue.len());
                self.executor.finalize(job, JobStatus::Cancelled).await;
                Ok(CancelOutcome::Cancelled)
            }
            Err(CancelError::AlreadyRunning(_)) => {
                self.pool.cancel(job_id);
                Ok(CancelOutcome::Requested)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn batch_progress(&self, batch_id: BatchId) -> Option<BatchProgress> {
        self.tracker.batch_progress(batch_id)
    }

    /// Wait until every job of the batch is terminal.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> Option<BatchProgress> {
        self.tracker.wait_for_batch(batch_id).await
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.tracker.job_status(job_id)
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Zero-based queue position of a job that has not started.
    pub fn position_of(&self, job_id: JobId) -> Option<usize> {
        self.queue.position_of(job_id)
    }

    /// Final text of a completed job.
    pub async fn result(&self, job_id: JobId) -> ForgeResult<Option<String>> {
        Ok(self.store.get_result(job_id).await?)
    }

    /// Rebuild work from persisted job records.
    ///
    /// Jobs already charged are completed without a second charge, jobs out
    /// of attempts fail, and the rest go back on the queue at their original
    /// priority to resume from their last readable checkpoint.
    pub async fn recover(&self) -> ForgeResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.store.load_records().await? {
            let mut job = record.job;
            let job_id = job.id;

            if job.status.is_terminal() {
                self.store.clear_record(job_id).await?;
                continue;
            }

            if record.charge_issued {
                job.status = JobStatus::Running;
                self.tracker.register(&job);
                self.executor.finalize(job, JobStatus::Completed).await;
                report.completed.push(job_id);
                continue;
            }

            // Stored output only needs its charge settled.
            if job.attempts >= self.config.max_retries && job.result_ref.is_none() {
                job.status = JobStatus::Running;
                if job.last_error.is_none() {
                    job.last_error = Some("attempts exhausted before restart".to_string());
                }
                self.tracker.register(&job);
                self.executor.finalize(job, JobStatus::Failed).await;
                report.failed.push(job_id);
                continue;
            }

            job.status = JobStatus::Pending;
            self.admission.reserve(&job);
            self.tracker.register(&job);
            let batch_id = job.batch_id;
            match self.queue.enqueue(job) {
                Ok(()) => {
                    report.resumed.push(job_id);
                    if !report.batches.contains(&batch_id) {
                        report.batches.push(batch_id);
                    }
                }
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "recovered job deferred");
                    self.tracker.forget(job_id);
                    self.admission.release(job_id);
                    report.deferred.push(job_id);
                }
            }
        }
        self.gauge.set_queued(self.queue.len());

        info!(
            resumed = report.resumed.len(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Stop accepting work, let workers finish their current call and wait
    /// for queued progress events to drain. Unfinished jobs keep their
    /// records for the next [`Orchestrator::recover`].
    pub async fn shutdown(self) {
        let Self {
            queue,
            tracker,
            executor,
            admission,
            pool,
            dispatcher,
            ..
        } = self;

        queue.close();
        pool.shutdown().await;
        drop(executor);
        drop(admission);
        drop(tracker);

        if tokio::time::timeout(DISPATCHER_DRAIN_TIMEOUT, dispatcher)
            .await
            .is_err()
        {
            warn!("progress dispatcher did not drain in time");
        }
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;
    use crate::job::ClientIdentity;
    use crate::sim::{InMemoryLedger, RecordingSink, SimulatedGenerator};

    fn orchestrator(config: OrchestratorConfig, generator: SimulatedGenerator) -> Orchestrator {
        Orchestrator::start(
            config,
            Collaborators {
                generator: Arc::new(generator),
                ledger: Arc::new(InMemoryLedger::new().with_default_budget(1_000)),
                sink: Arc::new(RecordingSink::new()),
                store: Arc::new(CheckpointStore::in_memory()),
            },
        )
        .unwrap()
    }

    fn request(priority: i32) -> GenerationRequest {
        GenerationRequest::new(ClientIdentity::new("c", "u", "pro"), "brief")
            .with_priority(priority)
            .with_target_words(500)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = OrchestratorConfig::default().with_max_parallel(0);
        let result = Orchestrator::start(
            config,
            Collaborators {
                generator: Arc::new(SimulatedGenerator::new()),
                ledger: Arc::new(InMemoryLedger::new()),
                sink: Arc::new(RecordingSink::new()),
                store: Arc::new(CheckpointStore::in_memory()),
            },
        );
        assert!(matches!(result, Err(ForgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_queue_full_is_distinct_from_denial() {
        let config = OrchestratorConfig::default()
            .with_max_parallel(1)
            .with_queue_capacity(1);
        let orchestrator = orchestrator(
            config,
            SimulatedGenerator::new().with_latency(Duration::from_millis(200)),
        );
        let submission = orchestrator
            .submit_batch(vec![request(0), request(0), request(0), request(0)])
            .await;
        assert!(submission.outcomes.contains(&SubmissionOutcome::QueueFull));
        assert!(submission.denied().is_empty());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let config = OrchestratorConfig::default().with_max_parallel(1);
        let orchestrator = orchestrator(
            config,
            SimulatedGenerator::new().with_latency(Duration::from_millis(100)),
        );
        let submission = orchestrator.submit_batch(vec![request(5), request(0)]).await;
        let queued = submission.accepted()[1];

        assert_eq!(orchestrator.cancel(queued).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(orchestrator.job_status(queued), Some(JobStatus::Cancelled));
        assert!(matches!(
            orchestrator.cancel(JobId::new()).await,
            Err(ForgeError::Cancel(CancelError::NotFound(_)))
        ));

        let progress = orchestrator.wait_for_batch(submission.batch_id).await.unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.cancelled, 1);
        orchestrator.shutdown().await;
    }

    #[test]
    fn test_submission_outcome_wire_format() {
        let denied = SubmissionOutcome::Denied(DenialReason::BudgetExceeded);
        let json = serde_json::to_string(&denied).unwrap();
        assert_eq!(json, r#"{"denied":"BUDGET_EXCEEDED"}"#);
        let json = serde_json::to_string(&SubmissionOutcome::QueueFull).unwrap();
        assert_eq!(json, r#""queue_full""#);
    }
}
