//! Runs one job from dequeue to terminal status.
//!
//! Attempts resume from the last checkpoint, so a transient failure in
//! stage k only costs stage k. The ledger is charged exactly once per
//! completed job: `charge_issued` is persisted before each charge call and
//! reset when the ledger reports the charge did not land, which lets
//! recovery tell a job that may already have been billed from one that was
//! not. A job whose charge cannot be settled is left running for recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use crate::admission::AdmissionController;
use crate::budget::{ContentItem, ContextOptimizer, TokenBudget};
use crate::checkpoint::{CheckpointStore, Increment, JobRecord, ResumePlan};
use crate::config::OrchestratorConfig;
use crate::external::{
    ChargeError, GenerationContext, GenerationError, Generator, StageRequest,
};
use crate::job::{Job, JobStatus};
use crate::progress::BatchTracker;

/// Characters of earlier output offered to the next stage.
const CARRY_OVER_CHARS: usize = 4000;
const CARRY_OVER_ID: &str = "previous-stages";
const CARRY_OVER_WEIGHT: f64 = 100.0;

/// How a job run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// Shutdown arrived mid-run; the job record is kept for recovery
    Abandoned,
    /// Output is stored but the ledger never took the charge; the record is
    /// kept so recovery settles it
    ChargePending,
}

enum Attempt {
    Finished(String),
    Cancelled,
}

/// Shared collaborators of every worker.
pub struct JobExecutor {
    config: Arc<OrchestratorConfig>,
    policy: RetryPolicy,
    optimizer: ContextOptimizer,
    store: Arc<CheckpointStore>,
    generator: Arc<dyn Generator>,
    admission: Arc<AdmissionController>,
    tracker: Arc<BatchTracker>,
}

impl JobExecutor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<CheckpointStore>,
        generator: Arc<dyn Generator>,
        admission: Arc<AdmissionController>,
        tracker: Arc<BatchTracker>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config),
            optimizer: ContextOptimizer::default(),
            config,
            store,
            generator,
            admission,
            tracker,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn persist(&self, job: &Job, charge_issued: bool) -> bool {
        let mut record = JobRecord::new(job.clone());
        record.charge_issued = charge_issued;
        match self.store.save_record(&record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to persist job record");
                false
            }
        }
    }

    /// Drive `job` to a terminal status, or abandon it on shutdown.
    pub async fn execute(
        &self,
        mut job: Job,
        mut cancel: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunOutcome {
        if let Err(err) = job.transition(JobStatus::Running) {
            error!(job_id = %job.id, error = %err, "dequeued job cannot start");
            return self.reject(job, err.to_string()).await;
        }
        self.persist(&job, false).await;
        self.tracker.observe(&job);
        info!(job_id = %job.id, batch_id = %job.batch_id, attempts = job.attempts, "job started");

        if job.result_ref.is_some() {
            info!(job_id = %job.id, "output already stored; settling charge");
            return self.complete(job, &mut shutdown).await;
        }

        loop {
            if *cancel.borrow() {
                return self.finalize(job, JobStatus::Cancelled).await;
            }
            if !self.policy.allows(job.attempts) {
                return self.finalize(job, JobStatus::Failed).await;
            }

            job.attempts += 1;
            self.persist(&job, false).await;
            debug!(job_id = %job.id, attempt = job.attempts, "attempt started");

            let result = match self.attempt(&mut job, &cancel).await {
                Ok(Attempt::Cancelled) => return self.finalize(job, JobStatus::Cancelled).await,
                Ok(Attempt::Finished(text)) => self.commit(&mut job, &text).await,
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(()) => return self.complete(job, &mut shutdown).await,
                Err(err) => err,
            };
            job.last_error = Some(err.to_string());

            if !err.is_retryable() {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    error = %err,
                    "fatal generation error"
                );
                return self.finalize(job, JobStatus::Failed).await;
            }
            if !self.policy.allows(job.attempts) {
                warn!(job_id = %job.id, attempts = job.attempts, error = %err, "retries exhausted");
                return self.finalize(job, JobStatus::Failed).await;
            }

            let delay = self.policy.backoff(job.attempts);
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, backing off"
            );
            self.persist(&job, false).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_flag(&mut cancel) => {}
                _ = wait_for_flag(&mut shutdown) => {
                    info!(job_id = %job.id, "shutdown during backoff; job left for recovery");
                    return RunOutcome::Abandoned;
                }
            }
        }
    }

    /// Run the remaining stages of `job` once.
    async fn attempt(
        &self,
        job: &mut Job,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Attempt, GenerationError> {
        let checkpoint = match self.store.load(job.id).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "checkpoint unavailable, starting over");
                None
            }
        };
        let mut plan = ResumePlan::from_checkpoint(checkpoint.as_ref(), job.stages);
        if plan.next_stage > 0 {
            info!(job_id = %job.id, stage = plan.next_stage, "resuming from checkpoint");
        }
        job.set_stage_progress(plan.next_stage);

        let ceiling = job.features.scale_ceiling(self.config.token_budget_max);
        let timeout = self.config.attempt_timeout();

        while !plan.is_complete() {
            let request = StageRequest {
                job_id: job.id,
                batch_id: job.batch_id,
                payload: &job.payload,
                stage: plan.next_stage,
                total_stages: plan.total_stages,
                features: job.features,
            };
            let mut items = self.generator.gather_context(&request).await?;
            let tail = plan.tail(CARRY_OVER_CHARS);
            if !tail.is_empty() {
                items.push(
                    ContentItem::new(
                        CARRY_OVER_ID,
                        tail,
                        CARRY_OVER_WEIGHT,
                        self.optimizer.estimator(),
                    )
                    .summarizable(true),
                );
            }
            let selection = self
                .optimizer
                .optimize(items, TokenBudget::new(ceiling))
                .map_err(|e| GenerationError::Fatal(e.to_string()))?;
            let context_tokens = selection.used;

            let context = GenerationContext {
                job_id: job.id,
                batch_id: job.batch_id,
                payload: job.payload.clone(),
                stage: plan.next_stage,
                total_stages: plan.total_stages,
                features: job.features,
                selection,
            };
            let text = generate_with_timeout(self.generator.as_ref(), &context, timeout).await?;

            if *cancel.borrow() {
                return Ok(Attempt::Cancelled);
            }

            let tokens = context_tokens + self.optimizer.estimator().estimate(&text);
            plan = plan.advance(Increment { text, tokens });
            if let Err(err) = self
                .store
                .save(job.id, plan.next_stage, &plan.partial_output, plan.tokens_used)
                .await
            {
                warn!(
                    job_id = %job.id,
                    stage = plan.next_stage,
                    error = %err,
                    "checkpoint write failed"
                );
            }
            job.set_stage_progress(plan.next_stage);
            self.tracker.observe(job);
        }

        Ok(Attempt::Finished(plan.partial_output))
    }

    /// Persist the result. A failure here is retried.
    async fn commit(&self, job: &mut Job, text: &str) -> Result<(), GenerationError> {
        let reference = self
            .store
            .put_result(job.id, text)
            .await
            .map_err(|e| GenerationError::Transient(format!("result not stored: {e}")))?;
        job.result_ref = Some(reference);
        Ok(())
    }

    /// Charge the job once and mark it completed.
    ///
    /// Each charge call is preceded by persisting `charge_issued`. When the
    /// ledger answers `Unavailable` the marker is reset and the charge is
    /// retried on the backoff schedule. `InsufficientBudget` is logged and
    /// the job still completes.
    async fn complete(&self, job: Job, shutdown: &mut watch::Receiver<bool>) -> RunOutcome {
        let mut round = 0;
        loop {
            round += 1;
            let failure = if !self.persist(&job, true).await {
                "charge marker not stored".to_string()
            } else {
                match self.admission.settle(&job).await {
                    Ok(()) => {
                        debug!(job_id = %job.id, amount = job.estimated_cost, "charged");
                        break;
                    }
                    Err(ChargeError::InsufficientBudget { remaining, .. }) => {
                        warn!(
                            job_id = %job.id,
                            user_id = %job.client.user_id,
                            amount = job.estimated_cost,
                            remaining,
                            "charge refused after completion"
                        );
                        break;
                    }
                    Err(err) => {
                        self.persist(&job, false).await;
                        err.to_string()
                    }
                }
            };

            if !self.policy.allows(round) {
                error!(
                    job_id = %job.id,
                    rounds = round,
                    error = %failure,
                    "charge not settled; job left for recovery"
                );
                return RunOutcome::ChargePending;
            }
            let delay = self.policy.backoff(round);
            warn!(
                job_id = %job.id,
                round,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "charge failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_flag(shutdown) => {
                    info!(
                        job_id = %job.id,
                        "shutdown while settling charge; job left for recovery"
                    );
                    return RunOutcome::Abandoned;
                }
            }
        }
        self.finalize(job, JobStatus::Completed).await
    }

    /// Fail a job that cannot run at all.
    async fn reject(&self, mut job: Job, reason: String) -> RunOutcome {
        job.last_error = Some(reason.clone());
        job.status = JobStatus::Failed;
        if let Err(err) = self.store.clear(job.id).await {
            warn!(job_id = %job.id, error = %err, "failed to clear checkpoint");
        }
        if let Err(err) = self.store.clear_record(job.id).await {
            warn!(job_id = %job.id, error = %err, "failed to clear job record");
        }
        self.admission.release(job.id);
        self.tracker.observe(&job);
        RunOutcome::Failed(reason)
    }

    /// Clear persisted state, release the reservation and report the status.
    pub(crate) async fn finalize(&self, mut job: Job, status: JobStatus) -> RunOutcome {
        if let Err(err) = self.store.clear(job.id).await {
            warn!(job_id = %job.id, error = %err, "failed to clear checkpoint");
        }
        if let Err(err) = self.store.clear_record(job.id).await {
            warn!(job_id = %job.id, error = %err, "failed to clear job record");
        }
        if let Err(err) = job.transition(status) {
            error!(job_id = %job.id, error = %err, "invalid terminal transition");
        }
        self.admission.release(job.id);
        self.tracker.observe(&job);

        match status {
            JobStatus::Completed => {
                info!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    result = ?job.result_ref,
                    "job completed"
                );
                RunOutcome::Completed
            }
            JobStatus::Cancelled => {
                info!(job_id = %job.id, "job cancelled");
                RunOutcome::Cancelled
            }
            _ => {
                let reason = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "no attempts left".to_string());
                warn!(job_id = %job.id, attempts = job.attempts, error = %reason, "job failed");
                RunOutcome::Failed(reason)
            }
        }
    }
}

async fn generate_with_timeout(
    generator: &dyn Generator,
    context: &GenerationContext,
    timeout: Duration,
) -> Result<String, GenerationError> {
    match tokio::time::timeout(timeout, generator.generate(context)).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::timed_out(timeout)),
    }
}

/// Resolves once the flag is set. Pends forever if the sender is gone.
async fn wait_for_flag(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}
