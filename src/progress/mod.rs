//! Batch progress tracking.
//!
//! The worker pool reports every job transition and stage update here. The
//! tracker keeps per-batch counts, estimates time to completion and pushes a
//! [`ProgressEvent`] onto a bounded channel that a dispatcher task drains
//! into the configured [`ProgressSink`]. A slow or failing sink never stalls
//! the workers: overflowing events are dropped with a log line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::external::ProgressSink;
use crate::job::{BatchId, Job, JobId, JobStatus};

/// One observable change in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub status: JobStatus,
    /// Fraction of the job's stages finished
    pub progress: f64,
}

/// Snapshot of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    /// Jobs in the order they joined the batch
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `completed / total`
    pub fraction: f64,
    /// Mean completed-job duration times jobs still open; unknown until a
    /// job has completed
    #[serde(default, with = "eta_millis", rename = "eta_ms")]
    pub eta: Option<Duration>,
}

impl BatchProgress {
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

mod eta_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(eta: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match eta {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    started_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct BatchState {
    jobs: HashMap<JobId, JobEntry>,
    order: Vec<JobId>,
    completed_durations: Vec<Duration>,
}

impl BatchState {
    fn snapshot(&self, batch_id: BatchId) -> BatchProgress {
        let mut progress = BatchProgress {
            batch_id,
            job_ids: self.order.clone(),
            total: self.jobs.len(),
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            fraction: 0.0,
            eta: None,
        };
        for entry in self.jobs.values() {
            match entry.status {
                JobStatus::Pending => progress.pending += 1,
                JobStatus::Running => progress.running += 1,
                JobStatus::Completed => progress.completed += 1,
                JobStatus::Failed => progress.failed += 1,
                JobStatus::Cancelled => progress.cancelled += 1,
            }
        }
        if progress.total > 0 {
            progress.fraction = progress.completed as f64 / progress.total as f64;
        }
        if !self.completed_durations.is_empty() {
            let mean = self.completed_durations.iter().sum::<Duration>()
                / self.completed_durations.len() as u32;
            progress.eta = Some(mean * (progress.pending + progress.running) as u32);
        }
        progress
    }
}

pub struct BatchTracker {
    batches: Mutex<HashMap<BatchId, BatchState>>,
    events: mpsc::Sender<ProgressEvent>,
    version: watch::Sender<u64>,
}

impl BatchTracker {
    /// Create a tracker and the receiving end of its event channel.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ProgressEvent>) {
        let (events, receiver) = mpsc::channel(capacity.max(1));
        let (version, _) = watch::channel(0);
        let tracker = Arc::new(Self {
            batches: Mutex::new(HashMap::new()),
            events,
            version,
        });
        (tracker, receiver)
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<BatchId, BatchState>> {
        match self.batches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, job: &Job) {
        let event = ProgressEvent {
            batch_id: job.batch_id,
            job_id: job.id,
            status: job.status,
            progress: job.progress,
        };
        if let Err(err) = self.events.try_send(event) {
            warn!(job_id = %job.id, error = %err, "progress event dropped");
        }
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Start tracking an admitted job.
    pub fn register(&self, job: &Job) {
        {
            let mut batches = self.batches();
            let batch = batches.entry(job.batch_id).or_default();
            if !batch.jobs.contains_key(&job.id) {
                batch.order.push(job.id);
            }
            batch.jobs.insert(
                job.id,
                JobEntry {
                    status: job.status,
                    started_at: (job.status == JobStatus::Running).then(Instant::now),
                },
            );
        }
        self.publish(job);
    }

    /// Record the job's current status.
    pub fn observe(&self, job: &Job) {
        {
            let mut batches = self.batches();
            let batch = batches.entry(job.batch_id).or_default();
            if !batch.jobs.contains_key(&job.id) {
                batch.order.push(job.id);
            }
            let entry = batch.jobs.entry(job.id).or_insert(JobEntry {
                status: job.status,
                started_at: None,
            });
            if job.status == JobStatus::Running && entry.started_at.is_none() {
                entry.started_at = Some(Instant::now());
            }
            let finished_now =
                job.status == JobStatus::Completed && entry.status != JobStatus::Completed;
            entry.status = job.status;
            if finished_now {
                if let Some(started) = entry.started_at {
                    batch.completed_durations.push(started.elapsed());
                }
            }
        }
        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "job progress");
        self.publish(job);
    }

    /// Stop tracking a job that never made it onto the queue.
    pub fn forget(&self, job_id: JobId) {
        let mut batches = self.batches();
        batches.retain(|_, batch| {
            if batch.jobs.remove(&job_id).is_some() {
                batch.order.retain(|id| *id != job_id);
            }
            !batch.jobs.is_empty()
        });
        drop(batches);
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn batch_progress(&self, batch_id: BatchId) -> Option<BatchProgress> {
        self.batches().get(&batch_id).map(|b| b.snapshot(batch_id))
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches().keys().copied().collect()
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.batches()
            .values()
            .find_map(|b| b.jobs.get(&job_id).map(|e| e.status))
    }

    /// Resolve once every job of `batch_id` is terminal. `None` for an
    /// unknown batch.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> Option<BatchProgress> {
        let mut version = self.version.subscribe();
        loop {
            let progress = self.batch_progress(batch_id)?;
            if progress.is_finished() {
                return Some(progress);
            }
            if version.changed().await.is_err() {
                return self.batch_progress(batch_id);
            }
        }
    }
}

/// Forward events to `sink` until every sender is gone.
pub fn spawn_dispatcher(
    mut receiver: mpsc::Receiver<ProgressEvent>,
    sink: Arc<dyn ProgressSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(err) = sink.emit(&event).await {
                warn!(job_id = %event.job_id, error = %err, "progress sink failed");
            }
        }
        debug!("progress dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::FeatureLevel;
    use crate::job::{ClientIdentity, GenerationRequest};
    use crate::sim::RecordingSink;

    fn job(batch_id: BatchId) -> Job {
        let request =
            GenerationRequest::new(ClientIdentity::new("c", "u", "free"), "p").with_stages(2);
        Job::from_request(request, batch_id, 1, FeatureLevel::Full)
    }

    #[test]
    fn test_counts_and_fraction() {
        let (tracker, _rx) = BatchTracker::new(64);
        let batch = BatchId::new();
        let mut jobs: Vec<Job> = (0..4).map(|_| job(batch)).collect();
        for j in &jobs {
            tracker.register(j);
        }

        jobs[0].transition(JobStatus::Running).unwrap();
        tracker.observe(&jobs[0]);
        jobs[0].transition(JobStatus::Completed).unwrap();
        tracker.observe(&jobs[0]);
        jobs[1].transition(JobStatus::Running).unwrap();
        tracker.observe(&jobs[1]);
        jobs[2].transition(JobStatus::Cancelled).unwrap();
        tracker.observe(&jobs[2]);

        let progress = tracker.batch_progress(batch).unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.running, 1);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.cancelled, 1);
        assert_eq!(progress.fraction, 0.25);
        assert!(progress.eta.is_some());
        assert!(!progress.is_finished());
    }

    #[test]
    fn test_job_ids_keep_batch_order() {
        let (tracker, _rx) = BatchTracker::new(64);
        let batch = BatchId::new();
        let jobs: Vec<Job> = (0..3).map(|_| job(batch)).collect();
        for j in &jobs {
            tracker.register(j);
        }
        tracker.register(&jobs[0]);
        tracker.forget(jobs[1].id);

        let progress = tracker.batch_progress(batch).unwrap();
        assert_eq!(progress.job_ids, vec![jobs[0].id, jobs[2].id]);
        assert_eq!(progress.total, 2);
    }

    #[test]
    fn test_eta_unknown_before_first_completion() {
        let (tracker, _rx) = BatchTracker::new(8);
        let batch = BatchId::new();
        tracker.register(&job(batch));
        assert_eq!(tracker.batch_progress(batch).unwrap().eta, None);
        assert!(tracker.batch_progress(BatchId::new()).is_none());
    }

    #[test]
    fn test_full_channel_drops_events() {
        let (tracker, mut rx) = BatchTracker::new(1);
        let batch = BatchId::new();
        tracker.register(&job(batch));
        tracker.register(&job(batch));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.batch_progress(batch).unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_wait_for_batch_resolves_on_last_terminal() {
        let (tracker, _rx) = BatchTracker::new(64);
        let batch = BatchId::new();
        let mut j = job(batch);
        tracker.register(&j);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_batch(batch).await })
        };
        tokio::task::yield_now().await;
        j.transition(JobStatus::Running).unwrap();
        tracker.observe(&j);
        j.transition(JobStatus::Failed).unwrap();
        tracker.observe(&j);

        let progress = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(progress.failed, 1);
        assert!(progress.is_finished());
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_to_sink() {
        let (tracker, rx) = BatchTracker::new(16);
        let sink = Arc::new(RecordingSink::new());
        let handle = spawn_dispatcher(rx, sink.clone());
        let batch = BatchId::new();
        let j = job(batch);
        tracker.register(&j);
        drop(tracker);
        handle.await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, j.id);
        assert_eq!(events[0].status, JobStatus::Pending);
    }
}
