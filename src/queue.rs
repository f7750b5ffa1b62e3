//! Bounded priority queue of admitted jobs.
//!
//! Jobs leave in priority order (highest first); equal priorities leave in
//! submission order. A dequeued job stays "in flight" until the worker calls
//! [`JobQueue::finish`], so late cancellations can be told apart from
//! unknown ids.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::job::{Job, JobId};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Retryable; the caller may resubmit later.
    #[error("queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("queue is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    #[error("job {0} is not queued")]
    NotFound(JobId),

    /// The job was already handed to a worker; cancel it through the pool.
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    submitted_at: DateTime<Utc>,
    sequence: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ordered: BTreeMap<QueueKey, Job>,
    keys: HashMap<JobId, QueueKey>,
    in_flight: HashSet<JobId>,
    next_sequence: u64,
    closed: bool,
}

impl QueueState {
    fn pop(&mut self) -> Option<Job> {
        let (_, job) = self.ordered.pop_first()?;
        self.keys.remove(&job.id);
        self.in_flight.insert(job.id);
        Some(job)
    }
}

#[derive(Debug)]
pub struct JobQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a job without blocking.
    pub fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.ordered.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            let key = QueueKey {
                priority: Reverse(job.priority),
                submitted_at: job.submitted_at,
                sequence: state.next_sequence,
            };
            state.next_sequence += 1;
            state.keys.insert(job.id, key);
            state.ordered.insert(key, job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next job without blocking.
    pub fn dequeue(&self) -> Option<Job> {
        self.state().pop()
    }

    /// Take the next job, waiting up to `wait` for one to arrive.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed
    /// and drained.
    pub async fn dequeue_timeout(&self, wait: Duration) -> Option<Job> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(job) = state.pop() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.dequeue();
            }
        }
    }

    /// Zero-based position of a queued job.
    pub fn position_of(&self, job_id: JobId) -> Option<usize> {
        let state = self.state();
        let key = state.keys.get(&job_id)?;
        Some(state.ordered.range(..*key).count())
    }

    /// Remove a job that has not started.
    pub fn cancel(&self, job_id: JobId) -> Result<Job, CancelError> {
        let mut state = self.state();
        if let Some(key) = state.keys.remove(&job_id) {
            if let Some(job) = state.ordered.remove(&key) {
                return Ok(job);
            }
        }
        if state.in_flight.contains(&job_id) {
            Err(CancelError::AlreadyRunning(job_id))
        } else {
            Err(CancelError::NotFound(job_id))
        }
    }

    /// Drop the in-flight marker of a job a worker is done with.
    pub fn finish(&self, job_id: JobId) {
        self.state().in_flight.remove(&job_id);
    }

    pub fn is_in_flight(&self, job_id: JobId) -> bool {
        self.state().in_flight.contains(&job_id)
    }

    /// Number of queued (not in-flight) jobs.
    pub fn len(&self) -> usize {
        self.state().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further enqueues and wake every waiting worker.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}
