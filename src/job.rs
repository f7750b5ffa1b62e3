//! Jobs, batches and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::admission::FeatureLevel;
use crate::external::Cents;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier shared by all jobs submitted in one `submit_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who is asking: the API client (rate limits) and the paying user (budget).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub client_id: String,
    pub user_id: String,
    pub tier: String,
}

impl ClientIdentity {
    pub fn new(
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
            tier: tier.into(),
        }
    }
}

/// A request to generate one unit of manuscript (typically a chapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub client: ClientIdentity,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Opaque pointer to the outline/brief this job expands
    pub payload: String,
    /// Number of checkpointed increments (e.g. chapter sections)
    #[serde(default = "default_stages")]
    pub stages: u32,
    /// Target length, used for cost estimation
    #[serde(default)]
    pub target_words: u64,
}

fn default_stages() -> u32 {
    1
}

impl GenerationRequest {
    pub fn new(client: ClientIdentity, payload: impl Into<String>) -> Self {
        Self {
            client,
            priority: 0,
            payload: payload.into(),
            stages: 1,
            target_words: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of increments; clamped to at least one.
    pub fn with_stages(mut self, stages: u32) -> Self {
        self.stages = stages.max(1);
        self
    }

    pub fn with_target_words(mut self, words: u64) -> Self {
        self.target_words = words;
        self
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Validate a move to `to`. Status only moves forward; a queued job may
    /// be cancelled without ever running.
    pub fn transition(self, to: JobStatus) -> Result<JobStatus, TransitionError> {
        let allowed = matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        );
        if allowed {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: BatchId,
    pub client: ClientIdentity,
    pub priority: i32,
    pub payload: String,
    pub stages: u32,
    pub target_words: u64,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Fraction of stages finished, in [0, 1]
    pub progress: f64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub estimated_cost: Cents,
    pub features: FeatureLevel,
}

impl Job {
    pub fn from_request(
        request: GenerationRequest,
        batch_id: BatchId,
        estimated_cost: Cents,
        features: FeatureLevel,
    ) -> Self {
        Self {
            id: JobId::new(),
            batch_id,
            client: request.client,
            priority: request.priority,
            payload: request.payload,
            stages: request.stages.max(1),
            target_words: request.target_words,
            submitted_at: Utc::now(),
            status: JobStatus::Pending,
            progress: 0.0,
            attempts: 0,
            last_error: None,
            result_ref: None,
            estimated_cost,
            features,
        }
    }

    /// Apply a validated status transition.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(to)?;
        if to == JobStatus::Completed {
            self.progress = 1.0;
        }
        Ok(())
    }

    /// Record that `completed_stages` increments are done.
    pub fn set_stage_progress(&mut self, completed_stages: u32) {
        let stages = self.stages.max(1);
        self.progress = (completed_stages.min(stages) as f64 / stages as f64).clamp(0.0, 1.0);
    }
}
