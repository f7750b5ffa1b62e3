//! Narrow interfaces to the collaborators outside this core: the text
//! generator, the billing ledger and the progress transport.
//!
//! Checkpoint persistence lives with the checkpoint store, see
//! [`crate::checkpoint::KvBackend`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::admission::FeatureLevel;
use crate::budget::{ContentItem, Selection};
use crate::job::{BatchId, GenerationRequest, JobId};
use crate::progress::ProgressEvent;

/// Money amounts, in US cents.
pub type Cents = u64;

/// Failure reported by a [`Generator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Network failure, timeout, provider overload. Retried with backoff.
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// Invalid input or unsupported request. Never retried.
    #[error("fatal generation failure: {0}")]
    Fatal(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }

    pub fn timed_out(after: Duration) -> Self {
        GenerationError::Transient(format!("attempt timed out after {}ms", after.as_millis()))
    }
}

/// What the generator is asked to supply context for.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub payload: &'a str,
    /// Zero-based stage about to be generated
    pub stage: u32,
    pub total_stages: u32,
    pub features: FeatureLevel,
}

/// Fitted context for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub payload: String,
    pub stage: u32,
    pub total_stages: u32,
    pub features: FeatureLevel,
    pub selection: Selection,
}

/// The external text-generation call.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Candidate context items for a stage. The orchestrator fits them under
    /// the token ceiling together with the tail of the text produced so far.
    async fn gather_context(
        &self,
        _request: &StageRequest<'_>,
    ) -> Result<Vec<ContentItem>, GenerationError> {
        Ok(Vec::new())
    }

    /// Produce the text for one stage.
    async fn generate(&self, context: &GenerationContext) -> Result<String, GenerationError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChargeError {
    #[error("insufficient budget for {user_id}: requested {requested}c, remaining {remaining}c")]
    InsufficientBudget {
        user_id: String,
        requested: Cents,
        remaining: Cents,
    },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Billing collaborator.
#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Pre-computed cost of a request (target length × model pricing).
    async fn estimate_cost(&self, request: &GenerationRequest) -> Cents;

    /// What the user has left this month.
    async fn remaining_budget(&self, user_id: &str) -> Result<Cents, ChargeError>;

    /// Debit the user. Called once per successfully completed job.
    async fn charge(&self, user_id: &str, amount: Cents) -> Result<(), ChargeError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("progress sink error: {0}")]
pub struct SinkError(pub String);

/// Receives progress events. Failures are logged and otherwise ignored.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: &ProgressEvent) -> Result<(), SinkError>;
}
