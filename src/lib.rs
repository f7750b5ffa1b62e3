//! Admission control, scheduling and checkpointed execution for long-form
//! manuscript generation.
//!
//! Requests pass the [`admission`] checks, wait in the bounded priority
//! [`queue`] and run on a fixed [`worker`] pool. Each finished stage is
//! written to the [`checkpoint`] store so retries and restarts resume where
//! they stopped, and the [`budget`] optimizer keeps every call's context
//! under the token ceiling. [`Orchestrator`] is the entry point.

pub mod admission;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod external;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod sim;
pub mod worker;

pub use admission::{Admission, DenialReason, FeatureLevel};
pub use config::{ConfigError, OrchestratorConfig, TierLimit};
pub use error::{ForgeError, ForgeResult};
pub use external::{Cents, CostLedger, GenerationError, Generator, ProgressSink};
pub use job::{BatchId, ClientIdentity, GenerationRequest, Job, JobId, JobStatus};
pub use orchestrator::{
    BatchSubmission, CancelOutcome, Collaborators, Orchestrator, RecoveryReport, SubmissionOutcome,
};
pub use progress::{BatchProgress, ProgressEvent};
