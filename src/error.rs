//! Crate-level error type.

use thiserror::Error;

use crate::admission::DenialReason;
use crate::budget::ContextError;
use crate::checkpoint::{BackendError, CheckpointError};
use crate::config::ConfigError;
use crate::external::{ChargeError, GenerationError};
use crate::job::TransitionError;
use crate::queue::{CancelError, QueueError};

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("admission denied: {0}")]
    AdmissionDenied(DenialReason),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cancel(#[from] CancelError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Charge(#[from] ChargeError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<DenialReason> for ForgeError {
    fn from(reason: DenialReason) -> Self {
        ForgeError::AdmissionDenied(reason)
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err: ForgeError = DenialReason::RateLimited.into();
        assert_eq!(err.to_string(), "admission denied: RATE_LIMITED");

        let err: ForgeError = QueueError::Full { capacity: 4 }.into();
        assert_eq!(err.to_string(), "queue is full (4 jobs)");
    }
}
