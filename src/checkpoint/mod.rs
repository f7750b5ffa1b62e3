//! Durable checkpoints, job records and results.
//!
//! [`CheckpointStore`] writes checksummed JSON values through a [`KvBackend`]
//! so a crashed process can resume jobs where they stopped. [`ResumePlan`]
//! holds the pure arithmetic of picking a job back up.

pub mod backend;
pub mod resume;
pub mod store;

pub use backend::{BackendError, FileBackend, KvBackend, MemoryBackend};
pub use resume::{Increment, ResumePlan};
pub use store::{Checkpoint, CheckpointError, CheckpointResult, CheckpointStore, JobRecord};
