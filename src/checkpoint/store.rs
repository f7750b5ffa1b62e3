use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::backend::{BackendError, KvBackend, MemoryBackend};
use crate::job::{Job, JobId};

const CHECKPOINT_PREFIX: &str = "checkpoint/";
const RECORD_PREFIX: &str = "job/";
const RESULT_PREFIX: &str = "result/";
const ENVELOPE_VERSION: u32 = 1;

/// Errors that can occur in the checkpoint store.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Stored bytes failed to parse or did not match their checksum.
    #[error("corrupt value at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Partial output of a job, written after every finished stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    /// Number of stages finished; the next stage to run
    pub stage: u32,
    pub partial_output: String,
    pub tokens_used: u64,
    pub last_saved: DateTime<Utc>,
}

/// Durable copy of an in-flight job, used to rebuild the queue on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    /// Set just before the ledger is charged
    #[serde(default)]
    pub charge_issued: bool,
    pub recorded_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            charge_issued: false,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    body: String,
}

fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

fn seal<T: Serialize>(value: &T) -> CheckpointResult<Vec<u8>> {
    let body = serde_json::to_string(value)?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        checksum: checksum(&body),
        body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn open<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CheckpointResult<T> {
    let corrupt = |detail: String| CheckpointError::Corrupt {
        key: key.to_string(),
        detail,
    };
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unreadable envelope: {e}")))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(corrupt(format!("unsupported version {}", envelope.version)));
    }
    if checksum(&envelope.body) != envelope.checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }
    serde_json::from_str(&envelope.body).map_err(|e| corrupt(format!("unreadable body: {e}")))
}

fn checkpoint_key(job_id: JobId) -> String {
    format!("{CHECKPOINT_PREFIX}{job_id}")
}

fn record_key(job_id: JobId) -> String {
    format!("{RECORD_PREFIX}{job_id}")
}

fn result_key(job_id: JobId) -> String {
    format!("{RESULT_PREFIX}{job_id}")
}

/// Checksummed checkpoints, job records and results over a [`KvBackend`].
///
/// Corrupt values are never surfaced as errors from the read paths: they are
/// logged under the `data_integrity` target, deleted and reported as absent.
pub struct CheckpointStore {
    backend: Arc<dyn KvBackend>,
    write_locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    fn write_lock(&self, job_id: JobId) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.write_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_write_lock(&self, job_id: JobId) {
        let mut locks = match self.write_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks
            .get(&job_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&job_id);
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> CheckpointResult<Option<T>> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        match open(key, &bytes) {
            Ok(value) => Ok(Some(value)),
            Err(CheckpointError::Corrupt { key, detail }) => {
                warn!(
                    target: "data_integrity",
                    key = %key,
                    detail = %detail,
                    "discarding corrupt value"
                );
                self.backend.delete(&key).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Persist progress for `job_id`. `last_saved` never moves backwards.
    pub async fn save(
        &self,
        job_id: JobId,
        stage: u32,
        partial_output: &str,
        tokens_used: u64,
    ) -> CheckpointResult<Checkpoint> {
        let lock = self.write_lock(job_id);
        let _guard = lock.lock().await;

        let key = checkpoint_key(job_id);
        let now = Utc::now();
        let last_saved = match self.read::<Checkpoint>(&key).await? {
            Some(previous) if previous.last_saved > now => previous.last_saved,
            _ => now,
        };
        let checkpoint = Checkpoint {
            job_id,
            stage,
            partial_output: partial_output.to_string(),
            tokens_used,
            last_saved,
        };
        self.backend.put(&key, seal(&checkpoint)?).await?;
        debug!(job_id = %job_id, stage, tokens_used, "checkpoint saved");
        Ok(checkpoint)
    }

    pub async fn load(&self, job_id: JobId) -> CheckpointResult<Option<Checkpoint>> {
        self.read(&checkpoint_key(job_id)).await
    }

    pub async fn clear(&self, job_id: JobId) -> CheckpointResult<()> {
        let lock = self.write_lock(job_id);
        let _guard = lock.lock().await;
        self.backend.delete(&checkpoint_key(job_id)).await?;
        Ok(())
    }

    /// Every readable checkpoint, in key order.
    pub async fn load_checkpoints(&self) -> CheckpointResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for key in self.backend.keys(CHECKPOINT_PREFIX).await? {
            if let Some(checkpoint) = self.read(&key).await? {
                checkpoints.push(checkpoint);
            }
        }
        Ok(checkpoints)
    }

    pub async fn save_record(&self, record: &JobRecord) -> CheckpointResult<()> {
        let job_id = record.job.id;
        let lock = self.write_lock(job_id);
        let _guard = lock.lock().await;
        self.backend.put(&record_key(job_id), seal(record)?).await?;
        Ok(())
    }

    pub async fn load_record(&self, job_id: JobId) -> CheckpointResult<Option<JobRecord>> {
        self.read(&record_key(job_id)).await
    }

    /// Every readable job record, in key order.
    pub async fn load_records(&self) -> CheckpointResult<Vec<JobRecord>> {
        let mut records = Vec::new();
        for key in self.backend.keys(RECORD_PREFIX).await? {
            if let Some(record) = self.read(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn clear_record(&self, job_id: JobId) -> CheckpointResult<()> {
        {
            let lock = self.write_lock(job_id);
            let _guard = lock.lock().await;
            self.backend.delete(&record_key(job_id)).await?;
        }
        self.release_write_lock(job_id);
        Ok(())
    }

    /// Store the final text of a job and return its reference.
    pub async fn put_result(&self, job_id: JobId, text: &str) -> CheckpointResult<String> {
        let key = result_key(job_id);
        self.backend.put(&key, seal(&text)?).await?;
        Ok(key)
    }

    pub async fn get_result(&self, job_id: JobId) -> CheckpointResult<Option<String>> {
        self.read(&result_key(job_id)).await
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}
