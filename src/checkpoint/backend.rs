//! Key/value persistence behind the checkpoint store.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const VALUE_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Errors that can occur in a key/value backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Key contains characters or segments the backend cannot store.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Minimal key/value store. Keys are `/`-separated, e.g. `checkpoint/<job-id>`.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;
    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError>;
}

/// Process-local backend. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> BackendError {
    BackendError::Io(io::Error::new(io::ErrorKind::Other, "memory backend lock poisoned"))
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        validate_key(key)?;
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Backend storing one JSON file per key under a root directory.
///
/// Writes go to a temp file which is synced and then renamed over the
/// target, so a crash never leaves a half-written value behind.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root_dir: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `root_dir`, creating the directory if needed.
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BackendError> {
        validate_key(key)?;
        let mut path = self.root_dir.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path.set_extension(VALUE_EXTENSION);
        Ok(path)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION) {
            return None;
        }
        let relative = path.strip_prefix(&self.root_dir).ok()?.with_extension("");
        let segments: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(segments.join("/"))
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension(TEMP_EXTENSION);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(BackendError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Keys are non-empty `/`-separated segments of `[A-Za-z0-9_-]`.
fn validate_key(key: &str) -> Result<(), BackendError> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(BackendError::InvalidKey(key.to_string()))
    }
}
