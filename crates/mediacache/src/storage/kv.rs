//! # Key-Value Persistence
//!
//! The persistence substrate used for the resource index and for paused
//! transfer blobs. Only the read/write contract matters to the engine; two
//! backends are provided: a process-local map and a directory of JSON records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use crate::error::Result;

/// A key-value store holding opaque byte values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store, mostly useful for tests and ephemeral caches
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Serialize, Deserialize)]
struct KvRecord {
    key: String,
    value: String,
}

/// File-backed store: one JSON record per key in a single directory.
///
/// Writes go to a temporary file and are renamed into place, so a killed
/// process never leaves a half-written record behind.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
    // Serializes writers; readers only see fully renamed files.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileKvStore {
    /// Open the store, creating its directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{hash:x}.json"))
    }

    async fn read_record(path: &Path) -> io::Result<Option<KvRecord>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<KvRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = ?path, error = %e, "Discarding unreadable key-value record");
                let _ = fs::remove_file(path).await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key);
        let Some(record) = Self::read_record(&path).await? else {
            return Ok(None);
        };
        match hex::decode(&record.value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Stored value is not valid hex");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let record = KvRecord {
            key: key.to_string(),
            value: hex::encode(value),
        };
        let json = serde_json::to_vec(&record)?;
        let path = self.record_path(key);
        let temp_path = path.with_extension("tmp");

        let _guard = self.write_lock.lock().await;
        fs::write(&temp_path, &json).await?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            warn!(from = ?temp_path, to = ?path, error = %e, "Failed to rename key-value record");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        debug!(key = %key, bytes = value.len(), "Persisted key-value record");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await? {
                Some(record) if record.key.starts_with(prefix) => keys.push(record.key),
                _ => {}
            }
        }
        Ok(keys)
    }
}
