use crate::error::HarnessError;
use crate::models::StoredResult;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Durable key to evaluation result mapping
#[async_trait]
pub trait ReportingStore: Send + Sync {
    /// Look up a result by exact key
    async fn get(&self, key: &str) -> Result<Option<StoredResult>, HarnessError>;

    /// Store a result under its key, replacing any earlier one
    async fn put(&self, entry: StoredResult) -> Result<(), HarnessError>;
}

/// Store keeping one JSON file per key in a directory.
///
/// Writes land in a temporary file that is renamed into place, so readers
/// see either the previous entry or the complete new one.
pub struct DiskStore {
    root: PathBuf,
    ttl: Option<Duration>,
    /// Per-key writer locks, present only while a write to that key is in flight
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            HarnessError::Storage(format!("Failed to create directory {}: {}", root.display(), e))
        })?;

        Ok(Self {
            root,
            ttl: None,
            write_locks: Mutex::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Treat entries older than `ttl` as absent
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, HarnessError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(HarnessError::Storage(format!("Invalid store key: {:?}", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn is_expired(&self, entry: &StoredResult) -> bool {
        match self.ttl {
            Some(ttl) => Utc::now() - entry.created_at > ttl,
            None => false,
        }
    }

    /// Drop the writer lock for `key` once no other writer holds or awaits it
    async fn release_key_lock(&self, key: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.write_locks.lock().await;
        // one reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }

    /// Write `content` to a unique temp file and rename it over `path`
    async fn write_entry(&self, key: &str, path: &Path, content: String) -> Result<(), HarnessError> {
        let tmp_path = self.root.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = fs::write(&tmp_path, content).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(HarnessError::Storage(format!(
                "Failed to write {}: {}",
                tmp_path.display(),
                e
            )));
        }
        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(HarnessError::Storage(format!(
                "Failed to move result into {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ReportingStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<StoredResult>, HarnessError> {
        let path = self.entry_path(key)?;

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HarnessError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let entry: StoredResult = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable cache entry: {}", e);
                return Ok(None);
            }
        };

        if entry.key != key {
            warn!(path = %path.display(), "Ignoring cache entry stored under another key");
            return Ok(None);
        }
        if self.is_expired(&entry) {
            debug!(key, created_at = %entry.created_at, "Cache entry expired");
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn put(&self, entry: StoredResult) -> Result<(), HarnessError> {
        let path = self.entry_path(&entry.key)?;
        let content = serde_json::to_string_pretty(&entry)?;

        let lock = self.key_lock(&entry.key).await;
        let written = {
            let _guard = lock.lock().await;
            self.write_entry(&entry.key, &path, content).await
        };
        self.release_key_lock(&entry.key, &lock).await;
        written?;

        debug!(key = %entry.key, path = %path.display(), "Stored evaluation result");
        Ok(())
    }
}

/// In-process store, lost when the process exits
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ReportingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredResult>, HarnessError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, entry: StoredResult) -> Result<(), HarnessError> {
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }
}
