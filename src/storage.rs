//! Durable key/value storage.
//!
//! Mirrors the extension's local storage area: a flat JSON object whose
//! top-level keys hold independent values. [`FileStorage`] persists it to disk,
//! [`MemoryStorage`] keeps it in process.

use crate::error::{FlagError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Read one key. `Ok(None)` if the key was never written.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value stored under `key`.
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// JSON-file backed storage.
///
/// Writes go to a sibling temp file which is then renamed over the target, so
/// a crash mid-write leaves the previous contents intact.
pub struct FileStorage {
    path: PathBuf,
    // serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(FlagError::storage(
                    format!("failed to read {}", self.path.display()),
                    e,
                ));
            }
        };

        if contents.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&contents)? {
            Value::Object(map) => Ok(map),
            _ => Err(FlagError::Storage {
                message: format!("{} does not hold a JSON object", self.path.display()),
                source: None,
            }),
        }
    }

    async fn write_all(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    FlagError::storage(format!("failed to create {}", parent.display()), e)
                })?;
            }
        }

        let serialized = serde_json::to_vec_pretty(map)?;
        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));

        tokio::fs::write(&temp_path, &serialized)
            .await
            .map_err(|e| FlagError::storage(format!("failed to write {}", temp_path.display()), e))?;

        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(FlagError::storage(
                format!("failed to replace {}", self.path.display()),
                e,
            ));
        }

        debug!("Wrote {} bytes to {}", serialized.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        Ok(map.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(key.to_string(), value);
        self.write_all(&map).await
    }
}

/// In-process storage, used by tests and headless runs.
#[derive(Default)]
pub struct MemoryStorage {
    values: DashMap<String, Value>,
    failing: AtomicBool,
    failing_reads: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail (simulates a storage quota or a torn
    /// down extension context).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every subsequent `get` fail.
    pub fn set_failing_reads(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(FlagError::Storage {
                message: format!("read of {} rejected", key),
                source: None,
            });
        }
        Ok(self.snapshot(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FlagError::Storage {
                message: format!("write of {} rejected", key),
                source: None,
            });
        }
        self.values.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
