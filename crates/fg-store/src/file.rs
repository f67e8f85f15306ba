//! File-backed object store
//!
//! The whole map lives in memory and is rewritten to a single JSON document
//! on every mutation (temp file + rename), so a crash never leaves a torn
//! file behind. Suited to the low write rates of delivery counters, not to
//! bulk data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{ObjectStore, Result, StoreError};

pub struct FileObjectStore {
    name: String,
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileObjectStore {
    /// Open (or create) a store persisted at `path`
    pub async fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let name = name.into();
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(store = %name, path = ?path, entries = entries.len(), "Opened file object store");

        Ok(Self {
            name,
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a mutation and persist it; memory is only updated once the
    /// write succeeded.
    async fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> (R, bool),
    {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        let (result, changed) = f(&mut next);

        if changed {
            self.persist(&next).await?;
            *entries = next;
        }
        Ok(result)
    }

    async fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(store = %self.name, entries = entries.len(), "Persisted object store");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value);
            ((), true)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.mutate(|entries| {
            let previous = entries.remove(key);
            let changed = previous.is_some();
            (previous, changed)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool> {
        self.mutate(|entries| {
            if entries.get(key) != expected {
                return (false, false);
            }
            match new {
                Some(value) => {
                    entries.insert(key.to_string(), value);
                }
                None => {
                    entries.remove(key);
                }
            }
            (true, true)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.mutate(|entries| {
            let changed = !entries.is_empty();
            entries.clear();
            ((), changed)
        })
        .await
    }
}
