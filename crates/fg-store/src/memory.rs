//! In-memory object store

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::{ObjectStore, Result};

/// Limits for the in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreConfig {
    /// Maximum number of entries; the oldest entry is evicted on overflow
    pub max_entries: Option<usize>,
    /// Entries older than this are treated as absent and removed by `expire()`
    pub entry_ttl: Option<Duration>,
}

struct Entry {
    value: Value,
    stored_at: Instant,
}

pub struct MemoryObjectStore {
    name: String,
    config: MemoryStoreConfig,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryObjectStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, MemoryStoreConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: MemoryStoreConfig) -> Self {
        Self {
            name: name.into(),
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove entries past their TTL, returning how many were dropped
    pub fn expire(&self) -> usize {
        let Some(ttl) = self.config.entry_ttl else {
            return 0;
        };

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        let removed = before - entries.len();

        if removed > 0 {
            debug!(store = %self.name, removed = removed, "Expired object store entries");
        }
        removed
    }

    fn is_live(&self, entry: &Entry) -> bool {
        match self.config.entry_ttl {
            Some(ttl) => entry.stored_at.elapsed() < ttl,
            None => true,
        }
    }

    fn insert_locked(&self, entries: &mut HashMap<String, Entry>, key: &str, value: Value) {
        if let Some(max) = self.config.max_entries {
            if !entries.contains_key(key) && entries.len() >= max {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    debug!(store = %self.name, key = %oldest, "Evicted oldest entry at capacity");
                }
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|e| self.is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write();
        self.insert_locked(&mut entries, key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.write();
        Ok(entries
            .remove(key)
            .filter(|e| self.is_live(e))
            .map(|e| e.value))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool> {
        let mut entries = self.entries.write();
        let current = entries.get(key).filter(|e| self.is_live(e)).map(|e| &e.value);

        if current != expected {
            return Ok(false);
        }

        match new {
            Some(value) => self.insert_locked(&mut entries, key, value),
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|(_, e)| self.is_live(e))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}
