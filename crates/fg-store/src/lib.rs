//! Flowgate Object Store
//!
//! Key-value persistence for state that must outlive a single invocation:
//! delivery counters for the redelivery policy and anything else keyed by a
//! message identity.
//!
//! - `ObjectStore`: the capability trait the routing core depends on
//! - `MemoryObjectStore`: process-local map with optional TTL and size bound
//! - `FileObjectStore`: JSON file persisted on every mutation, survives restart
//!
//! Every operation is individually atomic. Cross-key transactions are not
//! offered; callers needing read-modify-write on one key use
//! `compare_and_swap` in a loop.

use async_trait::async_trait;
use serde_json::Value;

pub mod error;
pub mod file;
pub mod memory;

pub use error::{Result, StoreError};
pub use file::FileObjectStore;
pub use memory::{MemoryObjectStore, MemoryStoreConfig};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key, returning the previous value
    async fn remove(&self, key: &str) -> Result<Option<Value>>;

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Atomically replace the value at `key` if it currently equals `expected`.
    ///
    /// `expected = None` means "key absent"; `new = None` removes the key.
    /// Returns false without modifying anything when the current value differs.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;
}
