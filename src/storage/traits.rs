use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage operation timed out: {0}")]
    Timeout(String),
}

/// Shared key-value store holding queues, locks, known hashes and tombstones.
///
/// Semantics follow Redis: string values with optional expiry, an atomic
/// claim-if-absent, and lists used as FIFO queues (push left, pop right).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Set a value; `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Atomically set `key` only if it is absent. Returns whether it was claimed.
    ///
    /// `value` should be unique to the claim: a retried claim that finds its
    /// own value already stored counts as claimed.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn rpop(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn llen(&self, key: &str) -> Result<u64, StorageError>;
}
