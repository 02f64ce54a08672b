//! Short-lived "written"/"deleted" markers.
//!
//! After the persistence engine writes or deletes a node it leaves a marker
//! under `<pid> -> <node id>`. Comparison prefers the marker over the
//! destination listing for as long as it lives, which hides the window in
//! which the destination has not caught up with a finished write. This is
//! best-effort consistency: a poller slower than the TTL can still observe
//! pre-write state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::keys::tombstone_key;
use crate::storage::traits::KeyValueStore;

pub const WRITTEN: &str = "written";
pub const DELETED: &str = "deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tombstone {
    Written,
    Deleted,
}

impl Tombstone {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Tombstone::Written => WRITTEN,
            Tombstone::Deleted => DELETED,
        }
    }
}

impl fmt::Display for Tombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tombstone {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            WRITTEN => Ok(Tombstone::Written),
            DELETED => Ok(Tombstone::Deleted),
            _ => Err(()),
        }
    }
}

pub struct Tombstones {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl Tombstones {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mark a node; returns the key so the caller can clean it up later.
    pub async fn mark(&self, persistent_id: &str, node_id: &str, tombstone: Tombstone) -> Result<String> {
        let key = tombstone_key(persistent_id, node_id);
        self.store.set(&key, tombstone.as_str(), Some(self.ttl)).await?;
        Ok(key)
    }

    pub async fn get(&self, persistent_id: &str, node_id: &str) -> Result<Option<Tombstone>> {
        let value = self.store.get(&tombstone_key(persistent_id, node_id)).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn remove(&self, persistent_id: &str, node_id: &str) -> Result<()> {
        self.store.delete(&[tombstone_key(persistent_id, node_id)]).await?;
        Ok(())
    }
}

/// Delete `keys` in chunks of at most `chunk_size` per call.
pub async fn delete_in_chunks(store: &dyn KeyValueStore, keys: &[String], chunk_size: usize) -> Result<u64> {
    let mut removed = 0;
    for chunk in keys.chunks(chunk_size.max(1)) {
        removed += store.delete(chunk).await?;
    }
    debug!(keys = keys.len(), removed, "Cleaned up marker keys");
    Ok(removed)
}
