//! Known-hash cache.
//!
//! Per dataset, a JSON table `node id → CalculatedHashes` stored under
//! `hashes: <pid>` with no expiry. It records, for the local (destination)
//! hash of a file, the hashes of the same content in other algorithms, so
//! a file is not re-downloaded just to compare it with a source that uses a
//! different algorithm.
//!
//! The table is dropped as a whole as soon as a destination listing shows a
//! local hash that differs from the recorded one: the content changed
//! out-of-band and nothing in the table can be trusted any more.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::keys::known_hashes_key;
use crate::storage::traits::KeyValueStore;
use crate::tree::NodeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CalculatedHashes {
    pub local_hash_type: String,
    pub local_hash_value: String,
    /// Hash type → hex value of the same content.
    pub remote_hashes: HashMap<String, String>,
}

impl CalculatedHashes {
    #[must_use]
    pub fn new(local_hash_type: impl Into<String>, local_hash_value: impl Into<String>) -> Self {
        Self {
            local_hash_type: local_hash_type.into(),
            local_hash_value: local_hash_value.into(),
            remote_hashes: HashMap::new(),
        }
    }

    /// Whether this entry describes the given local content.
    #[must_use]
    pub fn matches_local(&self, hash_type: &str, hash_value: &str) -> bool {
        self.local_hash_type == hash_type && self.local_hash_value == hash_value
    }
}

/// Node id → hashes.
pub type KnownHashes = HashMap<String, CalculatedHashes>;

pub struct KnownHashStore {
    store: Arc<dyn KeyValueStore>,
}

impl KnownHashStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the table; missing or unreadable tables read as empty.
    pub async fn load(&self, persistent_id: &str) -> Result<KnownHashes> {
        let Some(raw) = self.store.get(&known_hashes_key(persistent_id)).await? else {
            return Ok(KnownHashes::new());
        };
        match serde_json::from_str(&raw) {
            Ok(table) => Ok(table),
            Err(e) => {
                warn!(persistent_id, error = %e, "Known-hash table unreadable, starting empty");
                Ok(KnownHashes::new())
            }
        }
    }

    pub async fn save(&self, persistent_id: &str, known: &KnownHashes) -> Result<()> {
        let raw = serde_json::to_string(known)?;
        self.store.set(&known_hashes_key(persistent_id), &raw, None).await?;
        Ok(())
    }

    pub async fn invalidate(&self, persistent_id: &str) -> Result<()> {
        self.store.delete(&[known_hashes_key(persistent_id)]).await?;
        Ok(())
    }

    /// Compare the table against a fresh destination listing.
    ///
    /// Invalidates the whole table and returns `false` when any recorded
    /// local hash no longer matches the listing.
    pub async fn check(&self, persistent_id: &str, listing: &NodeMap) -> Result<bool> {
        let known = self.load(persistent_id).await?;
        let stale = listing.iter().find(|(id, node)| {
            known.get(*id).is_some_and(|entry| {
                !entry.local_hash_value.is_empty()
                    && !entry.matches_local(
                        &node.attributes.destination_file.hash_type,
                        &node.attributes.destination_file.hash,
                    )
            })
        });
        if let Some((id, _)) = stale {
            info!(persistent_id, node = %id, "Destination content changed, invalidating known hashes");
            crate::metrics::record_known_hash_invalidation();
            self.invalidate(persistent_id).await?;
            return Ok(false);
        }
        Ok(true)
    }
}
