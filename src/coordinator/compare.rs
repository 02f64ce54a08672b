//! Reconciliation: classify every file of a dataset against its source.
//!
//! Comparison never blocks on hashing. When the destination holds a file in
//! a different hash algorithm than the source reports, the value is taken
//! from the known-hash cache or a recent tombstone; failing both, the node is
//! reported `Unknown` and a `hash-only` job computes the value in the
//! background so the next poll can classify it.

use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::hashing::{same_hash_type, UNKNOWN_HASH};
use crate::job::{Job, HASH_ONLY_PLUGIN};
use crate::keys::error_key;
use crate::known_hashes::CalculatedHashes;
use crate::tombstone::Tombstone;
use crate::tree::{Node, NodeMap, NodeStatus};

use super::types::{CachedComputeResponse, CachedResponse, CompareResponse, DatasetStatus};
use super::SyncEngine;

/// Overlay source file attributes onto the destination listing.
///
/// Source entries that are not files are dropped. Destination files missing
/// from the source keep an empty remote hash and classify as deleted.
#[must_use]
pub fn merge_node_maps(to: &NodeMap, from: &NodeMap) -> NodeMap {
    let mut res = to.clone();
    for (key, source) in from {
        if !source.is_file() {
            continue;
        }
        let mut node = to.get(key).cloned().unwrap_or_else(|| source.clone());
        if node.is_file() {
            node.attributes.remote_hash = source.attributes.remote_hash.clone();
            node.attributes.remote_hash_type = source.attributes.remote_hash_type.clone();
            node.attributes.remote_file_size = source.attributes.remote_file_size;
            node.attributes.url = source.attributes.url.clone();
        }
        res.insert(key.clone(), node);
    }
    res
}

/// Status of one file whose destination hash is expressed in the remote hash type.
#[must_use]
pub fn classify(node: &Node) -> NodeStatus {
    let attrs = &node.attributes;
    let local = attrs.destination_file.hash.as_str();
    if attrs.remote_hash.is_empty() {
        NodeStatus::Deleted
    } else if local.is_empty() {
        NodeStatus::New
    } else if local == UNKNOWN_HASH {
        NodeStatus::Unknown
    } else if local.eq_ignore_ascii_case(&attrs.remote_hash) {
        NodeStatus::Equal
    } else {
        NodeStatus::Updated
    }
}

fn known_value<'a>(entry: Option<&'a CalculatedHashes>, hash_type: &str) -> Option<&'a String> {
    let entry = entry?;
    entry.remote_hashes.get(hash_type).or_else(|| {
        entry
            .remote_hashes
            .iter()
            .find(|(t, _)| same_hash_type(t, hash_type))
            .map(|(_, v)| v)
    })
}

impl SyncEngine {
    /// Express every destination hash in the node's remote hash type.
    ///
    /// Returns the rewritten nodes and whether a background rehash was needed.
    pub(super) async fn resolve_local_hashes(
        &self,
        token: &str,
        user: &str,
        persistent_id: &str,
        nodes: NodeMap,
        add_jobs: bool,
    ) -> Result<(NodeMap, bool)> {
        let known = self.known_hashes.load(persistent_id).await?;
        let mut to_rehash = NodeMap::new();
        let mut res = NodeMap::with_capacity(nodes.len());

        for (key, mut node) in nodes {
            let remote_type = node.attributes.remote_hash_type.clone();
            if remote_type.is_empty() {
                res.insert(key, node);
                continue;
            }
            let dest = &node.attributes.destination_file;
            let mut value = known_value(known.get(&node.id), &remote_type).cloned();
            if !dest.hash.is_empty() && same_hash_type(&remote_type, &dest.hash_type) {
                value = Some(dest.hash.clone());
            }
            match self.tombstones.get(persistent_id, &key).await? {
                Some(Tombstone::Written) => value = Some(node.attributes.remote_hash.clone()),
                Some(Tombstone::Deleted) => value = Some(String::new()),
                None => {}
            }
            let value = match value {
                Some(v) => v,
                None if !dest.hash.is_empty() => {
                    to_rehash.insert(key.clone(), node.clone());
                    UNKNOWN_HASH.to_string()
                }
                None => String::new(),
            };
            node.attributes.destination_file.hash = value;
            node.attributes.destination_file.hash_type = remote_type;
            res.insert(key, node);
        }

        let job_needed = !to_rehash.is_empty();
        if job_needed && add_jobs {
            let count = to_rehash.len();
            let mut job = Job::new(persistent_id, HASH_ONLY_PLUGIN, to_rehash);
            job.dataverse_key = token.to_string();
            job.user = user.to_string();
            match self.queue.add_job(&mut job).await {
                Ok(()) => debug!(persistent_id, nodes = count, "Rehash job added"),
                Err(SyncError::AlreadyInProgress(_)) => {
                    debug!(persistent_id, "Rehash deferred, dataset is locked");
                }
                Err(e) => warn!(persistent_id, error = %e, "Failed to add rehash job"),
            }
        }
        Ok((res, job_needed))
    }

    /// Classify a merged node map. `add_jobs` schedules background rehashing.
    ///
    /// Running it twice on the same input without an intervening write
    /// yields the same classification.
    pub async fn compare(
        &self,
        nodes: NodeMap,
        persistent_id: &str,
        token: &str,
        user: &str,
        add_jobs: bool,
    ) -> Result<CompareResponse> {
        let _timer = crate::time_operation!("compare");
        let (nodes, job_needed) = self
            .resolve_local_hashes(token, user, persistent_id, nodes, add_jobs)
            .await?;

        let mut data: Vec<Node> = nodes
            .into_values()
            .filter(Node::is_file)
            .map(|mut node| {
                node.status = classify(&node);
                node
            })
            .collect();
        data.sort_by(|a, b| a.id.cmp(&b.id));

        let status = if job_needed || self.queue.is_locked(persistent_id).await? {
            DatasetStatus::Updating
        } else if data.iter().any(|n| n.status != NodeStatus::Equal) {
            DatasetStatus::New
        } else {
            DatasetStatus::Finished
        };

        Ok(CompareResponse {
            id: persistent_id.to_string(),
            status,
            data,
            url: self.destination.get_repo_url(persistent_id, false),
        })
    }

    /// Destination listing, invalidating the known-hash table when it is stale.
    pub async fn query_destination(&self, persistent_id: &str, token: &str, user: &str) -> Result<NodeMap> {
        let listing = self.destination.query(persistent_id, token, user).await?;
        self.known_hashes.check(persistent_id, &listing).await?;
        Ok(listing)
    }

    /// Full compare of a dataset against the nodes a source reported.
    pub async fn compare_dataset(
        &self,
        persistent_id: &str,
        token: &str,
        user: &str,
        source: &NodeMap,
    ) -> Result<CompareResponse> {
        self.destination.check_permission(token, user, persistent_id).await?;
        let listing = self.query_destination(persistent_id, token, user).await?;
        let merged = merge_node_maps(&listing, source);
        let res = self.compare(merged, persistent_id, token, user, true).await?;
        info!(persistent_id, status = %res.status, files = res.data.len(), "Compared");
        Ok(res)
    }

    /// Park a compare result for a poller.
    pub async fn cache_compare_response(&self, res: &CachedResponse) -> Result<()> {
        let raw = serde_json::to_string(res)?;
        self.store.set(&res.key, &raw, Some(self.config.result_ttl())).await?;
        Ok(())
    }

    /// Collect a parked compare result; `ready` is false while none is there.
    pub async fn take_cached_response(&self, key: &str) -> Result<CachedResponse> {
        match self.take_cached(key).await? {
            Some(raw) => {
                let mut res: CachedResponse = serde_json::from_str(&raw)?;
                res.ready = true;
                Ok(res)
            }
            None => Ok(CachedResponse { key: key.to_string(), ..Default::default() }),
        }
    }

    pub async fn take_cached_compute_response(&self, key: &str) -> Result<CachedComputeResponse> {
        match self.take_cached(key).await? {
            Some(raw) => {
                let mut res: CachedComputeResponse = serde_json::from_str(&raw)?;
                res.ready = true;
                Ok(res)
            }
            None => Ok(CachedComputeResponse { key: key.to_string(), ..Default::default() }),
        }
    }

    async fn take_cached(&self, key: &str) -> Result<Option<String>> {
        let raw = self.store.get(key).await?;
        if raw.is_some() {
            self.store.delete(&[key.to_string()]).await?;
        }
        Ok(raw)
    }

    /// Last terminal error of a dataset's job, while its sidecar lives.
    pub async fn last_error(&self, persistent_id: &str) -> Result<Option<String>> {
        Ok(self.store.get(&error_key(persistent_id)).await?)
    }
}
