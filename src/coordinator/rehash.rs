//! Background rehash of destination files into the source's hash type.

use tracing::{debug, info};

use crate::blob::{trim_protocol, BoxedReader, StorageLocation};
use crate::error::Result;
use crate::hashing::{get_hasher, HashType, HashingReader, UNCOMPUTABLE_HASH};
use crate::job::{Job, JobContext};
use crate::known_hashes::{CalculatedHashes, KnownHashes};
use crate::tree::Node;

use super::SyncEngine;

impl SyncEngine {
    /// Compute remote-type hashes of every node in a `hash-only` job and
    /// record them in the known-hash table.
    ///
    /// The table is saved even when the loop stops early.
    pub(super) async fn do_rehash(&self, ctx: &JobContext, job: &mut Job) -> Result<()> {
        let pid = job.persistent_id.clone();
        ctx.guard(self.destination.check_permission(&job.dataverse_key, &job.user, &pid))
            .await?;
        let mut known = ctx.guard(self.known_hashes.load(&pid)).await?;
        let res = self.rehash_nodes(ctx, job, &mut known).await;
        let saved = self.save_known_hashes(&pid, &known).await;
        res?;
        saved
    }

    async fn rehash_nodes(&self, ctx: &JobContext, job: &mut Job, known: &mut KnownHashes) -> Result<()> {
        let total = job.writable_nodes.len();
        let interval = self.config.checkpoint_interval.max(1);
        let nodes: Vec<(String, Node)> = job
            .writable_nodes
            .iter()
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();
        for (i, (key, node)) in nodes.into_iter().enumerate() {
            ctx.check()?;
            let processed = i + 1;
            if processed % interval == 0 && processed < total {
                self.known_hashes.save(&job.persistent_id, known).await?;
                info!(persistent_id = %job.persistent_id, processed, total, "Hashed");
            }
            self.calculate_hash(ctx, job, &node, known).await?;
            job.writable_nodes.remove(&key);
        }
        Ok(())
    }

    async fn calculate_hash(&self, ctx: &JobContext, job: &Job, node: &Node, known: &mut KnownHashes) -> Result<()> {
        let dest = &node.attributes.destination_file;
        let remote_type = &node.attributes.remote_hash_type;
        if let Some(entry) = known.get(&node.id) {
            if entry.matches_local(&dest.hash_type, &dest.hash) && entry.remote_hashes.contains_key(remote_type) {
                crate::metrics::record_rehash("cached");
                return Ok(());
            }
        }

        let value = ctx.guard(self.do_hash(job, node)).await?;
        debug!(persistent_id = %job.persistent_id, node = %node.id, hash_type = %remote_type, "Hash computed");
        let entry = known
            .entry(node.id.clone())
            .or_insert_with(|| CalculatedHashes::new(&dest.hash_type, &dest.hash));
        if !entry.matches_local(&dest.hash_type, &dest.hash) {
            *entry = CalculatedHashes::new(&dest.hash_type, &dest.hash);
        }
        entry.remote_hashes.insert(remote_type.clone(), value);
        crate::metrics::record_rehash("computed");
        Ok(())
    }

    /// Digest of the destination's copy of `node` in its remote hash type.
    async fn do_hash(&self, job: &Job, node: &Node) -> Result<String> {
        let hash_type: HashType = node.attributes.remote_hash_type.parse()?;
        if !hash_type.is_computable() {
            return Ok(UNCOMPUTABLE_HASH.to_string());
        }
        let size = u64::try_from(node.attributes.destination_file.file_size).unwrap_or(0);
        let hasher = get_hasher(hash_type.as_str(), size)?;
        let content = self.open_destination_content(job, node).await?;
        let mut reader = HashingReader::new(content, vec![hasher]);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
        Ok(reader.hex_sums().into_iter().next().unwrap_or_default())
    }

    /// Read back the destination's copy of a file.
    pub(super) async fn open_destination_content(&self, job: &Job, node: &Node) -> Result<BoxedReader> {
        let dest = &node.attributes.destination_file;
        if !self.destination.is_direct_upload() {
            return self.destination.get_stream(&job.dataverse_key, &job.user, dest.id).await;
        }
        let location = StorageLocation::parse(&dest.storage_identifier, &self.config.storage.default_driver);
        let store = self.blob_store(&location.driver)?;
        store.open(&trim_protocol(&job.persistent_id)?, &location).await
    }
}
