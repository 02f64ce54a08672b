// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence: execute a job's writable nodes against the destination.
//!
//! Each node is deleted, or streamed once through three hashers at the same
//! time (destination hash, size, source hash) while being written either
//! over the wire or to a blob store. Direct uploads are collected into
//! add/replace batches and finalized once at the end of the run.
//!
//! Whatever way the loop ends, the batch is flushed and the known-hash table
//! persisted, so partial progress is never lost. Completed nodes leave the
//! job's writable set; the worker requeues the job if any remain.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::blob::{generate_file_name, generate_storage_identifier, trim_protocol, StorageLocation};
use crate::error::{Result, SyncError};
use crate::hashing::{get_hasher, FileSizeHasher, HashType, HashingReader, NOT_NEEDED};
use crate::job::{Job, JobContext, JobKind};
use crate::keys::error_key;
use crate::known_hashes::{CalculatedHashes, KnownHashes};
use crate::notify::success_notification;
use crate::streams::Streams;
use crate::tombstone::{delete_in_chunks, Tombstone};
use crate::tree::{Node, NodeAction, NodeMap};

use super::flush::{PendingBatch, Staged};
use super::{SyncEngine, DETACHED_TIMEOUT};

/// Digests of one written file.
struct Written {
    local_hash: String,
    /// `None` when the remote hash type cannot be computed from content.
    remote_hash: Option<String>,
    size: u64,
}

pub(super) async fn copy_and_close<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

/// Parse a remote hash type, `None` when it is absent or not computable.
fn computable_remote_type(remote_hash_type: &str) -> Result<Option<HashType>> {
    if remote_hash_type.is_empty() {
        return Ok(None);
    }
    let hash_type: HashType = remote_hash_type.parse()?;
    Ok(hash_type.is_computable().then_some(hash_type))
}

impl SyncEngine {
    /// One attempt at a write or hash-only job.
    ///
    /// `job.writable_nodes` shrinks as nodes complete, also when an error is
    /// returned.
    #[tracing::instrument(skip(self, job), fields(persistent_id = %job.persistent_id, plugin = %job.plugin))]
    pub async fn do_work(&self, job: &mut Job) -> Result<()> {
        let ctx = JobContext::new(&self.shutdown, job.deadline);
        crate::metrics::record_job_started(&job.plugin);
        match job.kind() {
            JobKind::HashOnly => return self.do_rehash(&ctx, job).await,
            JobKind::Compute(_) => return self.run_compute(&ctx, job).await,
            JobKind::Stream(_) => {}
        }
        let _timer = crate::time_operation!("persist");

        let mut known = ctx.guard(self.known_hashes.load(&job.persistent_id)).await?;
        job.writable_nodes = self.filter_redundant(&ctx, job, &known).await?;

        let stream_nodes: NodeMap = job
            .writable_nodes
            .iter()
            .filter(|(_, n)| n.action != NodeAction::Delete)
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();
        let mut streams = if stream_nodes.is_empty() {
            Streams::default()
        } else {
            let provider = self.plugins.get(&job.plugin)?;
            let mut params = job.stream_params.clone();
            params.persistent_id = job.persistent_id.clone();
            params.dv_token = job.dataverse_key.clone();
            ctx.guard(provider.streams(&stream_nodes, &params)).await?
        };

        let res = self.do_persist_node_map(&ctx, &mut streams, job, &mut known).await;
        let cleanup = streams.cleanup();
        if let Err(e) = res {
            if let Err(cleanup_err) = cleanup {
                warn!(persistent_id = %job.persistent_id, error = %cleanup_err, "Stream cleanup failed");
            }
            return Err(e);
        }
        cleanup?;
        self.notify_success(job).await;
        Ok(())
    }

    /// Drop actions that a concurrent job already carried out.
    ///
    /// A copy or update is redundant when the known-hash table shows the
    /// remote hash already in place over unchanged local content. A delete
    /// is redundant when the destination no longer lists the file.
    pub(super) async fn filter_redundant(&self, ctx: &JobContext, job: &Job, known: &KnownHashes) -> Result<NodeMap> {
        let mut filtered = NodeMap::new();
        let mut has_delete = false;
        for (key, node) in &job.writable_nodes {
            if node.action == NodeAction::Delete {
                has_delete = true;
            } else if let Some(entry) = known.get(key) {
                let remote_done = entry
                    .remote_hashes
                    .get(&node.attributes.remote_hash_type)
                    .is_some_and(|h| *h == node.attributes.remote_hash);
                if remote_done && entry.local_hash_value == node.attributes.destination_file.hash {
                    debug!(persistent_id = %job.persistent_id, node = %key, "Skipping redundant write");
                    continue;
                }
            }
            filtered.insert(key.clone(), node.clone());
        }
        if !has_delete {
            return Ok(filtered);
        }
        let listing = ctx
            .guard(self.destination.query(&job.persistent_id, &job.dataverse_key, &job.user))
            .await?;
        filtered.retain(|key, node| node.action != NodeAction::Delete || listing.contains_key(key));
        Ok(filtered)
    }

    /// Execute `job.writable_nodes` with the given content streams.
    pub async fn do_persist_node_map(
        &self,
        ctx: &JobContext,
        streams: &mut Streams,
        job: &mut Job,
        known: &mut KnownHashes,
    ) -> Result<()> {
        ctx.guard(
            self.destination
                .check_permission(&job.dataverse_key, &job.user, &job.persistent_id),
        )
        .await?;

        let mut batch = PendingBatch::default();
        let mut written_keys = Vec::new();
        let res = self
            .persist_nodes(ctx, streams, job, known, &mut batch, &mut written_keys)
            .await;
        let flushed = self.flush(job, known, batch).await;
        let saved = self.save_known_hashes(&job.persistent_id, known).await;

        if res.is_ok() {
            written_keys.push(error_key(&job.persistent_id));
        }
        self.schedule_cleanup(written_keys);
        res?;
        flushed?;
        saved
    }

    async fn persist_nodes(
        &self,
        ctx: &JobContext,
        streams: &mut Streams,
        job: &mut Job,
        known: &mut KnownHashes,
        batch: &mut PendingBatch,
        written_keys: &mut Vec<String>,
    ) -> Result<()> {
        let pid = job.persistent_id.clone();
        let total = job.writable_nodes.len();
        let interval = self.config.checkpoint_interval.max(1);
        let nodes: Vec<(String, Node)> = job
            .writable_nodes
            .iter()
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();

        for (i, (key, mut node)) in nodes.into_iter().enumerate() {
            ctx.check()?;
            let processed = i + 1;
            if processed % interval == 0 && processed < total {
                self.known_hashes.save(&pid, known).await?;
                info!(persistent_id = %pid, processed, total, "Processed");
            }

            if node.action == NodeAction::Delete {
                self.delete_node(job, &node).await?;
                known.remove(&node.id);
                job.writable_nodes.remove(&key);
                self.mark_tombstone(&pid, &key, Tombstone::Deleted, written_keys).await;
                crate::metrics::record_file_persisted("delete");
                continue;
            }
            if !node.is_file() {
                job.writable_nodes.remove(&key);
                continue;
            }

            let storage_identifier = generate_storage_identifier(&generate_file_name(), &self.config.storage);
            let written = self
                .write_node(ctx, streams, job, &key, &node, &storage_identifier)
                .await?;

            let hash_type = self.config.default_hash.clone();
            let remote_type = node.attributes.remote_hash_type.clone();
            node.attributes.destination_file.hash = written.local_hash.clone();
            node.attributes.destination_file.hash_type = hash_type.clone();
            node.attributes.destination_file.file_size = i64::try_from(written.size).unwrap_or(i64::MAX);

            let remote_value = match self.verify_remote_hash(&node, written.remote_hash) {
                Ok(value) => value,
                Err(e) => {
                    if self.destination.is_direct_upload() {
                        self.discard_blob(job, &storage_identifier).await;
                    }
                    return Err(e);
                }
            };

            if self.destination.is_direct_upload() {
                let staged = Staged {
                    key: key.clone(),
                    storage_identifier,
                    node: node.clone(),
                };
                if node.attributes.destination_file.id != 0 {
                    batch.replace.push(staged);
                } else {
                    batch.add.push(staged);
                }
            }

            if !remote_type.is_empty() && written.local_hash != remote_value {
                let mut entry = CalculatedHashes::new(hash_type, written.local_hash);
                entry.remote_hashes.insert(remote_type, remote_value);
                known.insert(node.id.clone(), entry);
            }
            self.mark_tombstone(&pid, &key, Tombstone::Written, written_keys).await;
            job.writable_nodes.remove(&key);
            crate::metrics::record_file_persisted(if node.action == NodeAction::Update { "update" } else { "copy" });
            crate::metrics::record_bytes_written(written.size);
        }
        Ok(())
    }

    /// Check the computed source hash against the declared one and return
    /// the value to record for the remote hash type.
    fn verify_remote_hash(&self, node: &Node, computed: Option<String>) -> Result<String> {
        let attrs = &node.attributes;
        let declared = &attrs.remote_hash;
        let remote_type = attrs.remote_hash_type.parse::<HashType>().ok();

        // git-hash needs the size up front; without it the declared value stands.
        let unverifiable = remote_type == Some(HashType::GitHash) && attrs.remote_file_size == 0;
        let computed = match computed {
            Some(value) if !unverifiable => value,
            _ => return Ok(declared.clone()),
        };
        if declared == NOT_NEEDED || computed.eq_ignore_ascii_case(declared) {
            return Ok(computed);
        }
        if remote_type == Some(HashType::QuickXorHash) {
            warn!(
                node = %node.id,
                expected = %declared,
                actual = %computed,
                "quickXorHash not equal, trusting the declared value"
            );
            crate::metrics::record_hash_mismatch(&attrs.remote_hash_type, false);
            return Ok(declared.clone());
        }
        crate::metrics::record_hash_mismatch(&attrs.remote_hash_type, true);
        Err(SyncError::HashMismatch {
            id: node.id.clone(),
            expected: declared.clone(),
            actual: computed,
        })
    }

    async fn write_node(
        &self,
        ctx: &JobContext,
        streams: &mut Streams,
        job: &Job,
        key: &str,
        node: &Node,
        storage_identifier: &str,
    ) -> Result<Written> {
        let size_hint = u64::try_from(node.attributes.remote_file_size).unwrap_or(0);
        let remote_type = computable_remote_type(&node.attributes.remote_hash_type)?;
        let mut hashers = vec![
            get_hasher(&self.config.default_hash, size_hint)?,
            Box::new(FileSizeHasher::new()) as Box<dyn crate::hashing::ContentHasher>,
        ];
        if let Some(remote_type) = remote_type {
            hashers.push(get_hasher(remote_type.as_str(), size_hint)?);
        }

        let mut stream = streams.take(key)?;
        let content = ctx.guard(stream.open()).await?;
        let mut reader = HashingReader::new(content, hashers);

        if self.destination.is_direct_upload() {
            let location = StorageLocation::parse(storage_identifier, &self.config.storage.default_driver);
            let store = self.blob_store(&location.driver)?;
            let dataset_path = trim_protocol(&job.persistent_id)?;
            let mut writer = ctx.guard(store.create(&dataset_path, &location)).await?;
            let copied = ctx.guard(copy_and_close(&mut reader, &mut writer)).await;
            drop(writer);
            if let Err(e) = copied {
                self.discard_blob(job, storage_identifier).await;
                return Err(e);
            }
        } else {
            let mut upload = ctx
                .guard(self.destination.write_over_wire(
                    node.attributes.destination_file.id,
                    &node.id,
                    &job.dataverse_key,
                    &job.user,
                    &job.persistent_id,
                ))
                .await?;
            let copied = ctx.guard(copy_and_close(&mut reader, &mut upload.writer)).await;
            let closing = JobContext::detached(DETACHED_TIMEOUT);
            match copied {
                Ok(_) => closing.guard(upload.finish()).await?,
                Err(e) => {
                    // The destination's own error explains a broken pipe better.
                    closing.guard(upload.abort()).await?;
                    return Err(e);
                }
            }
        }

        Ok(Written {
            local_hash: reader.sum(0).map(hex::encode).unwrap_or_default(),
            remote_hash: remote_type.and_then(|_| reader.sum(2)).map(hex::encode),
            size: reader.bytes_read(),
        })
    }

    /// Remove a directly uploaded blob that will never be registered.
    async fn discard_blob(&self, job: &Job, storage_identifier: &str) {
        let location = StorageLocation::parse(storage_identifier, &self.config.storage.default_driver);
        let removed = async {
            let store = self.blob_store(&location.driver)?;
            let dataset_path = trim_protocol(&job.persistent_id)?;
            JobContext::detached(DETACHED_TIMEOUT)
                .guard(store.delete(&dataset_path, &location))
                .await
        }
        .await;
        match removed {
            Ok(()) => debug!(persistent_id = %job.persistent_id, blob = %location.filename, "Discarded unregistered blob"),
            Err(e) => warn!(persistent_id = %job.persistent_id, blob = %location.filename, error = %e, "Failed to discard blob"),
        }
    }

    async fn delete_node(&self, job: &Job, node: &Node) -> Result<()> {
        let ctx = JobContext::detached(DETACHED_TIMEOUT);
        ctx.guard(self.destination.delete_file(
            &job.dataverse_key,
            &job.user,
            node.attributes.destination_file.id,
        ))
        .await
    }

    /// Delete the run's marker keys once the cleanup delay has passed.
    ///
    /// The task lives on the background tracker and exits early on shutdown;
    /// markers then expire through their TTL.
    fn schedule_cleanup(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        let store = self.store.clone();
        let delay = self.config.tombstone_cleanup_delay();
        let chunk_size = self.config.cleanup_chunk_size;
        let shutdown = self.shutdown.clone();
        self.background.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = delete_in_chunks(store.as_ref(), &keys, chunk_size).await {
                warn!(error = %e, keys = keys.len(), "Tombstone cleanup failed");
            }
        });
    }

    async fn notify_success(&self, job: &Job) {
        if !job.send_email_on_success {
            return;
        }
        let ctx = JobContext::detached(DETACHED_TIMEOUT);
        let to = match ctx.guard(self.destination.get_user_email(&job.dataverse_key, &job.user)).await {
            Ok(to) => to,
            Err(e) => {
                warn!(persistent_id = %job.persistent_id, error = %e, "Error when sending email on success");
                return;
            }
        };
        let url = self.destination.get_repo_url(&job.persistent_id, true);
        let notification = success_notification(&self.config.mail, &to, &job.persistent_id, &url);
        if let Err(e) = ctx.guard(self.notifier.send(notification)).await {
            warn!(persistent_id = %job.persistent_id, error = %e, "Error when sending email on success");
        }
    }
}
