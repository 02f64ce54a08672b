//! Direct-upload batch finalize and rollback.
//!
//! Content written straight to storage is invisible until the destination
//! registers it. Registration happens once per run, adds before replaces,
//! each split into chunks that run concurrently. Nodes the destination did
//! not confirm go back into the job so the next attempt redoes them.

use std::collections::HashSet;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::job::{Job, JobContext};
use crate::known_hashes::KnownHashes;
use crate::tree::Node;

use super::{SyncEngine, DETACHED_TIMEOUT};

/// A node written to storage but not yet registered.
pub(super) struct Staged {
    pub key: String,
    pub storage_identifier: String,
    pub node: Node,
}

#[derive(Default)]
pub(super) struct PendingBatch {
    pub add: Vec<Staged>,
    pub replace: Vec<Staged>,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.replace.is_empty()
    }

    fn staged(&self) -> impl Iterator<Item = &Staged> {
        self.add.iter().chain(self.replace.iter())
    }
}

fn chunk_len(total: usize, parallelism: usize) -> usize {
    total.div_ceil(parallelism.max(1)).max(1)
}

impl SyncEngine {
    /// Register the batch; on failure roll unconfirmed nodes back into `job`.
    ///
    /// Runs under a detached context so a cancelled job still registers what
    /// it already uploaded.
    pub(super) async fn flush(&self, job: &mut Job, known: &mut KnownHashes, batch: PendingBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let ctx = JobContext::detached(DETACHED_TIMEOUT);
        info!(
            persistent_id = %job.persistent_id,
            added = batch.add.len(),
            replaced = batch.replace.len(),
            "Flushing"
        );

        let mut confirmed = HashSet::new();
        let mut res = self.finalize(&ctx, job, false, &batch.add, &mut confirmed).await;
        if res.is_ok() {
            res = self.finalize(&ctx, job, true, &batch.replace, &mut confirmed).await;
        }

        if let Err(e) = &res {
            let pending: Vec<&Staged> = batch.staged().filter(|s| !confirmed.contains(&s.key)).collect();
            for staged in &pending {
                job.writable_nodes.insert(staged.key.clone(), staged.node.clone());
                known.remove(&staged.node.id);
                if let Err(rm) = self.tombstones.remove(&job.persistent_id, &staged.key).await {
                    warn!(persistent_id = %job.persistent_id, node = %staged.key, error = %rm, "Failed to remove tombstone");
                }
            }
            crate::metrics::record_rollback(pending.len());
            warn!(
                persistent_id = %job.persistent_id,
                confirmed = confirmed.len(),
                rolled_back = pending.len(),
                error = %e,
                "Finalize failed, nodes returned to the job"
            );
            return res;
        }
        info!(persistent_id = %job.persistent_id, files = confirmed.len(), "Flushed");
        Ok(())
    }

    /// Register `staged` in concurrent chunks, collecting confirmed keys.
    async fn finalize(
        &self,
        ctx: &JobContext,
        job: &Job,
        replace: bool,
        staged: &[Staged],
        confirmed: &mut HashSet<String>,
    ) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }
        let size = chunk_len(staged.len(), self.config.direct_upload_parallelism);
        let calls = staged.chunks(size).map(|chunk| async move {
            let storage_identifiers: Vec<String> = chunk.iter().map(|s| s.storage_identifier.clone()).collect();
            let nodes: Vec<Node> = chunk.iter().map(|s| s.node.clone()).collect();
            let res = ctx
                .guard(self.destination.save_after_direct_upload(
                    replace,
                    &job.dataverse_key,
                    &job.user,
                    &job.persistent_id,
                    &storage_identifiers,
                    &nodes,
                ))
                .await;
            let all_keys = || chunk.iter().map(|s| s.key.clone()).collect::<Vec<_>>();
            match res {
                Ok(()) => {
                    crate::metrics::record_finalize(replace, "ok", chunk.len());
                    (all_keys(), Ok(()))
                }
                Err(SyncError::PartialFinalize { confirmed, reason }) => {
                    crate::metrics::record_finalize(replace, "partial", chunk.len());
                    let keys = chunk
                        .iter()
                        .filter(|s| confirmed.contains(&s.node.id))
                        .map(|s| s.key.clone())
                        .collect();
                    (keys, Err(SyncError::PartialFinalize { confirmed, reason }))
                }
                Err(e) => {
                    crate::metrics::record_finalize(replace, "error", chunk.len());
                    (Vec::new(), Err(e))
                }
            }
        });

        let mut first_err = None;
        for (keys, res) in join_all(calls).await {
            confirmed.extend(keys);
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
