// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable job queue and per-dataset lock.
//!
//! Jobs are JSON payloads in Redis-style lists: pushed on the left, popped
//! on the right, giving FIFO order per named queue. Enqueueing a fresh job
//! claims the dataset lock with an atomic set-if-absent carrying a hard
//! ceiling TTL, so a crashed worker can never hold a dataset forever.
//!
//! # At most one writer
//!
//! ```text
//! add_job ──► SETNX "lock: <pid>" ──► stamp deadline ──► LPUSH "<queue> jobs"
//!                 │ already held
//!                 ▼
//!          AlreadyInProgress (caller polls)
//! ```
//!
//! A job requeued after partial progress keeps its lock: [`JobQueue::requeue`]
//! pushes without claiming again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::job::Job;
use crate::keys::{lock_key, queue_key};
use crate::storage::traits::KeyValueStore;

pub struct JobQueue {
    store: Arc<dyn KeyValueStore>,
    lock_ttl: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, lock_ttl: Duration) -> Self {
        Self { store, lock_ttl }
    }

    /// Lock the dataset and enqueue `job`.
    ///
    /// A job with no writable nodes is a no-op. On success the job carries
    /// its deadline (`now + lock ceiling`). The lock is released again if the
    /// push fails.
    pub async fn add_job(&self, job: &mut Job) -> Result<()> {
        if job.writable_nodes.is_empty() {
            debug!(persistent_id = %job.persistent_id, "Job has no writable nodes, not queued");
            return Ok(());
        }
        if job.persistent_id.is_empty() {
            return Err(SyncError::MissingPersistentId);
        }
        let ceiling = chrono::Duration::from_std(self.lock_ttl)
            .map_err(|e| SyncError::Config(format!("lock ceiling out of range: {e}")))?;

        if !self.lock(&job.persistent_id).await? {
            crate::metrics::record_lock_contention();
            return Err(SyncError::AlreadyInProgress(job.persistent_id.clone()));
        }

        job.deadline = Some(Utc::now() + ceiling);
        if let Err(e) = self.push(job).await {
            if let Err(unlock_err) = self.unlock(&job.persistent_id).await {
                warn!(persistent_id = %job.persistent_id, error = %unlock_err, "Unlock after failed enqueue failed");
            }
            return Err(e);
        }
        info!(
            persistent_id = %job.persistent_id,
            plugin = %job.plugin,
            queue = %queue_key(&job.queue),
            nodes = job.writable_nodes.len(),
            "Job added"
        );
        crate::metrics::record_job_enqueued(&job.queue);
        Ok(())
    }

    /// Push `job` back for another pass, keeping the lock it already holds.
    pub async fn requeue(&self, job: &Job) -> Result<()> {
        self.push(job).await?;
        debug!(persistent_id = %job.persistent_id, err_cnt = job.err_cnt, "Job requeued");
        crate::metrics::record_job_requeued(&job.queue);
        Ok(())
    }

    async fn push(&self, job: &Job) -> Result<()> {
        let payload = job.to_payload()?;
        self.store.lpush(&queue_key(&job.queue), &payload).await?;
        Ok(())
    }

    /// Pop the oldest job of `queue` (empty string = default queue).
    ///
    /// Malformed payloads are logged and dropped; they are never retried.
    pub async fn pop_job(&self, queue: &str) -> Result<Option<Job>> {
        let key = queue_key(queue);
        let Some(payload) = self.store.rpop(&key).await? else {
            return Ok(None);
        };
        match Job::from_payload(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(queue = %key, error = %e, "Dropping malformed job payload");
                crate::metrics::record_malformed_job(queue);
                Ok(None)
            }
        }
    }

    /// Claim the dataset lock. Returns false when already held.
    ///
    /// Each claim stores a fresh token, so a claim that landed before its
    /// reply was lost is recognised as ours rather than as contention.
    pub async fn lock(&self, persistent_id: &str) -> Result<bool> {
        let key = lock_key(persistent_id);
        let token = Uuid::new_v4().simple().to_string();
        match self.store.set_nx(&key, &token, self.lock_ttl).await {
            Ok(claimed) => Ok(claimed),
            Err(e) => match self.store.get(&key).await {
                Ok(Some(holder)) if holder == token => {
                    warn!(persistent_id, error = %e, "Lock reply lost, claim landed");
                    Ok(true)
                }
                _ => Err(e.into()),
            },
        }
    }

    pub async fn unlock(&self, persistent_id: &str) -> Result<()> {
        self.store.delete(&[lock_key(persistent_id)]).await?;
        Ok(())
    }

    pub async fn is_locked(&self, persistent_id: &str) -> Result<bool> {
        Ok(self.store.exists(&lock_key(persistent_id)).await?)
    }

    pub async fn len(&self, queue: &str) -> Result<u64> {
        Ok(self.store.llen(&queue_key(queue)).await?)
    }

    pub async fn is_empty(&self, queue: &str) -> Result<bool> {
        Ok(self.len(queue).await? == 0)
    }
}
