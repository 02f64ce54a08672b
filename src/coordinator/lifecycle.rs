// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker lifecycle: poll loop, retry policy, shutdown.
//!
//! ```text
//! pop ──► do_work ──► ok ───────────────────────────┐
//!            │                                      ▼
//!            ├─ cancelled ──────────────────► nodes left? ── yes ──► requeue (lock kept)
//!            │                                      │ no
//!            └─ error ── err_cnt += 1               ▼
//!                 ├─ retryable, under cap ──► backoff ──► nodes left? ...
//!                 └─ terminal or cap hit ──► mail + error sidecar ──► unlock
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::job::{Job, JobContext};
use crate::keys::error_key;
use crate::notify::failure_notification;

use super::types::JobOutcome;
use super::{SyncEngine, DETACHED_TIMEOUT};

/// Queue argument selecting the default queue plus every computation queue.
pub const ALL_QUEUES: &str = "ALL";

impl SyncEngine {
    /// Pop one job from `queue` and carry it to its outcome.
    ///
    /// Returns `None` when the queue was empty or the payload was malformed.
    pub async fn process_one(&self, queue: &str) -> Result<Option<JobOutcome>> {
        let Some(mut job) = self.queue.pop_job(queue).await? else {
            return Ok(None);
        };
        info!(persistent_id = %job.persistent_id, plugin = %job.plugin, err_cnt = job.err_cnt, "Job started");
        let res = self.do_work(&mut job).await;
        Ok(Some(self.settle(job, res).await))
    }

    async fn settle(&self, mut job: Job, res: Result<()>) -> JobOutcome {
        let pid = job.persistent_id.clone();
        let mut failed = false;
        match res {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => {
                info!(persistent_id = %pid, remaining = job.writable_nodes.len(), "Job interrupted by shutdown");
            }
            Err(e) => {
                job.err_cnt += 1;
                crate::metrics::record_job_error(e.kind());
                if !e.is_retryable() || job.err_cnt >= self.config.max_errors {
                    error!(persistent_id = %pid, err_cnt = job.err_cnt, error = %e, "Job failed and will not be retried");
                    self.report_failure(&job, &e).await;
                    failed = true;
                } else {
                    warn!(persistent_id = %pid, err_cnt = job.err_cnt, error = %e, "Job failed, but will retry");
                    self.back_off(job.err_cnt).await;
                }
            }
        }

        let outcome = if failed {
            JobOutcome::Failed
        } else if job.writable_nodes.is_empty() {
            JobOutcome::Finished
        } else {
            match self.queue.requeue(&job).await {
                Ok(()) => {
                    crate::metrics::record_job_outcome(JobOutcome::Requeued.as_str());
                    return JobOutcome::Requeued;
                }
                Err(e) => {
                    error!(persistent_id = %pid, error = %e, "Re-adding job failed (no retry)");
                    JobOutcome::Failed
                }
            }
        };

        if let Err(e) = self.queue.unlock(&pid).await {
            warn!(persistent_id = %pid, error = %e, "Failed to release dataset lock");
        }
        info!(persistent_id = %pid, outcome = %outcome, "Job ended");
        crate::metrics::record_job_outcome(outcome.as_str());
        outcome
    }

    async fn back_off(&self, err_cnt: u32) {
        let delay = self.backoff.delay(err_cnt);
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Leave the error for pollers and mail the user.
    async fn report_failure(&self, job: &Job, err: &SyncError) {
        let pid = &job.persistent_id;
        let ctx = JobContext::detached(DETACHED_TIMEOUT);
        let message = err.to_string();
        if let Err(e) = ctx
            .guard(async {
                self.store
                    .set(&error_key(pid), &message, Some(self.config.error_ttl()))
                    .await
                    .map_err(SyncError::from)
            })
            .await
        {
            warn!(persistent_id = %pid, error = %e, "Failed to store job error");
        }

        let to = match ctx.guard(self.destination.get_user_email(&job.dataverse_key, &job.user)).await {
            Ok(to) => to,
            Err(e) => {
                warn!(persistent_id = %pid, error = %e, "Sending failure mail failed");
                return;
            }
        };
        let url = self.destination.get_repo_url(pid, true);
        let notification = failure_notification(&self.config.mail, &to, pid, &url, &message);
        if let Err(e) = ctx.guard(self.notifier.send(notification)).await {
            warn!(persistent_id = %pid, error = %e, "Sending failure mail failed");
        }
    }

    /// Work `queue` until shutdown.
    pub async fn process_jobs(&self, queue: &str) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.process_one(queue).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(queue, error = %e, "Failed to pop job"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        debug!(queue, "Worker exited gracefully");
    }

    /// Spawn `count` workers on `queue`, or on every queue for [`ALL_QUEUES`].
    ///
    /// Start times are staggered when more than one worker is spawned.
    pub fn spin_workers(self: &Arc<Self>, count: usize, queue: &str) {
        let queues: Vec<String> = if queue == ALL_QUEUES {
            std::iter::once(String::new())
                .chain(self.config.computation_queues.iter().map(|q| q.value.clone()))
                .collect()
        } else {
            vec![queue.to_string()]
        };
        let stagger_max = self.config.worker_stagger_max_ms;
        let mut rng = rand::thread_rng();

        for _ in 0..count {
            let stagger = if count > 1 && stagger_max > 0 {
                Duration::from_millis(rng.gen_range(0..stagger_max))
            } else {
                Duration::ZERO
            };
            for q in &queues {
                let engine = Arc::clone(self);
                let q = q.clone();
                self.workers.spawn(async move {
                    tokio::select! {
                        _ = engine.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(stagger) => {}
                    }
                    engine.process_jobs(&q).await;
                });
            }
        }
        crate::metrics::set_active_workers(self.workers.len());
        info!(workers = count, queues = queues.len(), "Workers ready");
    }

    /// Stop every worker and wait for in-flight jobs and cleanup tasks.
    ///
    /// Running jobs see their context cancelled, flush what they uploaded
    /// and requeue the remainder.
    pub async fn shutdown(&self) {
        info!("Shutting down workers");
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;
        self.background.close();
        self.background.wait().await;
        crate::metrics::set_active_workers(0);
        info!("Shutdown complete");
    }

    /// Wait for pending tombstone cleanups without stopping the engine.
    pub async fn drain_background_tasks(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}
