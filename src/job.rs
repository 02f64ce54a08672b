// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Jobs: the unit of work carried by the durable queue.
//!
//! A [`Job`] is serialized to JSON and pushed onto a named queue. The payload
//! carries an explicit `SchemaVersion` so workers of a newer build keep
//! reading jobs queued by an older one during a rolling deploy: unknown
//! fields are ignored and missing ones take their defaults.
//!
//! [`JobContext`] is the cancellation scope of one job attempt. It is torn
//! down either by the job's absolute deadline or by the process-wide
//! shutdown token, whichever fires first.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::tree::NodeMap;

/// Current job payload schema.
pub const JOB_SCHEMA_VERSION: u32 = 1;

pub const HASH_ONLY_PLUGIN: &str = "hash-only";
pub const COMPUTE_PLUGIN: &str = "compute";
pub const DDI_CDI_PLUGIN: &str = "ddi-cdi";

fn current_schema_version() -> u32 {
    JOB_SCHEMA_VERSION
}

/// Source-specific connection parameters, opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamParams {
    pub plugin_id: String,
    pub repo_name: String,
    pub url: String,
    pub option: String,
    pub user: String,
    pub token: String,
    pub dv_token: String,
    pub persistent_id: String,
    /// Anything a stream provider needs beyond the common fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    /// Destination credential.
    pub dataverse_key: String,
    pub user: String,
    pub session_id: String,
    /// Dataset identity: lock and partition key.
    pub persistent_id: String,
    /// Remaining work; shrinks as nodes complete.
    pub writable_nodes: NodeMap,
    pub plugin: String,
    pub stream_params: StreamParams,
    pub err_cnt: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub send_email_on_success: bool,
    /// Correlation key for a cached result.
    pub key: String,
    /// Named sub-queue; empty for the default queue.
    pub queue: String,
}

/// How the worker dispatches a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind<'a> {
    HashOnly,
    Compute(&'a str),
    Stream(&'a str),
}

impl Job {
    #[must_use]
    pub fn new(persistent_id: impl Into<String>, plugin: impl Into<String>, writable_nodes: NodeMap) -> Self {
        Self {
            schema_version: JOB_SCHEMA_VERSION,
            persistent_id: persistent_id.into(),
            plugin: plugin.into(),
            writable_nodes,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn kind(&self) -> JobKind<'_> {
        match self.plugin.as_str() {
            HASH_ONLY_PLUGIN => JobKind::HashOnly,
            COMPUTE_PLUGIN | DDI_CDI_PLUGIN => JobKind::Compute(&self.plugin),
            other => JobKind::Stream(other),
        }
    }

    /// Serialize for the queue, stamping the current schema version.
    pub fn to_payload(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        value["SchemaVersion"] = Value::from(JOB_SCHEMA_VERSION);
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        let job: Job = serde_json::from_str(payload)?;
        if job.schema_version > JOB_SCHEMA_VERSION {
            warn!(
                persistent_id = %job.persistent_id,
                schema_version = job.schema_version,
                supported = JOB_SCHEMA_VERSION,
                "Job payload has a newer schema; unknown fields are ignored"
            );
        }
        Ok(job)
    }
}

/// Cancellation scope for one job attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl JobContext {
    /// Child of `shutdown`, bounded by the job's wall-clock deadline.
    #[must_use]
    pub fn new(shutdown: &CancellationToken, deadline: Option<DateTime<Utc>>) -> Self {
        let deadline = deadline.map(|d| {
            let remaining = (d - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Instant::now() + remaining
        });
        Self {
            token: shutdown.child_token(),
            deadline,
        }
    }

    /// Scope that only ends after `timeout`, independent of shutdown.
    ///
    /// Used for cleanup calls (flush, delete) that must still run after the
    /// job context has been torn down.
    #[must_use]
    pub fn detached(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Error if the scope has ended.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(SyncError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run `fut` until it completes or the scope ends, whichever is first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SyncError::Cancelled),
            _ = deadline => Err(SyncError::DeadlineExceeded),
            res = fut => res,
        }
    }
}
