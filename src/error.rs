// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the sync engine.
//!
//! Every fallible operation in the crate returns [`SyncError`]. The worker
//! loop uses [`SyncError::is_retryable`] to decide between backoff-and-requeue
//! and immediate termination with a failure notification.

use thiserror::Error;

use crate::storage::traits::StorageError;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The dataset lock is held by another job.
    #[error("Job for dataset '{0}' is already in progress")]
    AlreadyInProgress(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Downloaded file hash not equal for '{id}': expected {expected}, got {actual}")]
    HashMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Hash type not supported: {0}")]
    UnsupportedHashType(String),

    #[error("Storage driver not supported: {0}")]
    UnsupportedDriver(String),

    #[error("Invalid persistent id: {0}")]
    InvalidPersistentId(String),

    #[error("Dataset persistent id is empty")]
    MissingPersistentId,

    #[error("No stream found for '{0}'")]
    MissingStream(String),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Destination error: {0}")]
    Destination(String),

    /// Batch finalize stopped part-way; `confirmed` node ids were registered.
    #[error("Finalize failed after {} confirmed nodes: {reason}", confirmed.len())]
    PartialFinalize {
        confirmed: Vec<String>,
        reason: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job deadline exceeded")]
    DeadlineExceeded,

    #[error("Job cancelled by shutdown")]
    Cancelled,

    #[error("Compute failed: {0}")]
    Compute(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the worker should back off and requeue the job.
    ///
    /// Authorization and verification failures are terminal: repeating the
    /// same job cannot fix them. Cancellation is retryable but does not
    /// count against the error cap (see [`SyncError::is_cancellation`]).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Destination(_)
                | SyncError::PartialFinalize { .. }
                | SyncError::Storage(_)
                | SyncError::Io(_)
                | SyncError::ObjectStore(_)
                | SyncError::MissingStream(_)
                | SyncError::Compute(_)
                | SyncError::DeadlineExceeded
                | SyncError::Cancelled
        )
    }

    /// Shutdown interrupted the job; progress is kept and the job requeued.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::AlreadyInProgress(_) => "contention",
            SyncError::Unauthorized(_) => "authorization",
            SyncError::HashMismatch { .. } => "verification",
            SyncError::UnsupportedHashType(_)
            | SyncError::UnsupportedDriver(_)
            | SyncError::InvalidPersistentId(_)
            | SyncError::MissingPersistentId
            | SyncError::UnknownPlugin(_)
            | SyncError::Config(_) => "config",
            SyncError::Serialization(_) => "serialization",
            SyncError::DeadlineExceeded => "deadline",
            SyncError::Cancelled => "cancelled",
            SyncError::Destination(_)
            | SyncError::PartialFinalize { .. }
            | SyncError::Storage(_)
            | SyncError::Io(_)
            | SyncError::ObjectStore(_)
            | SyncError::MissingStream(_)
            | SyncError::Compute(_) => "transient",
        }
    }
}
