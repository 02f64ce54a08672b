// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] is the dependency-injected context that ties together
//! every component:
//! - the shared key-value store (queue, lock, known hashes, tombstones)
//! - the [`Destination`] being written to
//! - stream providers per source plugin
//! - blob stores for direct uploads
//! - notifier, compute runner and backoff policy
//!
//! # Job flow
//!
//! ```text
//! add_job ──► queue ──► worker pops ──┬─ hash-only ──► rehash
//!                                     ├─ compute   ──► run script in workspace
//!                                     └─ <plugin>  ──► filter ──► persist ──► flush
//!                                                                   │
//!                      requeue (lock kept) ◄── error, nodes left ◄──┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dataset_sync::{FsDestination, FsDestinationOptions, SyncConfig, SyncEngine};
//!
//! # #[tokio::main]
//! # async fn main() -> dataset_sync::Result<()> {
//! let destination = FsDestination::open("/tmp/dest", FsDestinationOptions::default()).await?;
//! let engine = Arc::new(
//!     SyncEngine::builder(SyncConfig::default())
//!         .destination(Arc::new(destination))
//!         .build()?,
//! );
//! engine.spin_workers(4, "ALL");
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod compare;
mod compute;
mod flush;
mod lifecycle;
mod persist;
mod rehash;
mod types;

pub use compare::{classify, merge_node_maps};
pub use lifecycle::ALL_QUEUES;
pub use types::{CachedComputeResponse, CachedResponse, CompareResponse, DatasetStatus, JobOutcome};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::blob::{BlobStore, FileBlobStore, S3BlobStore, FILE_DRIVER, S3_DRIVER};
use crate::compute::{ComputeRunner, ShellComputeRunner};
use crate::config::SyncConfig;
use crate::destination::Destination;
use crate::error::{Result, SyncError};
use crate::job::Job;
use crate::known_hashes::{KnownHashStore, KnownHashes};
use crate::notify::{LogNotifier, Notifier};
use crate::queue::JobQueue;
use crate::resilience::retry::BackoffPolicy;
use crate::storage::memory::InMemoryStore;
use crate::storage::traits::KeyValueStore;
use crate::streams::{PluginRegistry, StreamProvider};
use crate::tombstone::Tombstones;

/// Timeout for calls that must outlive a torn-down job context
/// (finalize, delete, known-hash persist, notifications).
pub(crate) const DETACHED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Main sync engine.
///
/// `Send + Sync`; share it as `Arc<SyncEngine>` between request handlers
/// and workers. Every piece of mutable state lives in the key-value store,
/// serialized per dataset by the dataset lock.
pub struct SyncEngine {
    pub(super) config: Arc<SyncConfig>,
    pub(super) store: Arc<dyn KeyValueStore>,
    pub(super) queue: JobQueue,
    pub(super) known_hashes: KnownHashStore,
    pub(super) tombstones: Tombstones,
    pub(super) destination: Arc<dyn Destination>,
    pub(super) plugins: PluginRegistry,
    /// Keyed by storage driver (`file`, `s3`, ...)
    pub(super) blob_stores: HashMap<String, Arc<dyn BlobStore>>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) compute: Arc<dyn ComputeRunner>,
    pub(super) backoff: Arc<dyn BackoffPolicy>,
    /// Post-run cleanup tasks
    pub(super) background: TaskTracker,
    pub(super) workers: TaskTracker,
    pub(super) shutdown: CancellationToken,
}

impl SyncEngine {
    #[must_use]
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    #[must_use]
    pub fn known_hashes(&self) -> &KnownHashStore {
        &self.known_hashes
    }

    #[must_use]
    pub fn tombstones(&self) -> &Tombstones {
        &self.tombstones
    }

    #[must_use]
    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    /// Process-wide stop signal; cancelling it tears down every job context.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Lock the dataset and enqueue `job`. See [`JobQueue::add_job`].
    pub async fn add_job(&self, job: &mut Job) -> Result<()> {
        self.queue.add_job(job).await
    }

    pub async fn is_locked(&self, persistent_id: &str) -> Result<bool> {
        self.queue.is_locked(persistent_id).await
    }

    pub(super) fn blob_store(&self, driver: &str) -> Result<Arc<dyn BlobStore>> {
        self.blob_stores
            .get(driver)
            .cloned()
            .ok_or_else(|| SyncError::UnsupportedDriver(driver.to_string()))
    }

    /// Persist the known-hash table outside the job scope, so an aborted
    /// run still keeps what it learned.
    pub(super) async fn save_known_hashes(&self, persistent_id: &str, known: &KnownHashes) -> Result<()> {
        let ctx = crate::job::JobContext::detached(DETACHED_TIMEOUT);
        ctx.guard(self.known_hashes.save(persistent_id, known)).await
    }

    /// Mark a node; marker failures are logged, never fatal.
    pub(super) async fn mark_tombstone(
        &self,
        persistent_id: &str,
        node_id: &str,
        tombstone: crate::tombstone::Tombstone,
        written_keys: &mut Vec<String>,
    ) {
        match self.tombstones.mark(persistent_id, node_id, tombstone).await {
            Ok(key) => written_keys.push(key),
            Err(e) => warn!(persistent_id, node_id, error = %e, "Failed to mark {tombstone} tombstone"),
        }
    }
}

/// Builder for [`SyncEngine`]. Only the destination is required.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    destination: Option<Arc<dyn Destination>>,
    plugins: PluginRegistry,
    blob_stores: HashMap<String, Arc<dyn BlobStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    compute: Option<Arc<dyn ComputeRunner>>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
}

impl SyncEngineBuilder {
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            store: None,
            destination: None,
            plugins: PluginRegistry::new(),
            blob_stores: HashMap::new(),
            notifier: None,
            compute: None,
            backoff: None,
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destination = Some(destination);
        self
    }

    #[must_use]
    pub fn plugin(mut self, name: impl Into<String>, provider: Arc<dyn StreamProvider>) -> Self {
        self.plugins.register(name, provider);
        self
    }

    #[must_use]
    pub fn blob_store(mut self, driver: impl Into<String>, store: Arc<dyn BlobStore>) -> Self {
        self.blob_stores.insert(driver.into(), store);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn compute_runner(mut self, runner: Arc<dyn ComputeRunner>) -> Self {
        self.compute = Some(runner);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;
        let destination = self
            .destination
            .ok_or_else(|| SyncError::Config("a destination is required".into()))?;
        let store = self.store.unwrap_or_else(|| {
            debug!("No key-value store given, using the in-memory store");
            Arc::new(InMemoryStore::new())
        });

        let mut blob_stores = self.blob_stores;
        if let Some(dir) = self.config.storage.path_to_files_dir.as_deref() {
            blob_stores
                .entry(FILE_DRIVER.to_string())
                .or_insert_with(|| Arc::new(FileBlobStore::new(Path::new(dir))));
        }
        if self.config.storage.default_driver == S3_DRIVER && !blob_stores.contains_key(S3_DRIVER) {
            let s3 = S3BlobStore::new(self.config.storage.s3.clone())?;
            blob_stores.insert(S3_DRIVER.to_string(), Arc::new(s3));
        }
        if destination.is_direct_upload() && !blob_stores.contains_key(&self.config.storage.default_driver) {
            warn!(
                driver = %self.config.storage.default_driver,
                "Direct upload destination without a blob store for the default driver"
            );
        }

        let config = Arc::new(self.config);
        Ok(SyncEngine {
            queue: JobQueue::new(store.clone(), config.lock_max_duration()),
            known_hashes: KnownHashStore::new(store.clone()),
            tombstones: Tombstones::new(store.clone(), config.tombstone_ttl()),
            store,
            destination,
            plugins: self.plugins,
            blob_stores,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            compute: self
                .compute
                .unwrap_or_else(|| Arc::new(ShellComputeRunner::new(config.compute_command.clone()))),
            backoff: self.backoff.unwrap_or_else(|| config.backoff.build()),
            background: TaskTracker::new(),
            workers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{FsDestination, FsDestinationOptions};

    #[tokio::test]
    async fn test_build_requires_destination() {
        let res = SyncEngine::builder(SyncConfig::default()).build();
        assert!(matches!(res, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_registers_file_blob_store() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FsDestination::open(dir.path().join("dest"), FsDestinationOptions::default())
            .await
            .unwrap();
        let mut config = SyncConfig::default();
        config.storage.path_to_files_dir = Some(dir.path().join("files").display().to_string());
        let engine = SyncEngine::builder(config).destination(Arc::new(dest)).build().unwrap();
        assert!(engine.blob_store(FILE_DRIVER).is_ok());
        assert!(matches!(engine.blob_store("s3"), Err(SyncError::UnsupportedDriver(_))));
    }

    #[tokio::test]
    async fn test_build_registers_s3_blob_store_for_s3_driver() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FsDestination::open(dir.path().join("dest"), FsDestinationOptions::default())
            .await
            .unwrap();
        let mut config = SyncConfig::default();
        config.storage.default_driver = S3_DRIVER.into();
        config.storage.s3.bucket = "dataverse".into();
        config.storage.s3.region = "us-east-1".into();
        config.storage.s3.endpoint = "http://minio:9000".into();
        config.storage.s3.path_style = true;
        let engine = SyncEngine::builder(config).destination(Arc::new(dest)).build().unwrap();
        assert!(engine.blob_store(S3_DRIVER).is_ok());

        let dest = FsDestination::open(dir.path().join("dest2"), FsDestinationOptions::default())
            .await
            .unwrap();
        let mut config = SyncConfig::default();
        config.storage.default_driver = S3_DRIVER.into();
        let res = SyncEngine::builder(config).destination(Arc::new(dest)).build();
        assert!(matches!(res, Err(SyncError::Config(_))));
    }
}
