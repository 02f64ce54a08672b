//! # Dataset Sync
//!
//! A job-based engine that keeps datasets in a destination repository in
//! line with an external source (a git forge, a cloud drive, a local
//! directory).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Compare                             │
//! │  • Destination listing merged with source listing          │
//! │  • Hashes resolved via known-hash cache and tombstones     │
//! │  • Missing hashes scheduled as background hash-only jobs   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     add_job (dataset lock)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Durable Queue (Redis lists)                │
//! │  • One lock per dataset, hard TTL ceiling                  │
//! │  • Requeue keeps the lock while nodes remain               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                         worker pops
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Persistence                          │
//! │  • Single-pass streaming with concurrent hashing           │
//! │  • Streamed or direct upload with batch finalize           │
//! │  • Rollback of unconfirmed nodes, bounded retries          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dataset_sync::{FsDestination, FsDestinationOptions, SyncConfig, SyncEngine};
//! use dataset_sync::streams::{LocalStreamProvider, LOCAL_PLUGIN};
//!
//! #[tokio::main]
//! async fn main() -> dataset_sync::Result<()> {
//!     let destination = FsDestination::open("/srv/dest", FsDestinationOptions::default()).await?;
//!     let engine = Arc::new(
//!         SyncEngine::builder(SyncConfig::from_env()?)
//!             .destination(Arc::new(destination))
//!             .plugin(LOCAL_PLUGIN, Arc::new(LocalStreamProvider))
//!             .build()?,
//!     );
//!     engine.spin_workers(4, dataset_sync::ALL_QUEUES);
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncEngine`]: compare, persist, workers
//! - [`queue`]: durable job queue and dataset lock
//! - [`hashing`]: hash engine and tee reader
//! - [`destination`]: destination abstraction and filesystem implementation
//! - [`streams`]: content stream providers per source plugin
//! - [`storage`]: key-value stores (Redis, memory)
//! - [`resilience`]: retry and backoff policies

pub mod blob;
pub mod compute;
pub mod config;
pub mod coordinator;
pub mod destination;
pub mod error;
pub mod hashing;
pub mod job;
pub mod keys;
pub mod known_hashes;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod resilience;
pub mod storage;
pub mod streams;
pub mod tombstone;
pub mod tree;

pub use config::SyncConfig;
pub use coordinator::{
    classify, merge_node_maps, CachedComputeResponse, CachedResponse, CompareResponse, DatasetStatus, JobOutcome,
    SyncEngine, SyncEngineBuilder, ALL_QUEUES,
};
pub use destination::{Destination, FsDestination, FsDestinationOptions, OverWireUpload};
pub use error::{Result, SyncError};
pub use job::{Job, JobContext, StreamParams};
pub use known_hashes::CalculatedHashes;
pub use metrics::LatencyTimer;
pub use resilience::retry::{BackoffPolicy, FixedBackoff};
pub use storage::traits::{KeyValueStore, StorageError};
pub use tree::{Node, NodeAction, NodeMap, NodeStatus};
