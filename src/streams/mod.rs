//! Content stream providers.
//!
//! A write job names its source through [`crate::Job::plugin`]; the
//! [`PluginRegistry`] maps that name to a [`StreamProvider`], which hands
//! back one lazily opened [`ContentStream`] per node plus an optional cleanup
//! callback run once the job is done with them.

mod local;
mod memory;

pub use local::LocalStreamProvider;
pub use memory::MemoryStreamProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::blob::BoxedReader;
use crate::error::{Result, SyncError};
use crate::job::StreamParams;
use crate::tree::NodeMap;

/// Plugin name of [`LocalStreamProvider`].
pub const LOCAL_PLUGIN: &str = "local";

/// Readable content of one node, opened on demand.
#[async_trait]
pub trait ContentStream: Send {
    async fn open(&mut self) -> Result<BoxedReader>;
}

pub type Cleanup = Box<dyn FnOnce() -> Result<()> + Send>;

/// Streams for one job, keyed by node id.
#[derive(Default)]
pub struct Streams {
    pub streams: HashMap<String, Box<dyn ContentStream>>,
    pub cleanup: Option<Cleanup>,
}

impl Streams {
    /// Take the stream for `node_id`; each stream is consumed once.
    pub fn take(&mut self, node_id: &str) -> Result<Box<dyn ContentStream>> {
        self.streams
            .remove(node_id)
            .ok_or_else(|| SyncError::MissingStream(node_id.to_string()))
    }

    /// Run the cleanup callback, if any.
    pub fn cleanup(&mut self) -> Result<()> {
        match self.cleanup.take() {
            Some(cleanup) => cleanup(),
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait StreamProvider: Send + Sync {
    async fn streams(&self, nodes: &NodeMap, params: &StreamParams) -> Result<Streams>;
}

#[derive(Default, Clone)]
pub struct PluginRegistry {
    providers: HashMap<String, Arc<dyn StreamProvider>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn StreamProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StreamProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPlugin(name.to_string()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
