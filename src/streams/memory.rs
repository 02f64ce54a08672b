//! In-memory content, for tests and embedding.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ContentStream, StreamProvider, Streams};
use crate::blob::BoxedReader;
use crate::error::Result;
use crate::job::StreamParams;
use crate::tree::NodeMap;

/// Serves registered byte buffers by node id. Nodes without content get no
/// stream, so the persistence engine reports them as missing.
#[derive(Default, Clone)]
pub struct MemoryStreamProvider {
    files: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryStreamProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node_id: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.write().insert(node_id.into(), Arc::new(content.into()));
    }

    pub fn remove(&self, node_id: &str) {
        self.files.write().remove(node_id);
    }
}

struct MemoryContent(Arc<Vec<u8>>);

#[async_trait]
impl ContentStream for MemoryContent {
    async fn open(&mut self) -> Result<BoxedReader> {
        Ok(Box::new(Cursor::new(self.0.as_ref().clone())))
    }
}

#[async_trait]
impl StreamProvider for MemoryStreamProvider {
    async fn streams(&self, nodes: &NodeMap, _params: &StreamParams) -> Result<Streams> {
        let files = self.files.read();
        let mut streams = Streams::default();
        for key in nodes.keys() {
            if let Some(content) = files.get(key) {
                streams.streams.insert(key.clone(), Box::new(MemoryContent(content.clone())));
            }
        }
        Ok(streams)
    }
}
