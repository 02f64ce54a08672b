//! Files on a mounted filesystem: `<url>/<node id>`.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{ContentStream, StreamProvider, Streams};
use crate::blob::BoxedReader;
use crate::error::{Result, SyncError};
use crate::job::StreamParams;
use crate::tree::NodeMap;

pub struct LocalStreamProvider;

struct LocalFile {
    path: PathBuf,
}

#[async_trait]
impl ContentStream for LocalFile {
    async fn open(&mut self) -> Result<BoxedReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl StreamProvider for LocalStreamProvider {
    async fn streams(&self, nodes: &NodeMap, params: &StreamParams) -> Result<Streams> {
        if params.url.is_empty() {
            return Err(SyncError::Config("local streams: missing parameter url".into()));
        }
        let base = PathBuf::from(params.url.trim_end_matches('/'));
        let mut streams = Streams::default();
        for (key, node) in nodes {
            let file = LocalFile { path: base.join(&node.id) };
            streams.streams.insert(key.clone(), Box::new(file));
        }
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reads_relative_to_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();

        let mut nodes = NodeMap::new();
        nodes.insert("sub/a.txt".into(), Node::file("sub/a.txt"));
        let params = StreamParams {
            url: format!("{}/", dir.path().display()),
            ..Default::default()
        };
        let mut streams = LocalStreamProvider.streams(&nodes, &params).await.unwrap();
        let mut out = String::new();
        streams
            .take("sub/a.txt")
            .unwrap()
            .open()
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_missing_url() {
        let nodes = NodeMap::new();
        let res = LocalStreamProvider.streams(&nodes, &StreamParams::default()).await;
        assert!(matches!(res, Err(SyncError::Config(_))));
    }
}
