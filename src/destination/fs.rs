//! Filesystem-backed destination.
//!
//! Keeps a JSON index (`index.json`) of every dataset's registered files and
//! stores streamed content under `.blobs/`. Directly uploaded files are
//! registered with the storage identifier and checksum the caller supplies;
//! their content lives in the engine's blob store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Destination, OverWireUpload};
use crate::blob::BoxedReader;
use crate::error::{Result, SyncError};
use crate::hashing::{get_hasher, HashingReader};
use crate::tree::{Node, NodeMap};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = ".blobs";
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FsDestinationOptions {
    pub direct_upload: bool,
    /// Required API token; any token is accepted when `None`.
    pub token: Option<String>,
    /// Hash type the destination records for streamed files.
    pub hash_type: String,
    pub base_url: String,
    pub email_domain: String,
}

impl Default for FsDestinationOptions {
    fn default() -> Self {
        Self {
            direct_upload: false,
            token: None,
            hash_type: "MD5".to_string(),
            base_url: "http://localhost:8080".to_string(),
            email_domain: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileRecord {
    id: i64,
    file_size: i64,
    hash: String,
    hash_type: String,
    storage_identifier: String,
    /// Blob name under `.blobs`; empty for directly uploaded files.
    blob: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Index {
    next_id: i64,
    /// persistent id → node id → record
    datasets: BTreeMap<String, BTreeMap<String, FileRecord>>,
}

impl Index {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Remove the record with `file_id` from any dataset.
    fn take(&mut self, file_id: i64) -> Option<FileRecord> {
        for files in self.datasets.values_mut() {
            let found = files
                .iter()
                .find(|(_, r)| r.id == file_id)
                .map(|(node_id, _)| node_id.clone());
            if let Some(node_id) = found {
                return files.remove(&node_id);
            }
        }
        None
    }

    fn find(&self, file_id: i64) -> Option<&FileRecord> {
        self.datasets
            .values()
            .flat_map(|files| files.values())
            .find(|r| r.id == file_id)
    }
}

struct Inner {
    root: PathBuf,
    options: FsDestinationOptions,
    index: Mutex<Index>,
}

impl Inner {
    fn blob_path(&self, blob: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(blob)
    }

    async fn persist(&self, index: &Index) -> Result<()> {
        let raw = serde_json::to_vec_pretty(index)?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }

    async fn remove_blob(&self, record: &FileRecord) {
        if record.blob.is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(self.blob_path(&record.blob)).await {
            debug!(blob = %record.blob, error = %e, "Blob already gone");
        }
    }

    /// Drain `pipe` into a new blob and, once the sender commits, register
    /// it for `node_id`.
    async fn receive(
        self: Arc<Self>,
        pipe: DuplexStream,
        commit: oneshot::Receiver<()>,
        persistent_id: String,
        node_id: String,
        replaces: i64,
    ) -> Result<()> {
        let blob = Uuid::new_v4().simple().to_string();
        let hasher = get_hasher(&self.options.hash_type, 0)?;
        let mut reader = HashingReader::new(pipe, vec![hasher]);
        let path = self.blob_path(&blob);
        let mut file = tokio::fs::File::create(&path).await?;
        let received = async {
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(e) = received {
            discard(&path).await;
            return Err(e.into());
        }
        if commit.await.is_err() {
            discard(&path).await;
            debug!(persistent_id, node_id, "Streamed upload aborted, nothing registered");
            return Ok(());
        }

        let hash = reader.hex_sums().into_iter().next().unwrap_or_default();
        let file_size = i64::try_from(reader.bytes_read()).unwrap_or(i64::MAX);

        let mut index = self.index.lock().await;
        let replaced = if replaces != 0 { index.take(replaces) } else { None };
        let id = index.allocate_id();
        index.datasets.entry(persistent_id.clone()).or_default().insert(
            node_id.clone(),
            FileRecord {
                id,
                file_size,
                hash,
                hash_type: self.options.hash_type.clone(),
                storage_identifier: format!("local://{blob}"),
                blob,
            },
        );
        self.persist(&index).await?;
        drop(index);

        if let Some(old) = replaced {
            self.remove_blob(&old).await;
        }
        debug!(persistent_id, node_id, id, "Streamed file registered");
        Ok(())
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Partial blob already gone");
    }
}

/// Reference [`Destination`] over a local directory.
#[derive(Clone)]
pub struct FsDestination {
    inner: Arc<Inner>,
}

impl FsDestination {
    /// Open (or create) a destination rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, options: FsDestinationOptions) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(BLOB_DIR)).await?;
        let index = match tokio::fs::read(root.join(INDEX_FILE)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Index::default(),
            Err(e) => return Err(e.into()),
        };
        info!(root = %root.display(), direct_upload = options.direct_upload, "Filesystem destination opened");
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                options,
                index: Mutex::new(index),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn authorize(&self, token: &str) -> Result<()> {
        match &self.inner.options.token {
            Some(expected) if expected != token => Err(SyncError::Unauthorized("invalid API token".into())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Destination for FsDestination {
    fn is_direct_upload(&self) -> bool {
        self.inner.options.direct_upload
    }

    async fn check_permission(&self, token: &str, _user: &str, persistent_id: &str) -> Result<()> {
        if persistent_id.is_empty() {
            return Err(SyncError::MissingPersistentId);
        }
        self.authorize(token)
    }

    async fn query(&self, persistent_id: &str, token: &str, _user: &str) -> Result<NodeMap> {
        self.authorize(token)?;
        let index = self.inner.index.lock().await;
        let Some(files) = index.datasets.get(persistent_id) else {
            return Ok(NodeMap::new());
        };
        Ok(files
            .iter()
            .map(|(node_id, r)| {
                let mut node = Node::file(node_id.as_str())
                    .with_destination(r.hash.as_str(), r.hash_type.as_str())
                    .with_destination_id(r.id);
                node.attributes.destination_file.file_size = r.file_size;
                node.attributes.destination_file.storage_identifier = r.storage_identifier.clone();
                (node_id.clone(), node)
            })
            .collect())
    }

    async fn get_stream(&self, token: &str, _user: &str, file_id: i64) -> Result<BoxedReader> {
        self.authorize(token)?;
        let blob = {
            let index = self.inner.index.lock().await;
            let record = index
                .find(file_id)
                .ok_or_else(|| SyncError::Destination(format!("file {file_id} not found")))?;
            if record.blob.is_empty() {
                return Err(SyncError::Destination(format!(
                    "file {file_id} was uploaded directly and has no streamed content"
                )));
            }
            record.blob.clone()
        };
        let file = tokio::fs::File::open(self.inner.blob_path(&blob)).await?;
        Ok(Box::new(file))
    }

    async fn write_over_wire(
        &self,
        dest_file_id: i64,
        node_id: &str,
        token: &str,
        _user: &str,
        persistent_id: &str,
    ) -> Result<OverWireUpload> {
        self.authorize(token)?;
        let (writer, pipe) = tokio::io::duplex(PIPE_CAPACITY);
        let (commit, committed) = oneshot::channel();
        let completion = tokio::spawn(self.inner.clone().receive(
            pipe,
            committed,
            persistent_id.to_string(),
            node_id.to_string(),
            dest_file_id,
        ));
        Ok(OverWireUpload {
            writer: Box::new(writer),
            commit,
            completion,
        })
    }

    async fn save_after_direct_upload(
        &self,
        replace: bool,
        token: &str,
        _user: &str,
        persistent_id: &str,
        storage_identifiers: &[String],
        nodes: &[Node],
    ) -> Result<()> {
        self.authorize(token)?;
        if storage_identifiers.len() != nodes.len() {
            return Err(SyncError::Destination(format!(
                "{} storage identifiers for {} files",
                storage_identifiers.len(),
                nodes.len()
            )));
        }
        let mut index = self.inner.index.lock().await;
        if replace {
            if let Some(node) = nodes.iter().find(|n| index.find(n.attributes.destination_file.id).is_none()) {
                return Err(SyncError::Destination(format!(
                    "cannot replace '{}': file {} not found",
                    node.id, node.attributes.destination_file.id
                )));
            }
        }
        let mut replaced = Vec::new();
        for (sid, node) in storage_identifiers.iter().zip(nodes) {
            let dest = &node.attributes.destination_file;
            if replace {
                replaced.extend(index.take(dest.id));
            }
            let id = index.allocate_id();
            index.datasets.entry(persistent_id.to_string()).or_default().insert(
                node.id.clone(),
                FileRecord {
                    id,
                    file_size: dest.file_size,
                    hash: dest.hash.clone(),
                    hash_type: dest.hash_type.clone(),
                    storage_identifier: sid.clone(),
                    blob: String::new(),
                },
            );
        }
        self.inner.persist(&index).await?;
        drop(index);
        for old in &replaced {
            self.inner.remove_blob(old).await;
        }
        debug!(persistent_id, replace, files = nodes.len(), "Direct uploads registered");
        Ok(())
    }

    async fn delete_file(&self, token: &str, _user: &str, file_id: i64) -> Result<()> {
        self.authorize(token)?;
        let mut index = self.inner.index.lock().await;
        let record = index
            .take(file_id)
            .ok_or_else(|| SyncError::Destination(format!("file {file_id} not found")))?;
        self.inner.persist(&index).await?;
        drop(index);
        self.inner.remove_blob(&record).await;
        Ok(())
    }

    async fn get_user_email(&self, token: &str, user: &str) -> Result<String> {
        self.authorize(token)?;
        let name = if user.is_empty() { "dataverseAdmin" } else { user };
        Ok(format!("{name}@{}", self.inner.options.email_domain))
    }

    fn get_repo_url(&self, persistent_id: &str, draft: bool) -> String {
        let mut url = format!(
            "{}/dataset.xhtml?persistentId={persistent_id}",
            self.inner.options.base_url.trim_end_matches('/')
        );
        if draft {
            url.push_str("&version=DRAFT");
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn upload(dest: &FsDestination, replaces: i64, node: &str, content: &[u8]) {
        let mut upload = dest.write_over_wire(replaces, node, "", "", "doi:1").await.unwrap();
        upload.writer.write_all(content).await.unwrap();
        upload.writer.shutdown().await.unwrap();
        upload.finish().await.unwrap();
    }

    fn blob_count(dest: &FsDestination) -> usize {
        std::fs::read_dir(dest.root().join(BLOB_DIR)).unwrap().count()
    }

    #[tokio::test]
    async fn test_aborted_upload_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FsDestination::open(dir.path(), FsDestinationOptions::default()).await.unwrap();

        let mut partial = dest.write_over_wire(0, "a.txt", "", "", "doi:1").await.unwrap();
        partial.writer.write_all(b"hel").await.unwrap();
        partial.abort().await.unwrap();

        assert!(dest.query("doi:1", "", "").await.unwrap().is_empty());
        assert_eq!(blob_count(&dest), 0);
    }

    #[tokio::test]
    async fn test_aborted_replace_keeps_the_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FsDestination::open(dir.path(), FsDestinationOptions::default()).await.unwrap();
        upload(&dest, 0, "a.txt", b"old").await;
        let old = dest.query("doi:1", "", "").await.unwrap()["a.txt"].attributes.destination_file.clone();

        let mut partial = dest.write_over_wire(old.id, "a.txt", "", "", "doi:1").await.unwrap();
        partial.writer.write_all(b"ne").await.unwrap();
        partial.abort().await.unwrap();

        let listing = dest.query("doi:1", "", "").await.unwrap();
        assert_eq!(listing["a.txt"].attributes.destination_file.id, old.id);
        assert_eq!(listing["a.txt"].attributes.destination_file.hash, old.hash);
        assert_eq!(blob_count(&dest), 1);
    }

    #[tokio::test]
    async fn test_streamed_write_is_listed_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FsDestination::open(dir.path(), FsDestinationOptions::default()).await.unwrap();
        upload(&dest, 0, "data/a.txt", b"abc").await;

        let listing = dest.query("doi:1", "", "").await.unwrap();
        let node = &listing["data/a.txt"];
        assert_eq!(node.name, "a.txt");
        assert_eq!(node.attributes.destination_file.hash, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(node.attributes.destination_file.hash_type, "MD5");
        assert_eq!(node.attributes.destination_file.file_size, 3);

        let mut out = Vec::new();
        dest.get_stream("", "", node.attributes.destination_file.id)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FsDestination::open(dir.path(), FsDestinationOptions::default()).await.unwrap();
        upload(&dest, 0, "a.txt", b"one").await;
        let first = dest.query("doi:1", "", "").await.unwrap()["a.txt"].attributes.destination_file.id;

        upload(&dest, first, "a.txt", b"two").await;
        let listing = dest.query("doi:1", "", "").await.unwrap();
        let second = listing["a.txt"].attributes.destination_file.id;
        assert_ne!(first, second);
        assert_eq!(listing.len(), 1);

        dest.delete_file("", "", second).await.unwrap();
        assert!(dest.query("doi:1", "", "").await.unwrap().is_empty());
        assert!(dest.delete_file("", "", second).await.is_err());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let dest = FsDestination::open(dir.path(), FsDestinationOptions::default()).await.unwrap();
            upload(&dest, 0, "a.txt", b"abc").await;
        }
        let dest = FsDestination::open(dir.path(), FsDestinationOptions::default()).await.unwrap();
        assert_eq!(dest.query("doi:1", "", "").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_upload_registration() {
        let dir = tempfile::tempdir().unwrap();
        let options = FsDestinationOptions { direct_upload: true, ..Default::default() };
        let dest = FsDestination::open(dir.path(), options).await.unwrap();
        assert!(dest.is_direct_upload());

        let mut node = Node::file("b.csv").with_destination("h1", "MD5");
        node.attributes.destination_file.file_size = 10;
        dest.save_after_direct_upload(false, "", "", "doi:1", &["file://x1".into()], &[node.clone()])
            .await
            .unwrap();
        let listing = dest.query("doi:1", "", "").await.unwrap();
        let registered = &listing["b.csv"].attributes.destination_file;
        assert_eq!(registered.storage_identifier, "file://x1");
        assert_eq!(registered.hash, "h1");

        let replacement = node.with_destination_id(registered.id).with_destination("h2", "MD5");
        dest.save_after_direct_upload(true, "", "", "doi:1", &["file://x2".into()], &[replacement])
            .await
            .unwrap();
        let listing = dest.query("doi:1", "", "").await.unwrap();
        assert_eq!(listing["b.csv"].attributes.destination_file.hash, "h2");

        let missing = Node::file("c.csv").with_destination_id(999);
        assert!(dest
            .save_after_direct_upload(true, "", "", "doi:1", &["file://x3".into()], &[missing])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_token_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let options = FsDestinationOptions { token: Some("secret".into()), ..Default::default() };
        let dest = FsDestination::open(dir.path(), options).await.unwrap();
        assert!(matches!(
            dest.check_permission("wrong", "u", "doi:1").await,
            Err(SyncError::Unauthorized(_))
        ));
        assert!(dest.check_permission("secret", "u", "doi:1").await.is_ok());
        assert_eq!(dest.get_user_email("secret", "alice").await.unwrap(), "alice@localhost");
    }

    #[test]
    fn test_repo_url() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = rt
            .block_on(FsDestination::open(dir.path(), FsDestinationOptions::default()))
            .unwrap();
        assert_eq!(
            dest.get_repo_url("doi:10.5072/FK2", true),
            "http://localhost:8080/dataset.xhtml?persistentId=doi:10.5072/FK2&version=DRAFT"
        );
    }
}
