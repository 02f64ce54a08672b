//! Shared fixtures for the engine tests.
//!
//! Every test gets its own temp directory, in-memory store and filesystem
//! destination. [`FaultyDestination`] wraps the filesystem destination and
//! [`FaultySource`] wraps the in-memory content to inject the failures the
//! worker has to survive.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;

use dataset_sync::blob::BoxedReader;
use dataset_sync::notify::MemoryNotifier;
use dataset_sync::storage::InMemoryStore;
use dataset_sync::streams::{ContentStream, MemoryStreamProvider, StreamProvider, Streams};
use dataset_sync::{
    Destination, FixedBackoff, FsDestination, FsDestinationOptions, Job, Node, NodeAction, NodeMap, OverWireUpload,
    Result, StreamParams, SyncConfig, SyncEngine, SyncError,
};

pub const PID: &str = "doi:10.5072/FK2/ABCDEF";
pub const PLUGIN: &str = "memory";
pub const TOKEN: &str = "token";
pub const USER: &str = "alice";

/// Injected failures; all off by default.
#[derive(Default)]
pub struct Faults {
    /// Register this many nodes per finalize call, then fail with `PartialFinalize`.
    pub finalize_after: Option<usize>,
    /// Fail every finalize call outright.
    pub finalize_error: bool,
    /// Node ids whose streamed write is refused.
    pub refuse_writes: HashSet<String>,
    /// Fail `check_permission`.
    pub unauthorized: bool,
}

/// Filesystem destination with injectable faults and call counters.
pub struct FaultyDestination {
    pub inner: FsDestination,
    pub faults: Mutex<Faults>,
    pub finalize_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
}

impl FaultyDestination {
    pub fn new(inner: FsDestination) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            finalize_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
        }
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }
}

#[async_trait]
impl Destination for FaultyDestination {
    fn is_direct_upload(&self) -> bool {
        self.inner.is_direct_upload()
    }

    async fn check_permission(&self, token: &str, user: &str, persistent_id: &str) -> Result<()> {
        if self.faults.lock().unauthorized {
            return Err(SyncError::Unauthorized("no write access".into()));
        }
        self.inner.check_permission(token, user, persistent_id).await
    }

    async fn query(&self, persistent_id: &str, token: &str, user: &str) -> Result<NodeMap> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query(persistent_id, token, user).await
    }

    async fn get_stream(&self, token: &str, user: &str, file_id: i64) -> Result<BoxedReader> {
        self.inner.get_stream(token, user, file_id).await
    }

    async fn write_over_wire(
        &self,
        dest_file_id: i64,
        node_id: &str,
        token: &str,
        user: &str,
        persistent_id: &str,
    ) -> Result<OverWireUpload> {
        if self.faults.lock().refuse_writes.contains(node_id) {
            return Err(SyncError::Destination(format!("write of {node_id} refused")));
        }
        self.inner
            .write_over_wire(dest_file_id, node_id, token, user, persistent_id)
            .await
    }

    async fn save_after_direct_upload(
        &self,
        replace: bool,
        token: &str,
        user: &str,
        persistent_id: &str,
        storage_identifiers: &[String],
        nodes: &[Node],
    ) -> Result<()> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let (finalize_after, finalize_error) = {
            let faults = self.faults.lock();
            (faults.finalize_after, faults.finalize_error)
        };
        if finalize_error {
            return Err(SyncError::Destination("finalize unavailable".into()));
        }
        match finalize_after {
            Some(n) if n < nodes.len() => {
                self.inner
                    .save_after_direct_upload(replace, token, user, persistent_id, &storage_identifiers[..n], &nodes[..n])
                    .await?;
                Err(SyncError::PartialFinalize {
                    confirmed: nodes[..n].iter().map(|n| n.id.clone()).collect(),
                    reason: "connection reset".into(),
                })
            }
            _ => {
                self.inner
                    .save_after_direct_upload(replace, token, user, persistent_id, storage_identifiers, nodes)
                    .await
            }
        }
    }

    async fn delete_file(&self, token: &str, user: &str, file_id: i64) -> Result<()> {
        self.inner.delete_file(token, user, file_id).await
    }

    async fn get_user_email(&self, token: &str, user: &str) -> Result<String> {
        self.inner.get_user_email(token, user).await
    }

    fn get_repo_url(&self, persistent_id: &str, draft: bool) -> String {
        self.inner.get_repo_url(persistent_id, draft)
    }
}

/// Source-side failures; all off by default.
#[derive(Default)]
pub struct SourceFaults {
    /// Node id → bytes served before the read fails.
    pub break_after: Mutex<HashMap<String, usize>>,
    /// Opening the Nth stream of the run (1-based) waits for `release`.
    pub hold_open: Mutex<Option<usize>>,
    pub opened: AtomicUsize,
    /// Signalled when the held stream is reached.
    pub held: Notify,
    pub release: Notify,
}

/// In-memory content with injectable source failures.
pub struct FaultySource {
    pub inner: MemoryStreamProvider,
    pub faults: Arc<SourceFaults>,
}

#[async_trait]
impl StreamProvider for FaultySource {
    async fn streams(&self, nodes: &NodeMap, params: &StreamParams) -> Result<Streams> {
        let mut streams = self.inner.streams(nodes, params).await?;
        for (id, inner) in std::mem::take(&mut streams.streams) {
            let stream = FaultyStream {
                id: id.clone(),
                inner,
                faults: self.faults.clone(),
            };
            streams.streams.insert(id, Box::new(stream));
        }
        Ok(streams)
    }
}

struct FaultyStream {
    id: String,
    inner: Box<dyn ContentStream>,
    faults: Arc<SourceFaults>,
}

#[async_trait]
impl ContentStream for FaultyStream {
    async fn open(&mut self) -> Result<BoxedReader> {
        let nth = self.faults.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let hold = *self.faults.hold_open.lock() == Some(nth);
        if hold {
            self.faults.held.notify_one();
            self.faults.release.notified().await;
        }
        let reader = self.inner.open().await?;
        let limit = self.faults.break_after.lock().get(&self.id).copied();
        Ok(match limit {
            Some(remaining) => Box::new(BrokenReader { inner: reader, remaining }) as BoxedReader,
            None => reader,
        })
    }
}

/// Serves `remaining` bytes, then fails like a dropped connection.
struct BrokenReader {
    inner: BoxedReader,
    remaining: usize,
}

impl AsyncRead for BrokenReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "source connection reset",
            )));
        }
        let mut chunk = vec![0u8; self.remaining.min(buf.remaining())];
        let mut limited = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut limited))?;
        let filled = limited.filled();
        buf.put_slice(filled);
        self.remaining -= filled.len();
        Poll::Ready(Ok(()))
    }
}

/// Regular files anywhere under `dir`; 0 when it does not exist.
pub fn files_under(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                files_under(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Engine plus handles on everything it was built from.
pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<InMemoryStore>,
    pub destination: Arc<FaultyDestination>,
    pub content: MemoryStreamProvider,
    pub source_faults: Arc<SourceFaults>,
    pub notifier: Arc<MemoryNotifier>,
    pub dir: TempDir,
}

/// Config with fast timers for tests.
pub fn test_config(dir: &TempDir) -> SyncConfig {
    let mut config = SyncConfig {
        tombstone_cleanup_delay_secs: 0,
        poll_interval_ms: 10,
        worker_stagger_max_ms: 0,
        max_errors: 5,
        workspace_root: dir.path().join("workspace").display().to_string(),
        ..Default::default()
    };
    config.storage.path_to_files_dir = Some(dir.path().join("files").display().to_string());
    config
}

pub async fn harness(direct_upload: bool) -> Harness {
    harness_with(direct_upload, |_| {}).await
}

pub async fn harness_with(direct_upload: bool, tweak: impl FnOnce(&mut SyncConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);

    let fs = FsDestination::open(
        dir.path().join("dest"),
        FsDestinationOptions {
            direct_upload,
            token: Some(TOKEN.to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let destination = Arc::new(FaultyDestination::new(fs));
    let store = Arc::new(InMemoryStore::new());
    let content = MemoryStreamProvider::new();
    let source_faults = Arc::new(SourceFaults::default());
    let source = FaultySource {
        inner: content.clone(),
        faults: source_faults.clone(),
    };
    let notifier = Arc::new(MemoryNotifier::new());

    let engine = SyncEngine::builder(config)
        .store(store.clone())
        .destination(destination.clone())
        .plugin(PLUGIN, Arc::new(source))
        .notifier(notifier.clone())
        .backoff(Arc::new(FixedBackoff(Duration::ZERO)))
        .build()
        .unwrap();

    Harness {
        engine: Arc::new(engine),
        store,
        destination,
        content,
        source_faults,
        notifier,
        dir,
    }
}

/// Hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(data))
}

/// A copy node whose source reports `content` hashed with SHA-1.
pub fn copy_node(id: &str, content: &[u8]) -> Node {
    Node::file(id)
        .with_action(NodeAction::Copy)
        .with_remote(sha1_hex(content), "SHA-1")
        .with_remote_size(content.len() as i64)
}

/// Write job over `nodes`, authenticated as the test user.
pub fn write_job(nodes: impl IntoIterator<Item = Node>) -> Job {
    let nodes: NodeMap = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    let mut job = Job::new(PID, PLUGIN, nodes);
    job.dataverse_key = TOKEN.to_string();
    job.user = USER.to_string();
    job
}

impl Harness {
    /// Register source content and return the node that copies it.
    pub fn source(&self, id: &str, content: &[u8]) -> Node {
        self.content.insert(id, content.to_vec());
        copy_node(id, content)
    }

    /// Source listing as a compare input.
    pub fn source_map(&self, files: &[(&str, &[u8])]) -> NodeMap {
        files
            .iter()
            .map(|(id, content)| {
                self.content.insert(*id, content.to_vec());
                (id.to_string(), copy_node(id, content))
            })
            .collect()
    }

    pub async fn listing(&self) -> NodeMap {
        self.destination.inner.query(PID, TOKEN, USER).await.unwrap()
    }

    /// Enqueue and work the job until the queue is empty.
    pub async fn run(&self, mut job: Job) {
        self.engine.add_job(&mut job).await.unwrap();
        while self.engine.process_one("").await.unwrap().is_some() {}
    }
}

impl Harness {
    /// Put `content` in the destination without going through a job.
    pub async fn seed(&self, id: &str, content: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let mut upload = self
            .destination
            .inner
            .write_over_wire(0, id, TOKEN, USER, PID)
            .await
            .unwrap();
        upload.writer.write_all(content).await.unwrap();
        upload.writer.shutdown().await.unwrap();
        upload.finish().await.unwrap();
    }

    /// Streamed content stored by the destination.
    pub fn destination_blobs(&self) -> usize {
        files_under(&self.dir.path().join("dest").join(".blobs"))
    }

    /// Direct-upload blobs of the test dataset.
    pub fn storage_blobs(&self) -> usize {
        files_under(&self.dir.path().join("files"))
    }
}
