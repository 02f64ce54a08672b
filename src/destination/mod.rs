//! Destination abstraction.
//!
//! The destination is the system of record the engine writes to. It is
//! injected once into [`crate::SyncEngine`] as an `Arc<dyn Destination>`;
//! tests substitute their own implementations.
//!
//! Two upload protocols are supported:
//!
//! - **streamed**: content flows through [`Destination::write_over_wire`],
//!   one file at a time;
//! - **direct upload**: content is written straight to a [`crate::blob::BlobStore`]
//!   and registered afterwards in batches with
//!   [`Destination::save_after_direct_upload`].
//!
//! Cancellation is driven by the caller: every call is wrapped in
//! [`crate::job::JobContext::guard`], so dropping the future aborts the I/O.

mod fs;

pub use fs::{FsDestination, FsDestinationOptions};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::blob::{BoxedReader, BoxedWriter};
use crate::error::{Result, SyncError};
use crate::tree::{Node, NodeMap};

/// An in-flight streamed write.
///
/// The caller copies content into `writer`, then either commits with
/// [`OverWireUpload::finish`] or gives up with [`OverWireUpload::abort`].
/// The destination registers the file only once `commit` has fired; an
/// upload dropped without committing leaves the dataset untouched.
/// `completion` resolves once the destination has accepted (or rejected) it.
pub struct OverWireUpload {
    pub writer: BoxedWriter,
    pub commit: oneshot::Sender<()>,
    pub completion: JoinHandle<Result<()>>,
}

impl OverWireUpload {
    /// Close the writer, commit and wait for the destination side.
    pub async fn finish(self) -> Result<()> {
        let Self {
            writer,
            commit,
            completion,
        } = self;
        drop(writer);
        // The receiver may already have failed; its error comes from `completion`.
        let _ = commit.send(());
        join_upload(completion).await
    }

    /// Close the writer without committing and wait for the destination to
    /// discard what it received.
    ///
    /// Returns the destination's own error, if it failed before the abort.
    pub async fn abort(self) -> Result<()> {
        let Self {
            writer,
            commit,
            completion,
        } = self;
        drop(writer);
        drop(commit);
        join_upload(completion).await
    }
}

async fn join_upload(completion: JoinHandle<Result<()>>) -> Result<()> {
    match completion.await {
        Ok(res) => res,
        Err(e) => Err(SyncError::Destination(format!("upload task failed: {e}"))),
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Whether content goes to storage first and is registered in batches.
    fn is_direct_upload(&self) -> bool;

    /// Fails with [`SyncError::Unauthorized`] when `user` may not write `persistent_id`.
    async fn check_permission(&self, token: &str, user: &str, persistent_id: &str) -> Result<()>;

    /// Current file listing of the dataset, with destination hashes.
    async fn query(&self, persistent_id: &str, token: &str, user: &str) -> Result<NodeMap>;

    /// Read back a registered file (streamed mode rehash).
    async fn get_stream(&self, token: &str, user: &str, file_id: i64) -> Result<BoxedReader>;

    /// Start a streamed write of `node_id`; `dest_file_id` is non-zero for a replace.
    async fn write_over_wire(
        &self,
        dest_file_id: i64,
        node_id: &str,
        token: &str,
        user: &str,
        persistent_id: &str,
    ) -> Result<OverWireUpload>;

    /// Register directly uploaded files, `storage_identifiers[i]` belonging to `nodes[i]`.
    ///
    /// A destination that registers part of the batch before failing reports
    /// the registered node ids through [`SyncError::PartialFinalize`].
    async fn save_after_direct_upload(
        &self,
        replace: bool,
        token: &str,
        user: &str,
        persistent_id: &str,
        storage_identifiers: &[String],
        nodes: &[Node],
    ) -> Result<()>;

    async fn delete_file(&self, token: &str, user: &str, file_id: i64) -> Result<()>;

    async fn get_user_email(&self, token: &str, user: &str) -> Result<String>;

    fn get_repo_url(&self, persistent_id: &str, draft: bool) -> String;
}
