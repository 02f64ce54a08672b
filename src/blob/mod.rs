//! Storage identifiers and blob stores for direct-upload content.
//!
//! A storage identifier has the form `<driver>://[bucket:]filename`. The
//! driver part names the store as registered at the destination (it may be
//! a configured storage id rather than the driver itself), so the local
//! driver is always taken from configuration.

mod s3;

pub use s3::S3BlobStore;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Result, SyncError};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const FILE_DRIVER: &str = "file";
pub const S3_DRIVER: &str = "s3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub driver: String,
    pub bucket: String,
    pub filename: String,
}

impl StorageLocation {
    /// Parse `<id>://[bucket:]filename`; anything else yields an empty filename.
    #[must_use]
    pub fn parse(storage_identifier: &str, default_driver: &str) -> Self {
        let mut bucket = String::new();
        let mut filename = String::new();
        let parts: Vec<&str> = storage_identifier.split("://").collect();
        if let [_, rest] = parts.as_slice() {
            filename = (*rest).to_string();
            let inner: Vec<&str> = rest.split(':').collect();
            if let [b, f] = inner.as_slice() {
                bucket = (*b).to_string();
                filename = (*f).to_string();
            }
        }
        Self {
            driver: default_driver.to_string(),
            bucket,
            filename,
        }
    }
}

/// Unique blob name: hex millis since epoch, dash, 6 random bytes in hex.
#[must_use]
pub fn generate_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let uid = Uuid::new_v4();
    format!("{millis:x}-{}", hex::encode(&uid.as_bytes()[10..]))
}

#[must_use]
pub fn generate_storage_identifier(file_name: &str, storage: &StorageConfig) -> String {
    let bucket = if storage.default_driver == S3_DRIVER {
        format!("{}:", storage.s3.bucket)
    } else {
        String::new()
    };
    let storage_id = storage
        .storage_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(storage.default_driver.as_str());
    format!("{storage_id}://{bucket}{file_name}")
}

/// Strip the protocol from a persistent id: `doi:10.5072/FK2` → `10.5072/FK2`.
pub fn trim_protocol(persistent_id: &str) -> Result<String> {
    match persistent_id.split_once(':') {
        Some((_, rest)) => Ok(rest.to_string()),
        None => Err(SyncError::InvalidPersistentId(persistent_id.to_string())),
    }
}

/// Content store written to before a direct-upload finalize.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open `location` of dataset `dataset_path` for writing, truncating.
    async fn create(&self, dataset_path: &str, location: &StorageLocation) -> Result<BoxedWriter>;

    async fn open(&self, dataset_path: &str, location: &StorageLocation) -> Result<BoxedReader>;

    /// Remove a blob that will not be registered. Missing blobs are not an error.
    async fn delete(&self, dataset_path: &str, location: &StorageLocation) -> Result<()>;

    /// Filesystem path of the blob, when the store has one.
    fn local_path(&self, _dataset_path: &str, _location: &StorageLocation) -> Option<PathBuf> {
        None
    }
}

/// `file` driver: `<root>/<dataset path>/<filename>`.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, dataset_path: &str, location: &StorageLocation) -> Result<PathBuf> {
        if location.filename.is_empty() || location.filename.contains('/') {
            return Err(SyncError::Destination(format!(
                "invalid blob name '{}'",
                location.filename
            )));
        }
        Ok(self.root.join(dataset_path).join(&location.filename))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn create(&self, dataset_path: &str, location: &StorageLocation) -> Result<BoxedWriter> {
        let path = self.path(dataset_path, location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Box::new(file))
    }

    async fn open(&self, dataset_path: &str, location: &StorageLocation) -> Result<BoxedReader> {
        let file = tokio::fs::File::open(self.path(dataset_path, location)?).await?;
        Ok(Box::new(file))
    }

    async fn delete(&self, dataset_path: &str, location: &StorageLocation) -> Result<()> {
        match tokio::fs::remove_file(self.path(dataset_path, location)?).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn local_path(&self, dataset_path: &str, location: &StorageLocation) -> Option<PathBuf> {
        self.path(dataset_path, location).ok()
    }
}
