//! `s3` driver: objects keyed `<dataset path>/<filename>` in the bucket the
//! storage identifier names, or in the configured bucket when it names none.
//!
//! Credentials are read from the usual `AWS_*` environment variables;
//! endpoint, region and addressing style come from [`S3Config`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{BlobStore, BoxedReader, BoxedWriter, StorageLocation};
use crate::config::S3Config;
use crate::error::{Result, SyncError};

pub struct S3BlobStore {
    config: S3Config,
    /// One client per bucket, built on first use.
    clients: DashMap<String, Arc<dyn ObjectStore>>,
}

impl S3BlobStore {
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(SyncError::Config("storage.s3.bucket is required by the s3 driver".into()));
        }
        let store = Self {
            config,
            clients: DashMap::new(),
        };
        store.client("")?;
        Ok(store)
    }

    /// Serve `bucket` through `client` instead of building an S3 client.
    pub fn with_client(config: S3Config, bucket: impl Into<String>, client: Arc<dyn ObjectStore>) -> Self {
        let clients = DashMap::new();
        clients.insert(bucket.into(), client);
        Self { config, clients }
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let bucket = if bucket.is_empty() { self.config.bucket.as_str() } else { bucket };
        if let Some(client) = self.clients.get(bucket) {
            return Ok(client.value().clone());
        }
        let client: Arc<dyn ObjectStore> = Arc::new(build_client(&self.config, bucket)?);
        self.clients.insert(bucket.to_string(), client.clone());
        debug!(bucket, endpoint = %self.config.endpoint, "S3 client ready");
        Ok(client)
    }
}

fn build_client(config: &S3Config, bucket: &str) -> Result<impl ObjectStore> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_virtual_hosted_style_request(!config.path_style);
    if !config.region.is_empty() {
        builder = builder.with_region(&config.region);
    }
    if !config.endpoint.is_empty() {
        let endpoint = if config.path_style {
            config.endpoint.clone()
        } else {
            bucket_endpoint(&config.endpoint, bucket)
        };
        builder = builder
            .with_allow_http(endpoint.starts_with("http://"))
            .with_endpoint(endpoint);
    }
    Ok(builder.build()?)
}

/// Virtual-hosted addressing puts the bucket in the host name.
fn bucket_endpoint(endpoint: &str, bucket: &str) -> String {
    match endpoint.split_once("://") {
        Some((scheme, host)) => format!("{scheme}://{bucket}.{host}"),
        None => format!("{bucket}.{endpoint}"),
    }
}

fn object_key(dataset_path: &str, location: &StorageLocation) -> Result<ObjectPath> {
    if location.filename.is_empty() || location.filename.contains('/') {
        return Err(SyncError::Destination(format!(
            "invalid blob name '{}'",
            location.filename
        )));
    }
    Ok(ObjectPath::from(format!("{dataset_path}/{}", location.filename)))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn create(&self, dataset_path: &str, location: &StorageLocation) -> Result<BoxedWriter> {
        let key = object_key(dataset_path, location)?;
        let client = self.client(&location.bucket)?;
        // Multipart upload; the object appears only once the writer is shut down.
        Ok(Box::new(BufWriter::new(client, key)))
    }

    async fn open(&self, dataset_path: &str, location: &StorageLocation) -> Result<BoxedReader> {
        let key = object_key(dataset_path, location)?;
        let object = self.client(&location.bucket)?.get(&key).await?;
        let body = object.into_stream().map_err(std::io::Error::from);
        Ok(Box::new(StreamReader::new(body)))
    }

    async fn delete(&self, dataset_path: &str, location: &StorageLocation) -> Result<()> {
        let key = object_key(dataset_path, location)?;
        match self.client(&location.bucket)?.delete(&key).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> S3Config {
        S3Config {
            bucket: "bkt".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_objects_are_keyed_by_dataset_path() {
        let memory = Arc::new(InMemory::new());
        let store = S3BlobStore::with_client(config(), "bkt", memory.clone());
        let loc = StorageLocation::parse("s3://bkt:18f3a-abc", "s3");

        let mut w = store.create("10.5072/FK2", &loc).await.unwrap();
        w.write_all(b"payload").await.unwrap();
        w.shutdown().await.unwrap();

        let key = ObjectPath::from("10.5072/FK2/18f3a-abc");
        let raw = memory.get(&key).await.unwrap().bytes().await.unwrap();
        assert_eq!(&raw[..], b"payload");

        let mut out = Vec::new();
        store.open("10.5072/FK2", &loc).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");

        store.delete("10.5072/FK2", &loc).await.unwrap();
        assert!(memory.head(&key).await.is_err());
        store.delete("10.5072/FK2", &loc).await.unwrap();
    }

    #[tokio::test]
    async fn test_identifier_without_bucket_uses_configured_bucket() {
        let memory = Arc::new(InMemory::new());
        let store = S3BlobStore::with_client(config(), "bkt", memory.clone());
        let loc = StorageLocation::parse("s3://18f3a-abc", "s3");
        assert_eq!(loc.bucket, "");

        let mut w = store.create("p", &loc).await.unwrap();
        w.write_all(b"x").await.unwrap();
        w.shutdown().await.unwrap();
        assert!(memory.head(&ObjectPath::from("p/18f3a-abc")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unwritten_object_is_not_visible() {
        let memory = Arc::new(InMemory::new());
        let store = S3BlobStore::with_client(config(), "bkt", memory.clone());
        let loc = StorageLocation::parse("s3://bkt:partial", "s3");

        let mut w = store.create("p", &loc).await.unwrap();
        w.write_all(b"half").await.unwrap();
        drop(w);
        assert!(memory.head(&ObjectPath::from("p/partial")).await.is_err());
    }

    #[test]
    fn test_bucket_is_required() {
        assert!(matches!(S3BlobStore::new(S3Config::default()), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_bucket_endpoint() {
        assert_eq!(bucket_endpoint("https://s3.example.org", "data"), "https://data.s3.example.org");
        assert_eq!(bucket_endpoint("minio:9000", "data"), "data.minio:9000");
    }

    #[test]
    fn test_rejects_nested_names() {
        let loc = StorageLocation {
            driver: "s3".into(),
            bucket: "bkt".into(),
            filename: "a/b".into(),
        };
        assert!(object_key("p", &loc).is_err());
    }
}
