//! Configuration for the sync engine and worker process.
//!
//! Loaded from a JSON file (path in `BACKEND_CONFIG_FILE` for the worker).
//! Every field has a default, so `{}` is a valid configuration.
//!
//! # Example
//!
//! ```
//! use dataset_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.default_hash, "MD5");
//! assert_eq!(config.max_errors, 100);
//!
//! // Tighter race window for a fast poller
//! let config = SyncConfig {
//!     tombstone_ttl_secs: 10,
//!     direct_upload_parallelism: 4,
//!     ..Default::default()
//! };
//! assert_eq!(config.tombstone_ttl().as_secs(), 10);
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::resilience::retry::{BackoffPolicy, FixedBackoff, RetryConfig};

/// Environment variable naming the JSON config file.
pub const CONFIG_FILE_ENV: &str = "BACKEND_CONFIG_FILE";

/// Configuration for the sync engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Redis connection string; the in-memory store is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix when sharing a Redis instance
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Hash type native to the destination
    #[serde(default = "default_hash")]
    pub default_hash: String,

    /// Lock ceiling; also the job deadline
    #[serde(default = "default_lock_max_duration_secs")]
    pub lock_max_duration_secs: u64,

    /// Written/deleted marker lifetime (the poller race window)
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,

    /// Delay before explicit tombstone cleanup after a run
    #[serde(default = "default_tombstone_cleanup_delay_secs")]
    pub tombstone_cleanup_delay_secs: u64,

    #[serde(default = "default_cleanup_chunk_size")]
    pub cleanup_chunk_size: usize,

    /// Known-hash checkpoint every N processed nodes
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Worker queue polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Failures before a job is abandoned
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Concurrent finalize sub-batches for direct-upload destinations
    #[serde(default = "default_direct_upload_parallelism")]
    pub direct_upload_parallelism: usize,

    /// Upper bound of the random start delay per worker
    #[serde(default = "default_worker_stagger_max_ms")]
    pub worker_stagger_max_ms: u64,

    /// TTL of the `error <pid>` sidecar
    #[serde(default = "default_sidecar_ttl_secs")]
    pub error_ttl_secs: u64,

    /// TTL of cached compare/compute results
    #[serde(default = "default_sidecar_ttl_secs")]
    pub result_ttl_secs: u64,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Named queues spawned by the `ALL` worker
    #[serde(default)]
    pub computation_queues: Vec<QueueConfig>,

    /// Root of per-job compute workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    /// Interpreter used to run compute scripts
    #[serde(default = "default_compute_command")]
    pub compute_command: String,

    /// Converter run per file by `ddi-cdi` jobs
    #[serde(default = "default_ddi_cdi_script")]
    pub ddi_cdi_script: String,

    #[serde(default)]
    pub mail: MailConfig,
}

fn default_hash() -> String { "MD5".to_string() }
fn default_lock_max_duration_secs() -> u64 { 168 * 60 * 60 } // one week
fn default_tombstone_ttl_secs() -> u64 { 5 * 60 }
fn default_tombstone_cleanup_delay_secs() -> u64 { 10 }
fn default_cleanup_chunk_size() -> usize { 100 }
fn default_checkpoint_interval() -> usize { 10 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_errors() -> u32 { 100 }
fn default_direct_upload_parallelism() -> usize { 1 }
fn default_worker_stagger_max_ms() -> u64 { 1000 }
fn default_sidecar_ttl_secs() -> u64 { 5 * 60 }
fn default_workspace_root() -> String { "/dsdata".to_string() }
fn default_compute_command() -> String { "python".to_string() }
fn default_ddi_cdi_script() -> String { "/usr/local/bin/csv_to_cdi.py".to_string() }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: None,
            default_hash: default_hash(),
            lock_max_duration_secs: default_lock_max_duration_secs(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
            tombstone_cleanup_delay_secs: default_tombstone_cleanup_delay_secs(),
            cleanup_chunk_size: default_cleanup_chunk_size(),
            checkpoint_interval: default_checkpoint_interval(),
            poll_interval_ms: default_poll_interval_ms(),
            max_errors: default_max_errors(),
            backoff: BackoffConfig::default(),
            direct_upload_parallelism: default_direct_upload_parallelism(),
            worker_stagger_max_ms: default_worker_stagger_max_ms(),
            error_ttl_secs: default_sidecar_ttl_secs(),
            result_ttl_secs: default_sidecar_ttl_secs(),
            storage: StorageConfig::default(),
            computation_queues: Vec::new(),
            workspace_root: default_workspace_root(),
            compute_command: default_compute_command(),
            ddi_cdi_script: default_ddi_cdi_script(),
            mail: MailConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        let config: SyncConfig = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `BACKEND_CONFIG_FILE`, or defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cleanup_chunk_size == 0 {
            return Err(SyncError::Config("cleanup_chunk_size must be > 0".into()));
        }
        if self.direct_upload_parallelism == 0 {
            return Err(SyncError::Config("direct_upload_parallelism must be > 0".into()));
        }
        if self.max_errors == 0 {
            return Err(SyncError::Config("max_errors must be > 0".into()));
        }
        self.default_hash.parse::<crate::hashing::HashType>()?;
        Ok(())
    }

    #[must_use]
    pub fn lock_max_duration(&self) -> Duration {
        Duration::from_secs(self.lock_max_duration_secs)
    }

    #[must_use]
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    #[must_use]
    pub fn tombstone_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.tombstone_cleanup_delay_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn error_ttl(&self) -> Duration {
        Duration::from_secs(self.error_ttl_secs)
    }

    #[must_use]
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Fixed,
}

/// Worker backoff between failed attempts of the same job.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 60_000 }
fn default_factor() -> f64 { 2.0 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn build(&self) -> Arc<dyn BackoffPolicy> {
        match self.strategy {
            BackoffStrategy::Fixed => Arc::new(FixedBackoff(Duration::from_millis(self.initial_delay_ms))),
            BackoffStrategy::Exponential => Arc::new(RetryConfig {
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                factor: self.factor,
                max_attempts: None,
            }),
        }
    }
}

/// Where direct-upload and local-file content is stored.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Driver used when a storage identifier carries none (`file` or `s3`)
    #[serde(default = "default_driver")]
    pub default_driver: String,
    /// Name written into storage identifiers instead of the driver
    #[serde(default)]
    pub storage_id: Option<String>,
    /// Root directory of the `file` driver
    #[serde(default)]
    pub path_to_files_dir: Option<String>,
    #[serde(default)]
    pub s3: S3Config,
}

fn default_driver() -> String { "file".to_string() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_driver: default_driver(),
            storage_id: None,
            path_to_files_dir: None,
            s3: S3Config::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    pub value: String,
    #[serde(default)]
    pub label: String,
}

/// Notification templates. `{pid}` and `{url}` are substituted.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_success_subject")]
    pub success_subject: String,
    #[serde(default = "default_success_template")]
    pub success_template: String,
    #[serde(default = "default_failure_subject")]
    pub failure_subject: String,
    #[serde(default = "default_failure_template")]
    pub failure_template: String,
}

fn default_success_subject() -> String { "Dataset updated".to_string() }
fn default_success_template() -> String {
    "Your update of dataset {pid} has finished successfully: {url}".to_string()
}
fn default_failure_subject() -> String { "Dataset update failed".to_string() }
fn default_failure_template() -> String {
    "Your update of dataset {pid} has failed: {url}\n\nError: {error}".to_string()
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            success_subject: default_success_subject(),
            success_template: default_success_template(),
            failure_subject: default_failure_subject(),
            failure_template: default_failure_template(),
        }
    }
}
