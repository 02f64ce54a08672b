//! Worker process: pops jobs from the shared queue until SIGINT/SIGTERM.
//!
//! ```bash
//! BACKEND_CONFIG_FILE=/etc/sync/backend.json sync-worker 100 ALL --destination-root /srv/dest
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dataset_sync::storage::{InMemoryStore, KeyValueStore, RedisStore};
use dataset_sync::streams::{LocalStreamProvider, LOCAL_PLUGIN};
use dataset_sync::{FsDestination, FsDestinationOptions, SyncConfig, SyncEngine, ALL_QUEUES};

#[derive(Parser, Debug)]
#[command(name = "sync-worker", about = "Dataset sync worker")]
struct Args {
    /// Workers per queue
    #[arg(default_value_t = 200)]
    workers: usize,

    /// Queue to work, or ALL for the default and every computation queue
    #[arg(default_value = ALL_QUEUES)]
    queue: String,

    /// JSON configuration file
    #[arg(long, env = "BACKEND_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Root directory of the filesystem destination
    #[arg(long, default_value = "./destination")]
    destination_root: PathBuf,

    /// Register files after direct upload instead of streaming them
    #[arg(long)]
    direct_upload: bool,
}

#[tokio::main]
async fn main() -> dataset_sync::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("dataset_sync=info,sync_worker=info")
        }))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };

    let store: Arc<dyn KeyValueStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisStore::with_prefix(url, config.redis_prefix.as_deref()).await?),
        None => {
            warn!("No redis_url configured, jobs live only as long as this process");
            Arc::new(InMemoryStore::new())
        }
    };

    let destination = FsDestination::open(
        &args.destination_root,
        FsDestinationOptions {
            direct_upload: args.direct_upload,
            hash_type: config.default_hash.clone(),
            ..Default::default()
        },
    )
    .await?;

    let engine = Arc::new(
        SyncEngine::builder(config)
            .store(store)
            .destination(Arc::new(destination))
            .plugin(LOCAL_PLUGIN, Arc::new(LocalStreamProvider))
            .build()?,
    );

    engine.spin_workers(args.workers, &args.queue);

    wait_for_signal().await;
    info!("Quitting");
    engine.shutdown().await;
    info!("Exit");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
