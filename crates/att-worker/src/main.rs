//! Attache background worker
//!
//! Reads promote/destroy job payloads from stdin, one JSON document per
//! line, and performs them against the database and the filesystem
//! storages.
//!
//! Configuration comes from the file named by `ATTACHE_CONFIG` layered under
//! `ATTACHE__SECTION__KEY` variables, or from plain environment variables
//! when `ATTACHE_CONFIG` is unset.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use att_attacher::{AtomicOptions, AttacherContext, JobQueue, PersistStrategy, ReloadStrategy, Worker};
use att_core::config::{AppConfig, StorageConfig};
use att_core::telemetry::{init_tracing, LogFormat};
use att_db::{Database, PgRecordStore};
use att_storage::{FileSystemStorage, RetryStorage, Storage, StorageRegistry};
use tokio::io::BufReader;
use tracing::{error, info, warn};

mod feed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info,att_worker=debug,att_attacher=debug", LogFormat::from_env());

    let config = match std::env::var("ATTACHE_CONFIG") {
        Ok(path) => AppConfig::load(Some(&path))
            .with_context(|| format!("Failed to load config from {}", path))?,
        Err(_) => AppConfig::from_env().unwrap_or_else(|e| {
            warn!("Failed to load config from env: {}, using defaults", e);
            AppConfig::default()
        }),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        concurrency = config.worker.concurrency,
        reload = %config.worker.reload,
        "Starting Attache worker"
    );

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    let (cache, storages) = build_storages(&config.storage);
    let records = Arc::new(PgRecordStore::new(db.pool().clone()));
    let ctx = AttacherContext::from_settings(&config.attacher, storages);

    let reload: ReloadStrategy = config
        .worker
        .reload
        .parse()
        .map_err(anyhow::Error::msg)?;
    let options = AtomicOptions::new(reload, PersistStrategy::Save);

    let (queue, receiver) = JobQueue::channel();
    let worker = tokio::spawn(
        Worker::new(receiver, records, &ctx, options)
            .concurrency(config.worker.concurrency)
            .run(),
    );
    let cleaner = tokio::spawn(expire_cache(cache, config.storage.clone()));

    let input = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = feed::feed(input, queue) => match result {
            Ok(stats) => info!(accepted = stats.accepted, rejected = stats.rejected, "Input closed"),
            Err(e) => error!(error = %e, "Reading jobs failed"),
        },
        _ = shutdown_signal() => {}
    }

    // the queue is dropped; the worker finishes jobs already received
    let stats = worker.await.context("Worker task failed")?;
    cleaner.abort();
    db.close().await;

    info!(
        promoted = stats.promoted,
        discarded = stats.discarded,
        destroyed = stats.destroyed,
        failed = stats.failed,
        "Worker shutdown complete"
    );
    Ok(())
}

/// Filesystem `cache` and `store` storages with upload retries
fn build_storages(config: &StorageConfig) -> (Arc<FileSystemStorage>, StorageRegistry) {
    let filesystem = |dir: &Path| match &config.prefix {
        Some(prefix) => FileSystemStorage::with_prefix(dir, prefix.clone()),
        None => FileSystemStorage::new(dir),
    };
    let retrying = |storage: Arc<dyn Storage>| -> Arc<dyn Storage> {
        Arc::new(
            RetryStorage::new(storage)
                .attempts(config.upload_attempts)
                .delay(config.retry_delay()),
        )
    };

    let cache = Arc::new(filesystem(config.cache_directory.as_path()));
    let store = Arc::new(filesystem(config.store_directory.as_path()));
    let registry = StorageRegistry::new()
        .with("cache", retrying(cache.clone()))
        .with("store", retrying(store));
    (cache, registry)
}

/// Periodically delete expired files from the cache directory
async fn expire_cache(cache: Arc<FileSystemStorage>, config: StorageConfig) {
    if config.cache_expiry_seconds == 0 {
        return;
    }
    let mut interval = tokio::time::interval(config.cache_expiry() / 4);
    loop {
        interval.tick().await;
        if let Err(e) = cache.clear_older_than(config.cache_expiry()).await {
            warn!(error = %e, "Cache cleanup failed");
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
