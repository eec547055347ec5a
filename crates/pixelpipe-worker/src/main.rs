//! Pixelpipe Worker - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info};

use pixelpipe_common::logging::{init_logging, LogConfig};
use pixelpipe_common::queue::{PgWorkQueue, WorkQueue};
use pixelpipe_common::store::{ImageStore, PgImageStore};

use pixelpipe_worker::config::WorkerConfig;
use pixelpipe_worker::consumer::{ProcessingWorker, ProcessorSettings};
use pixelpipe_worker::health::{self, HealthState};
use pixelpipe_worker::transform::{Transform, WatermarkTransform};

#[tokio::main]
async fn main() -> Result<()> {
    let mut log_config = LogConfig::from_env("pixelpipe-worker")?;
    if log_config.filter_directives.is_none() {
        log_config.filter_directives =
            Some("pixelpipe_worker=debug,pixelpipe_common=debug,sqlx=info".to_string());
    }
    init_logging(&log_config)?;

    info!("Starting Pixelpipe worker");

    let config = WorkerConfig::load()?;
    info!(
        "Configuration loaded - health server will bind to {}:{}",
        config.server.host, config.server.port
    );

    // Fail fast: both pools must be reachable before consuming anything.
    let store_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;
    info!("State store connection pool established");

    let queue_pool = if config.database.queue_url == config.database.url {
        store_pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
            .connect(&config.database.queue_url)
            .await?
    };
    info!("Work queue connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&store_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database migrations completed");

    tokio::fs::create_dir_all(config.storage.original_dir()).await?;
    tokio::fs::create_dir_all(config.storage.processed_dir()).await?;
    info!(root = %config.storage.root.display(), "Storage directories ready");

    // Composition root: concrete store, queue and transform are wired
    // here and nowhere else.
    let store: Arc<dyn ImageStore> = Arc::new(PgImageStore::new(store_pool));
    let queue: Arc<dyn WorkQueue> = Arc::new(PgWorkQueue::new(queue_pool));
    let transform: Arc<dyn Transform> = Arc::new(WatermarkTransform::new(
        config.processing.max_width,
        config.processing.watermark_path.clone(),
    ));

    let worker = Arc::new(ProcessingWorker::new(
        store.clone(),
        queue.clone(),
        transform,
        ProcessorSettings {
            processed_dir: config.storage.processed_dir(),
            transform_timeout: config.processing.transform_timeout(),
            max_attempts: config.processing.max_attempts,
            retry_backoff: config.processing.retry_backoff(),
            max_in_flight: config.processing.max_in_flight,
        },
    ));

    let worker_handle = tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            error!(error = %e, "Task consumer exited with error");
        }
    });

    let app = health::router(HealthState { store, queue });
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    worker_handle.abort();
    info!("Worker shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Let an in-flight task finish its current step
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
