//! Pixelpipe Notifier - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info};

use pixelpipe_common::logging::{init_logging, LogConfig};
use pixelpipe_common::queue::{PgWorkQueue, WorkQueue};

use pixelpipe_notifier::config::NotifierConfig;
use pixelpipe_notifier::consumer::NotificationFanout;
use pixelpipe_notifier::health::{self, HealthState};
use pixelpipe_notifier::sink::{LogSink, NotificationSink, WebhookSink};

#[tokio::main]
async fn main() -> Result<()> {
    let mut log_config = LogConfig::from_env("pixelpipe-notifier")?;
    if log_config.filter_directives.is_none() {
        log_config.filter_directives =
            Some("pixelpipe_notifier=debug,pixelpipe_common=debug,sqlx=info".to_string());
    }
    init_logging(&log_config)?;

    info!("Starting Pixelpipe notifier");

    let config = NotifierConfig::load()?;
    info!(
        "Configuration loaded - health server will bind to {}:{}",
        config.server.host, config.server.port
    );

    // Fail fast: the queue must be reachable before consuming anything.
    let queue_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.queue_url)
        .await?;
    info!("Work queue connection pool established");

    let queue: Arc<dyn WorkQueue> = Arc::new(PgWorkQueue::new(queue_pool));

    // Composition root: log sink always on, one webhook sink per URL.
    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    for url in &config.delivery.webhook_urls {
        sinks.push(Arc::new(WebhookSink::new(
            url.clone(),
            config.delivery.webhook_timeout(),
        )?));
        info!(url = %url, "Webhook sink configured");
    }

    let fanout = Arc::new(NotificationFanout::new(
        queue.clone(),
        sinks,
        config.delivery.max_in_flight,
    ));

    let fanout_handle = tokio::spawn(async move {
        if let Err(e) = fanout.run().await {
            error!(error = %e, "Event consumer exited with error");
        }
    });

    let app = health::router(HealthState { queue });
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    fanout_handle.abort();
    info!("Notifier shut down gracefully");

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

    // Let an in-flight event finish its fanout
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
