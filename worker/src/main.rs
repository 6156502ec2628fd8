//! Guidepay worker binary.
//!
//! Runs the side-effect job consumers and the periodic reconciliation, and
//! exposes Prometheus metrics.

use anyhow::Context;
use guidepay_postgres::{connect, migrate};
use guidepay_runtime::metrics::MetricsServer;
use guidepay_worker::jobs::run_consumer;
use guidepay_worker::{Config, Services};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting guidepay worker");

    let metrics_addr: SocketAddr = config
        .server
        .metrics_addr
        .parse()
        .context("Invalid METRICS_ADDR")?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start().context("Failed to start metrics server")?;

    info!("Connecting to database...");
    let pool = connect(&config.pool())
        .await
        .context("Failed to connect to database")?;
    migrate(&pool).await.context("Failed to apply migrations")?;
    info!(
        max_connections = config.postgres.max_connections,
        "Database ready"
    );

    let services = Services::build(&config, pool);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let source = services.job_source();
    for (queue, handler, settings) in services.consumers() {
        tasks.spawn(run_consumer(
            queue,
            source.clone(),
            handler,
            settings,
            shutdown_rx.clone(),
        ));
    }
    tasks.spawn(services.scheduler().run(shutdown_rx));

    info!(tasks = tasks.len(), "Worker running");
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    let drained = tokio::time::timeout(timeout, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                warn!(error = %error, "Worker task ended abnormally");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(timeout_secs = timeout.as_secs(), "Shutdown timed out; aborting remaining tasks");
        tasks.abort_all();
    }

    info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
