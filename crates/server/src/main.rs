mod api;
mod bootstrap;
mod health;
mod outbox;
mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prechat_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::outbox::Outbox;

const OUTBOX_PER_SENDER: usize = 16;

fn init_logging(config: &AppConfig) {
    use prechat_core::config::LogFormat::*;

    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let outbox = Arc::new(Outbox::new(OUTBOX_PER_SENDER));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    if app.config.coalescing.enabled {
        workers.push(workers::spawn_flush_loop(
            Arc::clone(&app.runtime),
            Arc::clone(&outbox),
            app.config.coalescing.flush_interval_secs,
            shutdown_rx.clone(),
        ));
    }
    workers.push(workers::spawn_maintenance_loop(
        Arc::clone(&app.runtime),
        app.config.maintenance.interval_secs,
        shutdown_rx,
    ));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let router = api::router(api::ApiState {
        runtime: Arc::clone(&app.runtime),
        outbox,
        db_pool: app.db_pool.clone(),
    });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        system_active = app.coordinator.budget().is_active().await,
        "prechat-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "prechat-server stopping"
    );

    // Receivers may already be gone if every worker exited.
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs.max(1));
    for worker in workers {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!(
                event_name = "system.server.worker_timeout",
                correlation_id = "shutdown",
                "background worker did not stop within the grace period"
            );
        }
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            error = %error,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
