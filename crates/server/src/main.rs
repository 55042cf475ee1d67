use std::time::Duration;

use anyhow::Result;
use deckhand_core::config::{AppConfig, LoadOptions};
use deckhand_server::{bootstrap, init_logging};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = app
        .config
        .worker
        .enabled
        .then(|| tokio::spawn(app.worker.clone().run(shutdown_rx)));

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        in_process_worker = worker.is_some(),
        "deckhand-server started"
    );

    axum::serve(listener, app.router()).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "deckhand-server stopping"
    );

    shutdown_tx.send_replace(true);
    if let Some(handle) = worker {
        let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!(
                event_name = "system.worker.shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "worker did not finish its in-flight job before the grace period"
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
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}
