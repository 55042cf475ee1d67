//! Standalone generation worker sharing the server's database.

use std::time::Duration;

use anyhow::Result;
use deckhand_core::config::{AppConfig, LoadOptions};
use deckhand_server::{bootstrap, init_logging};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(app.worker.clone().run(shutdown_rx));

    tracing::info!(
        event_name = "system.worker.process_started",
        correlation_id = "bootstrap",
        worker_id = %app.worker.worker_id(),
        "deckhand-worker started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!(
                event_name = "system.worker.stopping",
                correlation_id = "shutdown",
                "deckhand-worker stopping"
            );
            shutdown_tx.send_replace(true);
            let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(
                    event_name = "system.worker.shutdown_timeout",
                    correlation_id = "shutdown",
                    grace_secs = grace.as_secs(),
                    "worker did not finish its in-flight job before the grace period"
                );
            }
        }
        joined = &mut handle => {
            joined?;
        }
    }

    app.db_pool.close().await;
    Ok(())
}
