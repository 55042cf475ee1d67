//! Deckhand server: HTTP API, progress channel and the generation worker.

pub mod api;
pub mod bootstrap;
pub mod health;
pub mod queue;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

use deckhand_core::config::AppConfig;

pub fn init_logging(config: &AppConfig) {
    use deckhand_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}
