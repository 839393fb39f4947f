//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Initialize tracing with JSON formatting and env-filter levels
pub fn init_tracing(config: &Config) {
    let log_level = config.service.log_level.clone();

    let result = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    if result.is_ok() {
        tracing::info!("Tracing initialized for service: {}", config.service.name);
    }
}

/// Flush and shut down tracing
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}
