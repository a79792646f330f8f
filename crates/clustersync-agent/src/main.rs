//! # clustersync Agent
//!
//! Runs a source or an agent over MQTT or gRPC until Ctrl+C.

use anyhow::Result;
use clustersync_agent::{Runtime, RuntimeConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting clustersync agent"
    );

    let config = RuntimeConfig::from_env()?;
    tracing::info!(
        role = ?config.role,
        transport = ?config.transport,
        client_id = %config.client_id,
        "Configuration loaded"
    );

    Runtime::new(config)?.run().await
}
