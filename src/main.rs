//! wiremux - multiplexed request/response server
//!
//! Runs a line-delimited TCP server that answers every call with the echo
//! executor. Embedders supply their own [`wiremux_server::Executor`].

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wiremux_server::config::CONFIG_ENV;
use wiremux_server::{Config, EchoExecutor, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // File named by WIREMUX_CONFIG if set, then env overrides.
    let config_path = std::env::var(CONFIG_ENV).ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!(
        "Starting wiremux server (protocol {} {})",
        wiremux_protocol::PROTOCOL_NAME,
        wiremux_protocol::PROTOCOL_VERSION
    );
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Heartbeat interval: {:?}",
        config.protocol.heartbeat_interval()
    );
    tracing::info!("  Call timeout: {:?}", config.protocol.call_timeout());

    let server = Arc::new(Server::new(
        ServerConfig::from_config(&config),
        Arc::new(EchoExecutor),
    ));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
