//! hived — Hive cluster coordinator daemon.

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use hive_core::config::HiveConfig;
use hived::Coordinator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = HiveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = HiveConfig::load()
        .with_context(|| format!("load config {}", HiveConfig::file_path().display()))?;
    tracing::info!(path = %HiveConfig::file_path().display(), "hived starting");

    let gateway = TcpListener::bind(&config.network.gateway_addr)
        .await
        .with_context(|| format!("bind gateway {}", config.network.gateway_addr))?;
    let api = TcpListener::bind(&config.network.api_addr)
        .await
        .with_context(|| format!("bind control API {}", config.network.api_addr))?;

    let coordinator = Coordinator::from_config(config)?;

    // Shutdown signal
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received");
                let _ = tx.send(());
            }
        });
    }

    coordinator.run(gateway, api, shutdown_tx).await
}
