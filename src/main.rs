use anyhow::{Context, Result};
use http_proxy_ingress::{DirectRelay, Listener, load_config};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&config_file)?;
    let listen_addr = config.listen_addr();
    info!(
        config_file = %config_file,
        listen_addr = %listen_addr,
        auth_users = config.auth.users.len(),
        request_timeout_secs = ?config.listen.request_timeout_secs,
        "Configuration loaded"
    );

    let context = config.proxy_context()?;
    let listener = Listener::open(&listen_addr, context, Arc::new(DirectRelay)).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!(listen_addr = %listener.address(), "Shutting down");
    listener.shutdown().await;
    Ok(())
}
