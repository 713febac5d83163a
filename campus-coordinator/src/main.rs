use anyhow::{Context, Result};
use campus_coordinator::config::load_config;
use campus_coordinator::{Coordinator, MemoryStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await;
    info!(
        bind = %config.bind,
        terminals = config.terminals.len(),
        "Starting Campus coordinator"
    );

    let store = Arc::new(MemoryStore::open(&config).context("Failed to open terminal store")?);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => token.cancel(),
                Err(e) => error!(error = %e, "Cannot listen for Ctrl-C"),
            }
        }
    });

    Coordinator::new(config, store).serve(listener, token).await?;
    info!("Coordinator stopped");
    Ok(())
}
