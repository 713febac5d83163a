//! Campus terminal binary
//!
//! Reads its TOML config (path from `CAMPUS_TERMINAL_CONFIG` or the user
//! config dir), then runs the agent until Ctrl-C.

use anyhow::{Context, Result};
use campus_terminal::config::ConfigStore;
use campus_terminal::logbook::LogBook;
use campus_terminal::{Agent, AgentParts};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let path = ConfigStore::default_path()?;
    let config = Arc::new(
        ConfigStore::load(path.clone())
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
    );

    let logbook = LogBook::new(config.snapshot().log_capacity);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(logbook.layer())
        .init();

    info!(config = %path.display(), "Campus terminal v{}", env!("CARGO_PKG_VERSION"));

    let parts = AgentParts::from_config(&config.snapshot());
    let agent = Agent::build(config, logbook, parts).context("Failed to create agent")?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Could not listen for Ctrl-C"),
        }
    });

    agent.run(token).await.context("Agent execution failed")
}
