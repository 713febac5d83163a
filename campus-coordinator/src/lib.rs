//! Campus Coordinator - cloud side of the terminal link
//!
//! Admits terminals on `/ws/terminals/{id}/`, groups every socket of one
//! terminal, relays commands and responses between them and bridges terminal
//! telemetry into the persisted store.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod liveness;
pub mod sessions;
pub mod state;
pub mod store;
pub mod ws;

pub use config::CoordinatorConfig;
pub use state::AppState;
pub use store::{MemoryStore, TerminalStore};

use crate::bridge::Bridge;
use crate::cache::StatusCache;
use crate::sessions::SessionRegistry;
use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Close code sent to every session when the coordinator stops
const CLOSE_GOING_AWAY: u16 = 1001;

pub struct Coordinator {
    state: AppState,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn TerminalStore>) -> Self {
        let cache = StatusCache::new(config.status_cache_ttl());
        let bridge = Arc::new(Bridge::new(store, cache, config.log_backlog));
        Self {
            state: AppState {
                config: Arc::new(config),
                sessions: Arc::new(SessionRegistry::new()),
                bridge,
                shutdown: CancellationToken::new(),
            },
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        http::build_router(self.state.clone())
    }

    /// Serve until `token` is cancelled, then close every session and flush the store
    pub async fn serve(&self, listener: TcpListener, token: CancellationToken) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        info!(%addr, "Coordinator listening");

        let flusher = tokio::spawn(flush_loop(
            Arc::clone(self.state.bridge.store()),
            self.state.config.flush_interval(),
            token.child_token(),
        ));

        let sessions = Arc::clone(&self.state.sessions);
        let shutdown = self.state.shutdown.clone();
        let stop = token.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                stop.cancelled().await;
                info!("Shutting down, closing sessions");
                sessions.close_all(CLOSE_GOING_AWAY, "coordinator shutting down");
                shutdown.cancel();
            })
            .await
            .context("HTTP server failed");

        token.cancel();
        if flusher.await.is_err() {
            error!("Store flusher panicked");
        }
        result
    }
}

async fn flush_loop(store: Arc<dyn TerminalStore>, every: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        flush(&store).await;
    }
    flush(&store).await;
}

async fn flush(store: &Arc<dyn TerminalStore>) {
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Failed to flush terminal store"),
        Err(e) => error!(error = %e, "Store flush task failed"),
    }
}
