use crate::bridge::Bridge;
use crate::config::CoordinatorConfig;
use crate::sessions::SessionRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared by every axum handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub bridge: Arc<Bridge>,
    /// Parent of every session token
    pub shutdown: CancellationToken,
}
