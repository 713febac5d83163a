use campus_protocol::{NodeId, TerminalId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "CAMPUS_COORDINATOR_CONFIG";
pub const API_KEY_ENV: &str = "CAMPUS_COORDINATOR_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub bind: String,
    /// JSON snapshot of the store; `None` keeps everything in memory
    pub data_file: Option<PathBuf>,
    pub heartbeat_timeout_secs: u64,
    pub liveness_check_secs: u64,
    pub status_cache_ttl_secs: u64,
    pub flush_interval_secs: u64,
    /// Recent log lines kept per terminal for late observers
    pub log_backlog: usize,
    /// Required as `x-api-key` on `/terminals` routes when set
    pub api_key: Option<String>,
    pub terminals: BTreeMap<TerminalId, TerminalConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TerminalConf {
    pub name: Option<String>,
    pub nodes: BTreeMap<NodeId, NodeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConf {
    pub name: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            data_file: Some(PathBuf::from("coordinator-data.json")),
            heartbeat_timeout_secs: 120,
            liveness_check_secs: 30,
            status_cache_ttl_secs: 60,
            flush_interval_secs: 30,
            log_backlog: 100,
            api_key: None,
            terminals: BTreeMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn liveness_check(&self) -> Duration {
        Duration::from_secs(self.liveness_check_secs.max(1))
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// Config from `CAMPUS_COORDINATOR_CONFIG` (default `coordinator.yaml`), API key
/// overridable through `CAMPUS_COORDINATOR_API_KEY`
pub async fn load_config() -> CoordinatorConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "coordinator.yaml".into());
    let mut config = load_config_from(Path::new(&path)).await;
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        config.api_key = Some(key);
    }
    config
}

/// A missing, empty or invalid file falls back to the defaults
pub async fn load_config_from(path: &Path) -> CoordinatorConfig {
    if !path.exists() {
        info!(path = %path.display(), "No coordinator config, using defaults");
        return CoordinatorConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return CoordinatorConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Invalid coordinator config, using defaults");
        CoordinatorConfig::default()
    })
}
