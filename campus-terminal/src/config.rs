//! Terminal configuration
//!
//! Handles:
//! - TOML file in the OS config dir (override with `CAMPUS_TERMINAL_CONFIG`)
//! - Live copy shared by every component, persisted on change
//! - Partial updates pushed from the coordinator (`update_config`)
//! - Change detection through file mtime and a structural fingerprint

use crate::error::ConfigError;
use campus_protocol::{DetectionMode, NodeId, TerminalId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "CAMPUS_TERMINAL_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub terminal_id: TerminalId,
    pub server_url: String,
    /// HTTP fallback for detection results, e.g. `http://cloud:8000/api/upload/`
    pub api_url: String,
    pub mode: DetectionMode,
    /// Pull cycle period in seconds
    pub interval: u64,
    pub preload_model: bool,
    pub save_image: bool,
    pub capture_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_addr: Option<String>,
    pub log_capacity: usize,
    pub nodes: NodesConfig,
    pub transport: TransportConfig,
    pub detection: DetectionConfig,
    pub monitor: MonitorConfig,
    pub buzzer: BuzzerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    pub data_nodes: BTreeMap<NodeId, NodeEndpoint>,
    pub control_nodes: BTreeMap<NodeId, NodeEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub ip: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_node_port() -> u16 {
    80
}

impl NodeEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            name: None,
            capabilities: Vec::new(),
        }
    }

    pub fn base_url(&self) -> String {
        if self.ip.starts_with("http://") || self.ip.starts_with("https://") {
            format!("{}:{}", self.ip.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.ip, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// `0` retries forever
    pub max_reconnect_attempts: u32,
    pub send_timeout_secs: u64,
    /// Heartbeat periods without any inbound frame before the link is dropped
    pub missed_heartbeats: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            connect_timeout_secs: 15,
            base_delay_secs: 2,
            max_delay_secs: 60,
            max_reconnect_attempts: 100,
            send_timeout_secs: 5,
            missed_heartbeats: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub max_errors: u32,
    pub error_backoff_ms: u64,
    pub model_wait_secs: u64,
    pub image_retries: u32,
    pub env_retries: u32,
    pub fetch_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector_program: Option<String>,
    pub detector_args: Vec<String>,
    pub detector_timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            error_backoff_ms: 2000,
            model_wait_secs: 30,
            image_retries: 2,
            env_retries: 1,
            fetch_timeout_secs: 5,
            upload_timeout_secs: 5,
            detector_program: None,
            detector_args: Vec::new(),
            detector_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitor_interval: u64,
    pub status_push_interval: u64,
    pub node_ping_interval: u64,
    pub node_ping_batch: usize,
    pub co2_enabled: bool,
    /// Seconds between CO2 reads
    pub co2_read_interval: u64,
    /// File holding the eCO2 ppm value, e.g. the IIO `in_concentration_co2_input`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2_sensor_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: 3,
            status_push_interval: 10,
            node_ping_interval: 10,
            node_ping_batch: 3,
            co2_enabled: true,
            co2_read_interval: 30,
            co2_sensor_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuzzerConfig {
    /// sysfs GPIO `value` file; without it the buzzer is only logged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpio_value_path: Option<PathBuf>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            terminal_id: TerminalId::from("1"),
            server_url: "ws://127.0.0.1:8000".to_string(),
            api_url: "http://127.0.0.1:8000/api/upload/".to_string(),
            mode: DetectionMode::Push,
            interval: 60,
            preload_model: true,
            save_image: false,
            capture_dir: PathBuf::from("captures"),
            ingest_addr: None,
            log_capacity: 1000,
            nodes: NodesConfig::default(),
            transport: TransportConfig::default(),
            detection: DetectionConfig::default(),
            monitor: MonitorConfig::default(),
            buzzer: BuzzerConfig::default(),
        }
    }
}

impl TerminalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::Invalid("interval must be greater than zero".into()));
        }
        if self.monitor.monitor_interval == 0 || self.monitor.status_push_interval == 0 {
            return Err(ConfigError::Invalid("monitor cadence must be greater than zero".into()));
        }
        if self.monitor.node_ping_batch == 0 {
            return Err(ConfigError::Invalid("node_ping_batch must be at least 1".into()));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::Invalid("log_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Structural hash over the canonical JSON form
    pub fn fingerprint(&self) -> u64 {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        hasher.finish()
    }
}

/// Live configuration shared by the agent components.
///
/// Every change (updates, merges, reloads, saves) runs under `writer`, so
/// concurrent read-modify-write cycles never lose each other's edits.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<TerminalConfig>,
    modified: Mutex<Option<SystemTime>>,
    writer: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    /// `CAMPUS_TERMINAL_CONFIG`, else `<config dir>/campus-terminal/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("campus-terminal");
        path.push("config.toml");
        Ok(path)
    }

    /// Load the file at `path`; a missing file yields the defaults
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let (config, modified) = match read_file(&path).await? {
            Some((config, modified)) => (config, modified),
            None => {
                info!(path = %path.display(), "No config file, using defaults");
                (TerminalConfig::default(), None)
            }
        };
        config.validate()?;

        Ok(Self {
            path,
            current: RwLock::new(config),
            modified: Mutex::new(modified),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> TerminalConfig {
        self.current.read().clone()
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let _writer = self.writer.lock().await;
        self.write_file().await
    }

    async fn write_file(&self) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&*self.current.read())?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: self.path.display().to_string(),
                source,
            })?;

        // Our own write must not look like an external edit
        *self.modified.lock() = file_mtime(&self.path).await;
        Ok(())
    }

    /// Apply `change`, validate and persist. The live copy is untouched on error.
    pub async fn update<F>(&self, change: F) -> Result<TerminalConfig, ConfigError>
    where
        F: FnOnce(&mut TerminalConfig),
    {
        let _writer = self.writer.lock().await;
        self.apply(change).await
    }

    async fn apply<F>(&self, change: F) -> Result<TerminalConfig, ConfigError>
    where
        F: FnOnce(&mut TerminalConfig),
    {
        let mut next = self.snapshot();
        change(&mut next);
        next.validate()?;
        *self.current.write() = next.clone();
        self.write_file().await?;
        Ok(next)
    }

    /// Deep-merge a partial JSON object into the config
    pub async fn merge(&self, patch: &Value) -> Result<TerminalConfig, ConfigError> {
        if !patch.is_object() {
            return Err(ConfigError::Invalid("config patch must be an object".into()));
        }
        let _writer = self.writer.lock().await;
        let mut value = serde_json::to_value(self.snapshot())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        merge_json(&mut value, patch);
        let next: TerminalConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.apply(|config| *config = next).await
    }

    /// Re-read the file when its modification time moved. Returns whether the
    /// live copy changed.
    pub async fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let _writer = self.writer.lock().await;
        let mtime = file_mtime(&self.path).await;
        if mtime.is_none() || mtime == *self.modified.lock() {
            return Ok(false);
        }

        let Some((config, modified)) = read_file(&self.path).await? else {
            return Ok(false);
        };
        *self.modified.lock() = modified;
        config.validate()?;

        let mut current = self.current.write();
        if *current == config {
            return Ok(false);
        }
        debug!(path = %self.path.display(), "Config file changed on disk");
        *current = config;
        Ok(true)
    }
}

async fn read_file(path: &Path) -> Result<Option<(TerminalConfig, Option<SystemTime>)>, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let config: TerminalConfig = toml::from_str(&content)?;
    Ok(Some((config, file_mtime(path).await)))
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => merge_json(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
