//! Persisted terminal/node state and the append-only detection history.

use crate::config::CoordinatorConfig;
use crate::error::StoreError;
use campus_protocol::{Co2Status, DetectionMode, ModelState, NodeId, NodeReport, NodeState, StatusSnapshot, TerminalId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalRecord {
    pub name: Option<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub disk_usage: f32,
    pub system_uptime: u64,
    pub mode: DetectionMode,
    pub model_state: ModelState,
    pub cloud_connected: bool,
    pub co2_level: Option<u32>,
    pub co2_status: Co2Status,
    /// Most recent full snapshot, served when the status cache has expired
    pub last_status: Option<StatusSnapshot>,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRecord {
    pub name: Option<String>,
    pub status: NodeState,
    pub detected_count: Option<u32>,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub co2_level: Option<u32>,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub device_type: Option<String>,
    pub ip: Option<String>,
    pub rssi: Option<i32>,
    pub uptime_ms: Option<u64>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSample {
    pub terminal_id: TerminalId,
    pub node_id: NodeId,
    pub detected_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Coordinator-side persistence seam
pub trait TerminalStore: Send + Sync {
    fn terminal(&self, id: &TerminalId) -> Option<TerminalRecord>;

    fn terminals(&self) -> BTreeMap<TerminalId, TerminalRecord>;

    fn contains(&self, id: &TerminalId) -> bool {
        self.terminal(id).is_some()
    }

    /// Terminal a node is attached to
    fn node_owner(&self, node: &NodeId) -> Option<TerminalId>;

    fn set_online(&self, id: &TerminalId, online: bool, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Last-write-wins merge of a terminal status snapshot
    fn apply_status(&self, id: &TerminalId, status: &StatusSnapshot, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Returns the number of samples appended
    fn apply_node_reports(&self, id: &TerminalId, reports: &[NodeReport], at: DateTime<Utc>) -> Result<usize, StoreError>;

    fn samples(&self, id: &TerminalId) -> Vec<HistoricalSample>;

    fn flush(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    terminals: BTreeMap<TerminalId, TerminalRecord>,
    samples: Vec<HistoricalSample>,
}

/// In-memory store with an optional JSON snapshot on disk
pub struct MemoryStore {
    data: RwLock<StoreData>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl MemoryStore {
    /// Load the snapshot (if any) and register every configured terminal and node
    pub fn open(config: &CoordinatorConfig) -> Result<Self, StoreError> {
        let mut data = match &config.data_file {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                if raw.trim().is_empty() {
                    StoreData::default()
                } else {
                    serde_json::from_str(&raw)?
                }
            }
            _ => StoreData::default(),
        };

        for (id, conf) in &config.terminals {
            let record = data.terminals.entry(id.clone()).or_default();
            if conf.name.is_some() {
                record.name = conf.name.clone();
            }
            for (node_id, node_conf) in &conf.nodes {
                let node = record.nodes.entry(node_id.clone()).or_default();
                if node_conf.name.is_some() {
                    node.name = node_conf.name.clone();
                }
            }
        }

        info!(
            terminals = data.terminals.len(),
            samples = data.samples.len(),
            "Terminal store ready"
        );
        Ok(Self {
            data: RwLock::new(data),
            path: config.data_file.clone(),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn in_memory(config: &CoordinatorConfig) -> Self {
        let mut config = config.clone();
        config.data_file = None;
        match Self::open(&config) {
            Ok(store) => store,
            Err(_) => Self {
                data: RwLock::new(StoreData::default()),
                path: None,
                dirty: AtomicBool::new(false),
            },
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn with_terminal<R>(
        &self,
        id: &TerminalId,
        f: impl FnOnce(&mut TerminalRecord, &mut Vec<HistoricalSample>) -> R,
    ) -> Result<R, StoreError> {
        let mut data = self.data.write();
        let StoreData { terminals, samples } = &mut *data;
        let record = terminals
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownTerminal(id.clone()))?;
        let out = f(record, samples);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(out)
    }
}

impl TerminalStore for MemoryStore {
    fn terminal(&self, id: &TerminalId) -> Option<TerminalRecord> {
        self.data.read().terminals.get(id).cloned()
    }

    fn terminals(&self) -> BTreeMap<TerminalId, TerminalRecord> {
        self.data.read().terminals.clone()
    }

    fn contains(&self, id: &TerminalId) -> bool {
        self.data.read().terminals.contains_key(id)
    }

    fn node_owner(&self, node: &NodeId) -> Option<TerminalId> {
        self.data
            .read()
            .terminals
            .iter()
            .find(|(_, record)| record.nodes.contains_key(node))
            .map(|(id, _)| id.clone())
    }

    fn set_online(&self, id: &TerminalId, online: bool, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_terminal(id, |record, _| {
            if record.online != online {
                info!(terminal_id = %id, online, "Terminal presence changed");
            }
            record.online = online;
            if online {
                record.last_seen = Some(at);
            }
        })
    }

    fn apply_status(&self, id: &TerminalId, status: &StatusSnapshot, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_terminal(id, |record, _| {
            record.cpu_usage = status.cpu_usage;
            record.memory_usage = status.memory_usage;
            record.disk_usage = status.disk_usage;
            record.system_uptime = status.system_uptime;
            record.mode = status.mode;
            record.model_state = status.model_state;
            record.cloud_connected = status.cloud_connected;
            record.co2_level = status.co2_level;
            record.co2_status = status.co2_status;
            record.last_seen = Some(at);
            record.last_status = Some(status.clone());

            for (node_id, state) in &status.nodes {
                let Some(node) = record.nodes.get_mut(node_id) else {
                    debug!(terminal_id = %id, node = %node_id, "Status names an unregistered node");
                    continue;
                };
                node.status = *state;
                if let Some(detail) = status.node_details.get(node_id) {
                    node.last_error = detail.error.clone();
                    if detail.last_seen.is_some() {
                        node.last_seen = detail.last_seen;
                    }
                    if !detail.device_type.is_empty() {
                        node.device_type = Some(detail.device_type.clone());
                    }
                    node.ip = detail.ip.clone().or(node.ip.take());
                    node.rssi = detail.rssi.or(node.rssi);
                    node.uptime_ms = detail.uptime_ms.or(node.uptime_ms);
                    if !detail.capabilities.is_empty() {
                        node.capabilities = detail.capabilities.clone();
                    }
                    node.temperature = detail.temperature.or(node.temperature);
                    node.humidity = detail.humidity.or(node.humidity);
                    node.co2_level = detail.co2_level.or(node.co2_level);
                }
            }
        })
    }

    fn apply_node_reports(&self, id: &TerminalId, reports: &[NodeReport], at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_terminal(id, |record, samples| {
            let mut appended = 0;
            for report in reports {
                let Some(node) = record.nodes.get_mut(&report.id) else {
                    warn!(terminal_id = %id, node = %report.id, "Data for a node not attached to this terminal");
                    continue;
                };
                node.last_seen = Some(at);
                node.temperature = report.temperature.or(node.temperature);
                node.humidity = report.humidity.or(node.humidity);
                node.co2_level = report.co2_level.or(node.co2_level);
                if let Some(error) = &report.error {
                    node.status = NodeState::Error;
                    node.last_error = Some(error.clone());
                    continue;
                }
                // readings alone do not prove the camera works
                if let Some(count) = report.detected_count {
                    node.status = NodeState::Online;
                    node.last_error = None;
                    node.detected_count = Some(count);
                    samples.push(HistoricalSample {
                        terminal_id: id.clone(),
                        node_id: report.id.clone(),
                        detected_count: count,
                        timestamp: at,
                    });
                    appended += 1;
                }
            }
            appended
        })
    }

    fn samples(&self, id: &TerminalId) -> Vec<HistoricalSample> {
        self.data
            .read()
            .samples
            .iter()
            .filter(|s| &s.terminal_id == id)
            .cloned()
            .collect()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let json = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data)
        };
        let result = json.map_err(StoreError::from).and_then(|json| {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        });
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }
}
