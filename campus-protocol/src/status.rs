//! Status snapshot pushed by terminals (`system_status`) and relayed to observers

use crate::ids::{NodeId, TerminalId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Capture strategy of a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Frames are delivered to the terminal from outside
    #[default]
    Push,
    /// The terminal polls its nodes on a timer
    Pull,
    Both,
    #[serde(rename = "none")]
    Idle,
}

impl DetectionMode {
    pub fn wants_push(self) -> bool {
        matches!(self, DetectionMode::Push | DetectionMode::Both)
    }

    pub fn wants_pull(self) -> bool {
        matches!(self, DetectionMode::Pull | DetectionMode::Both)
    }

    /// Mode implied by the set of running capture halves
    pub fn from_flags(push: bool, pull: bool) -> Self {
        match (push, pull) {
            (true, true) => DetectionMode::Both,
            (true, false) => DetectionMode::Push,
            (false, true) => DetectionMode::Pull,
            (false, false) => DetectionMode::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMode::Push => "push",
            DetectionMode::Pull => "pull",
            DetectionMode::Both => "both",
            DetectionMode::Idle => "none",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(DetectionMode::Push),
            "pull" => Ok(DetectionMode::Pull),
            "both" => Ok(DetectionMode::Both),
            "none" => Ok(DetectionMode::Idle),
            other => Err(format!("invalid detection mode: {other}")),
        }
    }
}

/// Lifecycle of the inference model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Reachability of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unknown,
    Online,
    Offline,
    Error,
}

impl NodeState {
    pub fn is_online(self) -> bool {
        self == NodeState::Online
    }
}

/// Health of the terminal's own CO2 sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Co2Status {
    Normal,
    Fault,
    #[default]
    Disconnected,
}

/// Full per-node view, as shown on dashboards
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDetail {
    pub status: NodeState,
    pub error: Option<String>,
    pub detection_count: u32,
    pub last_capture: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub device_type: String,
    pub ip: Option<String>,
    pub rssi: Option<i32>,
    pub uptime_ms: Option<u64>,
    pub capabilities: Vec<String>,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub co2_level: Option<u32>,
}

/// Rolling detection statistics of a terminal
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionStatsView {
    pub today_count: u64,
    pub total_count: u64,
    pub max_count: u32,
    pub avg_count: f64,
    pub last_day_reset: Option<NaiveDate>,
}

/// Point-in-time aggregate of terminal state.
///
/// Every field has a default so that partial snapshots from older terminals
/// still decode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub terminal_id: Option<TerminalId>,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub memory_total: u64,
    pub memory_available: u64,
    pub disk_usage: f32,
    pub disk_total: u64,
    pub disk_free: u64,
    pub system_uptime: u64,
    pub mode: DetectionMode,
    pub push_running: bool,
    pub pull_running: bool,
    pub pull_tripped: bool,
    pub model_loaded: bool,
    pub model_state: ModelState,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub node_details: BTreeMap<NodeId, NodeDetail>,
    pub detection_stats: DetectionStatsView,
    pub frames_processed: u64,
    pub cloud_connected: bool,
    /// Local sensor reading, else the latest one reported by a node (ppm)
    pub co2_level: Option<u32>,
    pub co2_status: Co2Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags_round_trip() {
        for mode in [DetectionMode::Push, DetectionMode::Pull, DetectionMode::Both, DetectionMode::Idle] {
            assert_eq!(DetectionMode::from_flags(mode.wants_push(), mode.wants_pull()), mode);
            assert_eq!(mode.as_str().parse::<DetectionMode>().unwrap(), mode);
        }
        assert!("sideways".parse::<DetectionMode>().is_err());
    }

    #[test]
    fn partial_snapshot_decodes_with_defaults() {
        let snap: StatusSnapshot =
            serde_json::from_str(r#"{"cpu_usage": 12.5, "mode": "none", "nodes": {"1": "online", "2": "error"}}"#).unwrap();
        assert_eq!(snap.cpu_usage, 12.5);
        assert_eq!(snap.mode, DetectionMode::Idle);
        assert_eq!(snap.nodes.get(&NodeId::from("2")), Some(&NodeState::Error));
        assert!(!snap.model_loaded);
        assert_eq!(snap.co2_status, Co2Status::Disconnected);
        assert_eq!(snap.co2_level, None);
    }
}
