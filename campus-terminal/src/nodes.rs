//! Sensor/camera nodes attached to this terminal
//!
//! The registry keeps the live record of every configured node and talks to
//! the devices through a [`NodeSource`]. The HTTP source speaks the node
//! firmware API: `/environment`, `/capture`, `/stream`, `/status`, `/rotate`.

use crate::config::{NodeEndpoint, NodesConfig};
use crate::error::NodeError;
use async_trait::async_trait;
use campus_protocol::{EnvReading, NodeDetail, NodeId, NodeState};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest MJPEG prefix read while looking for one frame
const STREAM_READ_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Data,
    Control,
}

/// Device self-description returned by `GET /status`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub device_type: String,
    pub ip: Option<String>,
    pub rssi: Option<i32>,
    pub uptime_ms: Option<u64>,
    pub capabilities: Vec<String>,
}

#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn environment(&self, node: &NodeEndpoint) -> Result<EnvReading, NodeError>;
    async fn capture(&self, node: &NodeEndpoint) -> Result<Vec<u8>, NodeError>;
    async fn status(&self, node: &NodeEndpoint) -> Result<DeviceInfo, NodeError>;
    async fn rotate(&self, node: &NodeEndpoint, angle: u8) -> Result<(), NodeError>;
}

#[derive(Debug, Clone)]
struct NodeRecord {
    endpoint: NodeEndpoint,
    role: NodeRole,
    detail: NodeDetail,
}

pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
    source: Arc<dyn NodeSource>,
}

impl NodeRegistry {
    pub fn new(config: &NodesConfig, source: Arc<dyn NodeSource>) -> Self {
        let registry = Self {
            nodes: RwLock::new(BTreeMap::new()),
            source,
        };
        registry.reload(config);
        registry
    }

    /// Replace the node set. Runtime state of nodes that keep their id and
    /// address is preserved.
    pub fn reload(&self, config: &NodesConfig) {
        let mut nodes = self.nodes.write();
        let mut next = BTreeMap::new();

        let configured = config
            .data_nodes
            .iter()
            .map(|(id, ep)| (id, ep, NodeRole::Data))
            .chain(config.control_nodes.iter().map(|(id, ep)| (id, ep, NodeRole::Control)));

        for (id, endpoint, role) in configured {
            let detail = match nodes.get(id) {
                Some(old) if old.endpoint.ip == endpoint.ip && old.endpoint.port == endpoint.port => {
                    old.detail.clone()
                }
                _ => NodeDetail {
                    capabilities: endpoint.capabilities.clone(),
                    ..NodeDetail::default()
                },
            };
            next.insert(
                id.clone(),
                NodeRecord {
                    endpoint: endpoint.clone(),
                    role,
                    detail,
                },
            );
        }

        info!(nodes = next.len(), "Node registry loaded");
        *nodes = next;
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().cloned().collect()
    }

    pub fn data_nodes(&self) -> Vec<NodeId> {
        self.ids_with_role(NodeRole::Data)
    }

    pub fn control_nodes(&self) -> Vec<NodeId> {
        self.ids_with_role(NodeRole::Control)
    }

    fn ids_with_role(&self, role: NodeRole) -> Vec<NodeId> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, record)| record.role == role)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().contains_key(id)
    }

    fn endpoint(&self, id: &NodeId) -> Result<NodeEndpoint, NodeError> {
        self.nodes
            .read()
            .get(id)
            .map(|record| record.endpoint.clone())
            .ok_or_else(|| NodeError::Unknown(id.clone()))
    }

    pub fn states(&self) -> BTreeMap<NodeId, NodeState> {
        self.nodes
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.detail.status))
            .collect()
    }

    pub fn details(&self) -> BTreeMap<NodeId, NodeDetail> {
        self.nodes
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.detail.clone()))
            .collect()
    }

    pub fn detail(&self, id: &NodeId) -> Option<NodeDetail> {
        self.nodes.read().get(id).map(|record| record.detail.clone())
    }

    fn with_detail(&self, id: &NodeId, change: impl FnOnce(&mut NodeDetail)) {
        if let Some(record) = self.nodes.write().get_mut(id) {
            change(&mut record.detail);
        }
    }

    pub fn mark_error(&self, id: &NodeId, error: impl Into<String>) {
        let error = error.into();
        debug!(node = %id, error = %error, "Node marked as error");
        self.with_detail(id, |detail| {
            detail.status = NodeState::Error;
            detail.error = Some(error);
        });
    }

    /// Record a delivered detection: online, last count and environment
    pub fn record_result(&self, id: &NodeId, count: u32, env: Option<&EnvReading>) {
        let now = Utc::now();
        self.with_detail(id, |detail| {
            detail.status = NodeState::Online;
            detail.error = None;
            detail.last_seen = Some(now);
            detail.detection_count = count;
            detail.last_capture = Some(now);
            if let Some(env) = env {
                apply_environment(detail, env);
            }
        });
    }

    /// Record delivered readings. The node's status is left alone.
    pub fn record_environment(&self, id: &NodeId, env: &EnvReading) {
        let now = Utc::now();
        self.with_detail(id, |detail| {
            detail.last_seen = Some(now);
            apply_environment(detail, env);
        });
    }

    /// Most recent CO2 level reported by any node
    pub fn latest_co2(&self) -> Option<u32> {
        self.nodes
            .read()
            .values()
            .filter_map(|record| Some((record.detail.last_seen?, record.detail.co2_level?)))
            .max_by_key(|(seen, _)| *seen)
            .map(|(_, level)| level)
    }

    /// Environmental reading with `retries` extra attempts
    pub async fn fetch_environment(&self, id: &NodeId, retries: u32) -> Result<EnvReading, NodeError> {
        let endpoint = self.endpoint(id)?;
        let mut attempt = 0;
        loop {
            match self.source.environment(&endpoint).await {
                Ok(reading) => return Ok(reading),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    debug!(node = %id, attempt, error = %e, "Retrying environment fetch");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// JPEG frame with `retries` extra attempts
    pub async fn capture_image(&self, id: &NodeId, retries: u32) -> Result<Vec<u8>, NodeError> {
        let endpoint = self.endpoint(id)?;
        let mut attempt = 0;
        loop {
            match self.source.capture(&endpoint).await {
                Ok(frame) => return Ok(frame),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    debug!(node = %id, attempt, error = %e, "Retrying capture");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reachability probe through `GET /status`; updates the record either way
    pub async fn probe(&self, id: &NodeId) -> NodeState {
        let endpoint = match self.endpoint(id) {
            Ok(endpoint) => endpoint,
            Err(_) => return NodeState::Unknown,
        };

        match self.source.status(&endpoint).await {
            Ok(info) => {
                let now = Utc::now();
                self.with_detail(id, |detail| {
                    detail.status = NodeState::Online;
                    detail.error = None;
                    detail.last_seen = Some(now);
                    detail.device_type = info.device_type;
                    detail.ip = info.ip.or_else(|| Some(endpoint.ip.clone()));
                    detail.rssi = info.rssi;
                    detail.uptime_ms = info.uptime_ms;
                    if !info.capabilities.is_empty() {
                        detail.capabilities = info.capabilities;
                    }
                });
                NodeState::Online
            }
            Err(e) => {
                debug!(node = %id, error = %e, "Node unreachable");
                self.with_detail(id, |detail| {
                    detail.status = NodeState::Offline;
                    detail.error = Some(e.to_string());
                });
                NodeState::Offline
            }
        }
    }

    /// Point a rotatable light. Nodes that advertise capabilities must list `rotate`.
    pub async fn rotate_light(&self, id: &NodeId, angle: u8) -> Result<(), NodeError> {
        let endpoint = self.endpoint(id)?;
        let capabilities = self
            .detail(id)
            .map(|detail| detail.capabilities)
            .unwrap_or_default();
        if !capabilities.is_empty() && !capabilities.iter().any(|c| c == "rotate") {
            return Err(NodeError::Unsupported(id.clone(), "rotate"));
        }
        self.source.rotate(&endpoint, angle).await?;
        info!(node = %id, angle, "Light rotated");
        Ok(())
    }
}

/// Node firmware HTTP API
pub struct HttpNodeSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNodeSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, NodeError> {
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        if !response.status().is_success() {
            return Err(NodeError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    async fn stream_frame(&self, node: &NodeEndpoint) -> Result<Vec<u8>, NodeError> {
        let mut response = self.get(&format!("{}/stream", node.base_url())).await?;
        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);
            if let Some(frame) = extract_jpeg(&buffer) {
                return Ok(frame.to_vec());
            }
            if buffer.len() > STREAM_READ_LIMIT {
                break;
            }
        }
        Err(NodeError::NoFrame)
    }
}

#[async_trait]
impl NodeSource for HttpNodeSource {
    async fn environment(&self, node: &NodeEndpoint) -> Result<EnvReading, NodeError> {
        let body: Value = self
            .get(&format!("{}/environment", node.base_url()))
            .await?
            .json()
            .await?;
        Ok(parse_environment(&body))
    }

    async fn capture(&self, node: &NodeEndpoint) -> Result<Vec<u8>, NodeError> {
        match self.get(&format!("{}/capture", node.base_url())).await {
            Ok(response) => {
                let body = response.bytes().await?;
                match extract_jpeg(&body) {
                    Some(frame) => return Ok(frame.to_vec()),
                    None => warn!(node = %node.ip, "Capture returned no JPEG, trying stream"),
                }
            }
            Err(e) => debug!(node = %node.ip, error = %e, "Capture failed, trying stream"),
        }
        self.stream_frame(node).await
    }

    async fn status(&self, node: &NodeEndpoint) -> Result<DeviceInfo, NodeError> {
        let body: Value = self.get(&format!("{}/status", node.base_url())).await?.json().await?;
        Ok(parse_device(&body))
    }

    async fn rotate(&self, node: &NodeEndpoint, angle: u8) -> Result<(), NodeError> {
        self.get(&format!("{}/rotate?angle={}", node.base_url(), angle)).await?;
        Ok(())
    }
}

fn apply_environment(detail: &mut NodeDetail, env: &EnvReading) {
    detail.temperature = env.temperature.or(detail.temperature);
    detail.humidity = env.humidity.or(detail.humidity);
    detail.co2_level = env.co2_level.or(detail.co2_level);
}

/// First complete `FFD8 … FFD9` frame in `bytes`
pub fn extract_jpeg(bytes: &[u8]) -> Option<&[u8]> {
    let start = bytes.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = bytes[start + 2..].windows(2).position(|w| w == [0xFF, 0xD9])?;
    Some(&bytes[start..start + 2 + end + 2])
}

/// Accepts `{data: {temperature, humidity, co2_level}}` as well as the flat form
pub fn parse_environment(body: &Value) -> EnvReading {
    let data = body.get("data").filter(|d| d.is_object()).unwrap_or(body);
    EnvReading {
        temperature: data.get("temperature").and_then(Value::as_f64).map(|v| v as f32),
        humidity: data.get("humidity").and_then(Value::as_f64).map(|v| v as f32),
        co2_level: data
            .get("co2_level")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.round() as u32),
    }
}

fn parse_device(body: &Value) -> DeviceInfo {
    let device = body.get("device").unwrap_or(body);
    DeviceInfo {
        device_type: device
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        ip: device.get("ip").and_then(Value::as_str).map(str::to_string),
        rssi: device.get("rssi").and_then(Value::as_i64).map(|v| v as i32),
        uptime_ms: device.get("uptime_ms").and_then(Value::as_u64),
        capabilities: device
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| caps.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
    }
}
