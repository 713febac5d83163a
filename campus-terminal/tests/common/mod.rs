//! Shared stubs for the terminal integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use campus_protocol::{EnvReading, Message, NodeId};
use campus_terminal::config::{ConfigStore, NodeEndpoint, TerminalConfig};
use campus_terminal::detection::model::{InferenceModel, ModelLoader, ModelManager};
use campus_terminal::detection::upload::Uploader;
use campus_terminal::detection::DetectionScheduler;
use campus_terminal::error::{DetectionError, NodeError};
use campus_terminal::monitor::metrics::{ResourceProbe, ResourceSample};
use campus_terminal::nodes::{DeviceInfo, NodeRegistry, NodeSource};
use campus_terminal::transport::TelemetrySink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const JPEG: &[u8] = &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];

/// Config store in a fresh temp dir; keep the `TempDir` alive for the test
pub async fn config_store(change: impl FnOnce(&mut TerminalConfig)) -> (TempDir, Arc<ConfigStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::load(dir.path().join("config.toml")).await.unwrap();
    store
        .update(|c| {
            c.capture_dir = dir.path().join("captures");
            c.api_url = String::new();
            c.detection.error_backoff_ms = 20;
            c.detection.model_wait_secs = 1;
            change(c);
        })
        .await
        .unwrap();
    (dir, Arc::new(store))
}

pub fn with_data_nodes(config: &mut TerminalConfig, ids: &[&str]) {
    for (i, id) in ids.iter().enumerate() {
        config
            .nodes
            .data_nodes
            .insert(NodeId::from(*id), NodeEndpoint::new(format!("10.0.0.{}", i + 1), 80));
    }
}

#[derive(Clone, Default)]
pub struct NodeScript {
    pub env: Option<EnvReading>,
    pub image: bool,
}

/// Node devices answering from a per-node script
#[derive(Default)]
pub struct ScriptedNodes {
    scripts: Mutex<HashMap<String, NodeScript>>,
    pub captures: AtomicU32,
    pub rotations: Mutex<Vec<(String, u8)>>,
}

impl ScriptedNodes {
    pub fn set(&self, ip: &str, script: NodeScript) {
        self.scripts.lock().insert(ip.to_string(), script);
    }

    fn script(&self, node: &NodeEndpoint) -> NodeScript {
        self.scripts.lock().get(&node.ip).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl NodeSource for ScriptedNodes {
    async fn environment(&self, node: &NodeEndpoint) -> Result<EnvReading, NodeError> {
        self.script(node).env.ok_or(NodeError::Status(503))
    }

    async fn capture(&self, node: &NodeEndpoint) -> Result<Vec<u8>, NodeError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.script(node).image {
            Ok(JPEG.to_vec())
        } else {
            Err(NodeError::NoFrame)
        }
    }

    async fn status(&self, _node: &NodeEndpoint) -> Result<DeviceInfo, NodeError> {
        Ok(DeviceInfo {
            device_type: "camera".into(),
            ..DeviceInfo::default()
        })
    }

    async fn rotate(&self, node: &NodeEndpoint, angle: u8) -> Result<(), NodeError> {
        self.rotations.lock().push((node.ip.clone(), angle));
        Ok(())
    }
}

/// Detector that always sees `count` objects
pub struct FixedModel(pub u32);

impl InferenceModel for FixedModel {
    fn detect(&self, _jpeg: &[u8]) -> Result<u32, DetectionError> {
        Ok(self.0)
    }
}

pub struct StubLoader {
    pub count: u32,
    pub fail: AtomicBool,
}

impl StubLoader {
    pub fn new(count: u32) -> Arc<Self> {
        Arc::new(Self {
            count,
            fail: AtomicBool::new(false),
        })
    }
}

impl ModelLoader for StubLoader {
    fn load(&self) -> Result<Box<dyn InferenceModel>, DetectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DetectionError::ModelLoad("weights missing".into()));
        }
        Ok(Box::new(FixedModel(self.count)))
    }
}

/// Resource probe that fails its first `failures` samples
#[derive(Default)]
pub struct ScriptedProbe {
    pub failures: AtomicU32,
    pub samples: AtomicU32,
}

impl ScriptedProbe {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            samples: AtomicU32::new(0),
        })
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&self) -> anyhow::Result<ResourceSample> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("probe unavailable");
        }
        Ok(ResourceSample {
            cpu_usage: 12.5,
            uptime_seconds: 3600,
            ..ResourceSample::default()
        })
    }
}

/// Link stand-in recording what would have been sent
pub struct RecordingSink {
    pub connected: AtomicBool,
    pub sent: Mutex<Vec<Message>>,
}

impl RecordingSink {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_of(&self, kind: &str) -> Vec<Message> {
        self.sent.lock().iter().filter(|m| m.kind() == kind).cloned().collect()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent.lock().push(message);
        true
    }
}

pub struct Rig {
    pub store: Arc<ConfigStore>,
    pub nodes: Arc<NodeRegistry>,
    pub source: Arc<ScriptedNodes>,
    pub loader: Arc<StubLoader>,
    pub probe: Arc<ScriptedProbe>,
    pub sink: Arc<RecordingSink>,
    pub scheduler: Arc<DetectionScheduler>,
}

/// Scheduler over scripted nodes, a stub model and a recording link
pub fn rig(store: Arc<ConfigStore>, source: Arc<ScriptedNodes>, probe: Arc<ScriptedProbe>, sink: Arc<RecordingSink>) -> Rig {
    let config = store.snapshot();
    let nodes = Arc::new(NodeRegistry::new(&config.nodes, source.clone()));
    let loader = StubLoader::new(3);
    let model = Arc::new(ModelManager::new(loader.clone(), Duration::from_secs(1)));
    let uploader = Uploader::new(sink.clone(), config.api_url.clone(), Duration::from_secs(2));
    let scheduler = DetectionScheduler::new(store.clone(), nodes.clone(), model, uploader, probe.clone());
    Rig {
        store,
        nodes,
        source,
        loader,
        probe,
        sink,
        scheduler,
    }
}
