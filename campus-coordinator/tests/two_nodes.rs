//! A real terminal agent reporting two nodes, one of which cannot capture.

mod common;

use async_trait::async_trait;
use campus_devkit::{init_logging, wait_until};
use campus_protocol::{DetectionMode, EnvReading, NodeId, NodeState, TerminalId};
use campus_terminal::config::{ConfigStore, NodeEndpoint};
use campus_terminal::detection::model::{InferenceModel, ModelLoader};
use campus_terminal::error::{DetectionError, NodeError};
use campus_terminal::logbook::LogBook;
use campus_terminal::monitor::metrics::{ResourceProbe, ResourceSample};
use campus_terminal::nodes::{DeviceInfo, NodeSource};
use campus_terminal::{Agent, AgentParts};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BROKEN_IP: &str = "10.0.0.1";

/// Node 2 answers everything. Node 1 never yields a frame and, unless
/// `sensors_up`, no readings either.
struct Field {
    sensors_up: bool,
}

#[async_trait]
impl NodeSource for Field {
    async fn environment(&self, node: &NodeEndpoint) -> Result<EnvReading, NodeError> {
        if node.ip == BROKEN_IP {
            if !self.sensors_up {
                return Err(NodeError::Status(503));
            }
            return Ok(EnvReading {
                temperature: Some(17.0),
                humidity: Some(60.0),
                co2_level: Some(1_250),
            });
        }
        Ok(EnvReading {
            temperature: Some(22.0),
            humidity: Some(48.0),
            co2_level: None,
        })
    }

    async fn capture(&self, node: &NodeEndpoint) -> Result<Vec<u8>, NodeError> {
        if node.ip == BROKEN_IP {
            return Err(NodeError::NoFrame);
        }
        Ok(vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9])
    }

    async fn status(&self, node: &NodeEndpoint) -> Result<DeviceInfo, NodeError> {
        if node.ip == BROKEN_IP {
            return Err(NodeError::Status(503));
        }
        Ok(DeviceInfo {
            device_type: "camera".into(),
            ..DeviceInfo::default()
        })
    }

    async fn rotate(&self, _node: &NodeEndpoint, _angle: u8) -> Result<(), NodeError> {
        Ok(())
    }
}

struct ThreePeople;

impl InferenceModel for ThreePeople {
    fn detect(&self, _jpeg: &[u8]) -> Result<u32, DetectionError> {
        Ok(3)
    }
}

struct Loader;

impl ModelLoader for Loader {
    fn load(&self) -> Result<Box<dyn InferenceModel>, DetectionError> {
        Ok(Box::new(ThreePeople))
    }
}

struct QuietProbe;

impl ResourceProbe for QuietProbe {
    fn sample(&self) -> anyhow::Result<ResourceSample> {
        Ok(ResourceSample {
            cpu_usage: 5.0,
            ..ResourceSample::default()
        })
    }
}

struct FieldRun {
    agent_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    token: CancellationToken,
    _dir: tempfile::TempDir,
}

impl FieldRun {
    async fn stop(self) {
        self.token.cancel();
        self.agent_task.await.unwrap().unwrap();
    }
}

async fn run_agent(running: &Running, field: Field) -> FieldRun {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigStore::load(dir.path().join("config.toml")).await.unwrap();
    let (ws, http) = (running.ws.clone(), running.http.clone());
    let captures = dir.path().join("captures");
    config
        .update(move |c| {
            c.terminal_id = TerminalId::from("1");
            c.server_url = ws;
            c.api_url = format!("{http}/api/upload/");
            c.mode = DetectionMode::Pull;
            // one cycle for the whole test
            c.interval = 600;
            c.capture_dir = captures;
            c.transport.heartbeat_secs = 1;
            c.monitor.monitor_interval = 1;
            c.monitor.status_push_interval = 1;
            c.detection.error_backoff_ms = 20;
            c.detection.model_wait_secs = 2;
            c.nodes.data_nodes.insert(NodeId::from("1"), NodeEndpoint::new(BROKEN_IP, 80));
            c.nodes.data_nodes.insert(NodeId::from("2"), NodeEndpoint::new("10.0.0.2", 80));
        })
        .await
        .unwrap();
    let config = Arc::new(config);

    let parts = AgentParts {
        node_source: Arc::new(field),
        loader: Arc::new(Loader),
        probe: Arc::new(QuietProbe),
    };
    let agent = Arc::new(Agent::build(config, LogBook::new(100), parts).unwrap());
    let token = CancellationToken::new();
    let agent_task = tokio::spawn({
        let token = token.clone();
        async move { agent.run(token).await }
    });
    FieldRun {
        agent_task,
        token,
        _dir: dir,
    }
}

#[tokio::test]
async fn one_failing_node_does_not_hide_the_other() {
    init_logging();
    let running = start(campus_config()).await;
    let field = run_agent(&running, Field { sensors_up: false }).await;

    let store = running.state.bridge.store();
    let terminal = TerminalId::from("1");
    let settled = wait_until(Duration::from_secs(10), || {
        let Some(record) = store.terminal(&terminal) else {
            return false;
        };
        let broken = record.nodes[&NodeId::from("1")].status;
        record.online
            && record.nodes[&NodeId::from("2")].detected_count == Some(3)
            && matches!(broken, NodeState::Error | NodeState::Offline)
    })
    .await;
    assert!(settled, "coordinator never saw the cycle: {:?}", store.terminal(&terminal));

    let record = store.terminal(&terminal).unwrap();
    let healthy = &record.nodes[&NodeId::from("2")];
    assert_eq!(healthy.status, NodeState::Online);
    assert_eq!(healthy.temperature, Some(22.0));
    let broken = &record.nodes[&NodeId::from("1")];
    assert_eq!(broken.detected_count, None);
    assert!(broken.last_error.is_some());
    assert_eq!(record.mode, DetectionMode::Pull);

    let samples = store.samples(&terminal);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].node_id, NodeId::from("2"));
    assert_eq!(samples[0].detected_count, 3);

    field.stop().await;
    assert!(wait_until(Duration::from_secs(3), || !store.terminal(&terminal).unwrap().online).await);
    running.stop().await;
}

#[tokio::test]
async fn readings_without_a_frame_leave_the_node_in_error() {
    init_logging();
    let running = start(campus_config()).await;
    let field = run_agent(&running, Field { sensors_up: true }).await;

    let store = running.state.bridge.store();
    let terminal = TerminalId::from("1");
    let settled = wait_until(Duration::from_secs(10), || {
        let Some(record) = store.terminal(&terminal) else {
            return false;
        };
        let image_failed = &record.nodes[&NodeId::from("1")];
        record.nodes[&NodeId::from("2")].detected_count == Some(3) && image_failed.temperature == Some(17.0)
    })
    .await;
    assert!(settled, "coordinator never saw the cycle: {:?}", store.terminal(&terminal));

    let record = store.terminal(&terminal).unwrap();
    let image_failed = &record.nodes[&NodeId::from("1")];
    assert!(matches!(image_failed.status, NodeState::Error | NodeState::Offline));
    assert_eq!(image_failed.detected_count, None);
    assert!(image_failed.last_error.is_some());
    assert_eq!(image_failed.humidity, Some(60.0));
    assert_eq!(image_failed.co2_level, Some(1_250));

    let healthy = &record.nodes[&NodeId::from("2")];
    assert_eq!(healthy.status, NodeState::Online);
    assert_eq!(healthy.detected_count, Some(3));

    let samples = store.samples(&terminal);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].node_id, NodeId::from("2"));

    // later status pushes agree with the report
    assert!(
        wait_until(Duration::from_secs(5), || {
            store
                .terminal(&terminal)
                .and_then(|r| r.last_status)
                .is_some_and(|s| matches!(s.nodes.get(&NodeId::from("1")), Some(NodeState::Error | NodeState::Offline)))
        })
        .await
    );
    assert_ne!(store.terminal(&terminal).unwrap().nodes[&NodeId::from("1")].status, NodeState::Online);

    field.stop().await;
    running.stop().await;
}
