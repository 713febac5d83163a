//! Handlers for every command the coordinator can send

use super::{CommandRegistry, Params};
use crate::actuators::{Buzzer, BuzzerPattern};
use crate::config::{ConfigStore, NodeEndpoint, NodesConfig};
use crate::detection::DetectionScheduler;
use crate::logbook::LogBook;
use crate::monitor::SystemMonitor;
use crate::nodes::NodeRegistry;
use anyhow::{anyhow, bail, Context, Result};
use campus_protocol::{CommandName, DetectionMode, NodeId};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

const DEFAULT_LOG_COUNT: usize = 100;

/// Everything a handler may act on
#[derive(Clone)]
pub struct Controls {
    pub config: Arc<ConfigStore>,
    pub scheduler: Arc<DetectionScheduler>,
    pub nodes: Arc<NodeRegistry>,
    pub monitor: Arc<SystemMonitor>,
    pub logbook: LogBook,
    pub buzzer: Arc<Buzzer>,
}

pub fn registry(controls: Controls) -> CommandRegistry<Controls> {
    let mut registry = CommandRegistry::new(controls);
    registry.register(CommandName::Start, start);
    registry.register(CommandName::Stop, stop);
    registry.register(CommandName::SetMode, set_mode);
    registry.register(CommandName::SetInterval, set_interval);
    registry.register(CommandName::UpdateNodes, update_nodes);
    registry.register(CommandName::Restart, restart);
    registry.register(CommandName::GetStatus, get_status);
    registry.register(CommandName::GetConfig, get_config);
    registry.register(CommandName::GetLogs, get_logs);
    registry.register(CommandName::UpdateConfig, update_config);
    registry.register(CommandName::Buzzer, buzzer);
    registry.register(CommandName::RotateLight, rotate_light);
    registry
}

fn mode_param(params: &Params, default: Option<DetectionMode>) -> Result<DetectionMode> {
    match params.get("mode") {
        Some(Value::String(mode)) => mode.parse().map_err(|e: String| anyhow!(e)),
        Some(other) => bail!("mode must be a string, got {other}"),
        None => default.ok_or_else(|| anyhow!("missing parameter: mode")),
    }
}

fn u64_param(params: &Params, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .map(Some)
            .ok_or_else(|| anyhow!("{key} must be a non-negative number")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a number")),
        Some(other) => bail!("{key} must be a number, got {other}"),
    }
}

fn running(scheduler: &DetectionScheduler) -> Value {
    json!({
        "mode": scheduler.mode(),
        "push_running": scheduler.push_running(),
        "pull_running": scheduler.pull_running(),
    })
}

async fn start(ctx: Controls, params: Params) -> Result<Value> {
    let which = mode_param(&params, Some(DetectionMode::Both))?;
    ctx.scheduler.start(which).await?;
    ctx.monitor.request_push();
    Ok(running(&ctx.scheduler))
}

async fn stop(ctx: Controls, params: Params) -> Result<Value> {
    let which = mode_param(&params, Some(DetectionMode::Both))?;
    ctx.scheduler.stop(which).await?;
    ctx.monitor.request_push();
    Ok(running(&ctx.scheduler))
}

async fn set_mode(ctx: Controls, params: Params) -> Result<Value> {
    let mode = mode_param(&params, None)?;
    let changed = ctx.scheduler.set_mode(mode).await?;
    ctx.monitor.request_push();
    let mut result = running(&ctx.scheduler);
    result["changed"] = json!(changed);
    Ok(result)
}

async fn set_interval(ctx: Controls, params: Params) -> Result<Value> {
    let secs = u64_param(&params, "interval")?.ok_or_else(|| anyhow!("missing parameter: interval"))?;
    if secs == 0 {
        bail!("interval must be greater than zero");
    }
    let changed = ctx.scheduler.set_interval(secs).await?;
    ctx.monitor.request_push();
    Ok(json!({ "interval": secs, "changed": changed }))
}

/// Accepts `{data_nodes, control_nodes}` or a flat `{id: endpoint}` map of data nodes
fn parse_nodes(value: &Value) -> Result<NodesConfig> {
    let object = value.as_object().ok_or_else(|| anyhow!("nodes must be an object"))?;
    if object.contains_key("data_nodes") || object.contains_key("control_nodes") {
        return serde_json::from_value(value.clone()).context("invalid nodes");
    }
    let data_nodes: BTreeMap<NodeId, NodeEndpoint> =
        serde_json::from_value(value.clone()).context("invalid nodes")?;
    Ok(NodesConfig {
        data_nodes,
        control_nodes: BTreeMap::new(),
    })
}

async fn update_nodes(ctx: Controls, params: Params) -> Result<Value> {
    let nodes = parse_nodes(params.get("nodes").ok_or_else(|| anyhow!("missing parameter: nodes"))?)?;
    let config = ctx
        .config
        .update(|c| c.nodes = nodes)
        .await
        .context("Failed to persist nodes")?;
    ctx.nodes.reload(&config.nodes);
    ctx.monitor.request_push();
    Ok(json!({
        "data_nodes": config.nodes.data_nodes.len(),
        "control_nodes": config.nodes.control_nodes.len(),
    }))
}

async fn restart(ctx: Controls, _params: Params) -> Result<Value> {
    let mode = ctx.scheduler.restart().await?;
    ctx.monitor.request_push();
    Ok(json!({ "restarted": true, "mode": mode }))
}

async fn get_status(ctx: Controls, _params: Params) -> Result<Value> {
    // a stale sample is still worth answering with
    if let Err(e) = ctx.monitor.refresh() {
        warn!(error = %e, "Resource sampling failed, answering with the last sample");
    }
    Ok(serde_json::to_value(ctx.monitor.snapshot())?)
}

async fn get_config(ctx: Controls, _params: Params) -> Result<Value> {
    Ok(serde_json::to_value(ctx.config.snapshot())?)
}

async fn get_logs(ctx: Controls, params: Params) -> Result<Value> {
    let count = u64_param(&params, "count")?.map_or(DEFAULT_LOG_COUNT, |n| n as usize);
    let logs = ctx.logbook.recent(count);
    Ok(json!({ "count": logs.len(), "logs": logs }))
}

async fn update_config(ctx: Controls, params: Params) -> Result<Value> {
    let patch = match params.get("config") {
        Some(config) => config.clone(),
        None => Value::Object(params),
    };
    let config = ctx.config.merge(&patch).await.context("Config update rejected")?;
    ctx.monitor.request_push();
    Ok(serde_json::to_value(config)?)
}

async fn buzzer(ctx: Controls, params: Params) -> Result<Value> {
    let pattern: BuzzerPattern = params
        .get("pattern")
        .and_then(Value::as_str)
        .unwrap_or("single")
        .parse()?;
    let repeat = u64_param(&params, "repeat")?.unwrap_or(1).clamp(1, 10) as u32;
    ctx.buzzer.play(pattern, repeat)?;
    Ok(json!({ "pattern": pattern.as_str(), "repeat": repeat }))
}

async fn rotate_light(ctx: Controls, params: Params) -> Result<Value> {
    let node_id = match params.get("node_id") {
        Some(Value::String(id)) => NodeId::from(id.as_str()),
        Some(Value::Number(n)) => NodeId::from(n.to_string()),
        _ => bail!("missing parameter: node_id"),
    };
    let angle = u64_param(&params, "angle")?.unwrap_or(90);
    if angle > 180 {
        bail!("angle must be between 0 and 180");
    }
    ctx.nodes.rotate_light(&node_id, angle as u8).await?;
    Ok(json!({ "node_id": node_id, "angle": angle }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_mode_param() {
        assert_eq!(mode_param(&params(json!({"mode": "pull"})), None).unwrap(), DetectionMode::Pull);
        assert_eq!(mode_param(&Params::new(), Some(DetectionMode::Both)).unwrap(), DetectionMode::Both);
        assert!(mode_param(&Params::new(), None).is_err());
        assert!(mode_param(&params(json!({"mode": "sideways"})), None).is_err());
    }

    #[test]
    fn test_numeric_params() {
        assert_eq!(u64_param(&params(json!({"interval": 30})), "interval").unwrap(), Some(30));
        assert_eq!(u64_param(&params(json!({"interval": "15"})), "interval").unwrap(), Some(15));
        assert!(u64_param(&params(json!({"interval": -4})), "interval").is_err());
        assert_eq!(u64_param(&Params::new(), "interval").unwrap(), None);
    }

    #[test]
    fn test_nodes_shapes() {
        let flat = parse_nodes(&json!({"1": {"ip": "10.0.0.1"}, "2": {"ip": "10.0.0.2", "port": 8080}})).unwrap();
        assert_eq!(flat.data_nodes.len(), 2);
        assert_eq!(flat.data_nodes[&NodeId::from("2")].port, 8080);

        let split = parse_nodes(&json!({
            "data_nodes": {"1": {"ip": "10.0.0.1"}},
            "control_nodes": {"9": {"ip": "10.0.0.9", "capabilities": ["rotate"]}}
        }))
        .unwrap();
        assert_eq!(split.control_nodes[&NodeId::from("9")].capabilities, vec!["rotate"]);
        assert!(parse_nodes(&json!([1, 2])).is_err());
    }
}
