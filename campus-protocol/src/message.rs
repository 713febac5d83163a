//! Message envelope (one JSON object per WebSocket text frame)

use crate::ids::{NodeId, TerminalId};
use crate::status::StatusSnapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised while encoding or decoding frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Every frame understood by either side of the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Heartbeat {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    HeartbeatResponse {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    SystemStatus {
        status: StatusSnapshot,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    NodesData {
        nodes: Vec<NodeReport>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    Log {
        level: String,
        message: String,
        #[serde(default = "default_source")]
        source: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    SendCommand {
        command: String,
        #[serde(default)]
        params: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    CommandResponse {
        command: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    Status {
        terminal_id: TerminalId,
        status: StatusSnapshot,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    NewLog {
        terminal_id: TerminalId,
        log: LogRecord,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    LogsBatch {
        terminal_id: TerminalId,
        logs: Vec<LogRecord>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    ConnectionStatus {
        status: String,
        terminal_id: TerminalId,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

fn default_source() -> String {
    "system".to_string()
}

/// One node entry of a `nodes_data` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    #[serde(alias = "node_id")]
    pub id: NodeId,
    #[serde(default, alias = "count", skip_serializing_if = "Option::is_none")]
    pub detected_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2_level: Option<u32>,
    /// Set when the node could not deliver a frame; the readings are still valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeReport {
    pub fn detection(id: NodeId, count: u32, env: Option<&EnvReading>) -> Self {
        Self {
            id,
            detected_count: Some(count),
            temperature: env.and_then(|e| e.temperature),
            humidity: env.and_then(|e| e.humidity),
            co2_level: env.and_then(|e| e.co2_level),
            error: None,
        }
    }

    pub fn environment(id: NodeId, env: &EnvReading) -> Self {
        Self {
            id,
            detected_count: None,
            temperature: env.temperature,
            humidity: env.humidity,
            co2_level: env.co2_level,
            error: None,
        }
    }

    /// Readings of a node whose frame could not be fetched
    pub fn capture_failed(id: NodeId, env: &EnvReading, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::environment(id, env)
        }
    }
}

/// Environmental reading reported by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvReading {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub humidity: Option<f32>,
    /// eCO2 in ppm
    #[serde(default)]
    pub co2_level: Option<u32>,
}

impl EnvReading {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none() && self.co2_level.is_none()
    }
}

/// A log line kept by a terminal and relayed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn heartbeat() -> Self {
        Message::Heartbeat { timestamp: Utc::now() }
    }

    pub fn heartbeat_response() -> Self {
        Message::HeartbeatResponse { timestamp: Utc::now() }
    }

    pub fn system_status(status: StatusSnapshot) -> Self {
        Message::SystemStatus { status, timestamp: Utc::now() }
    }

    pub fn nodes_data(nodes: Vec<NodeReport>) -> Self {
        Message::NodesData { nodes, timestamp: Utc::now() }
    }

    pub fn log(record: LogRecord) -> Self {
        Message::Log {
            level: record.level,
            message: record.message,
            source: record.source,
            timestamp: record.timestamp,
        }
    }

    pub fn command(command: impl Into<String>, params: Map<String, Value>, request_id: Option<String>) -> Self {
        Message::SendCommand {
            command: command.into(),
            params,
            request_id,
            timestamp: Utc::now(),
        }
    }

    pub fn command_response(command: impl Into<String>, result: Value, success: bool, request_id: Option<String>) -> Self {
        Message::CommandResponse {
            command: command.into(),
            result,
            success,
            request_id,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_status(status: impl Into<String>, terminal_id: TerminalId) -> Self {
        Message::ConnectionStatus {
            status: status.into(),
            terminal_id,
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the frame, as found in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatResponse { .. } => "heartbeat_response",
            Message::SystemStatus { .. } => "system_status",
            Message::NodesData { .. } => "nodes_data",
            Message::Log { .. } => "log",
            Message::SendCommand { .. } => "send_command",
            Message::CommandResponse { .. } => "command_response",
            Message::Status { .. } => "status",
            Message::NewLog { .. } => "new_log",
            Message::LogsBatch { .. } => "logs_batch",
            Message::ConnectionStatus { .. } => "connection_status",
        }
    }

    /// Frames that only the physical terminal emits. Receiving one identifies
    /// the sender as the terminal's primary reporter.
    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            Message::Heartbeat { .. }
                | Message::SystemStatus { .. }
                | Message::NodesData { .. }
                | Message::Log { .. }
                | Message::CommandResponse { .. }
        )
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Message::Heartbeat { timestamp }
            | Message::HeartbeatResponse { timestamp }
            | Message::SystemStatus { timestamp, .. }
            | Message::NodesData { timestamp, .. }
            | Message::Log { timestamp, .. }
            | Message::SendCommand { timestamp, .. }
            | Message::CommandResponse { timestamp, .. }
            | Message::Status { timestamp, .. }
            | Message::NewLog { timestamp, .. }
            | Message::LogsBatch { timestamp, .. }
            | Message::ConnectionStatus { timestamp, .. } => *timestamp,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// RFC 3339 UTC timestamp with second precision, as used by the HTTP upload
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_send_command_without_request_id() {
        let msg = Message::parse(r#"{"type":"send_command","command":"set_mode","params":{"mode":"pull"},"timestamp":"2024-05-01T08:00:00Z"}"#).unwrap();
        match msg {
            Message::SendCommand { command, params, request_id, .. } => {
                assert_eq!(command, "set_mode");
                assert_eq!(params.get("mode"), Some(&json!("pull")));
                assert!(request_id.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn accepts_legacy_node_fields() {
        let msg = Message::parse(r#"{"type":"nodes_data","nodes":[{"node_id":2,"count":7}]}"#).unwrap();
        let Message::NodesData { nodes, .. } = msg else { panic!("not nodes_data") };
        assert_eq!(nodes[0].id, NodeId::from("2"));
        assert_eq!(nodes[0].detected_count, Some(7));
    }

    #[test]
    fn encodes_type_tag_and_skips_empty_fields() {
        let text = Message::nodes_data(vec![NodeReport::environment(
            NodeId::from("1"),
            &EnvReading {
                temperature: Some(21.5),
                ..EnvReading::default()
            },
        )])
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "nodes_data");
        assert_eq!(value["nodes"][0]["temperature"], json!(21.5));
        assert!(value["nodes"][0].get("detected_count").is_none());
        assert!(value["nodes"][0].get("humidity").is_none());
        assert!(value["nodes"][0].get("error").is_none());
    }

    #[test]
    fn failed_capture_keeps_readings_and_names_the_error() {
        let env = EnvReading {
            humidity: Some(40.0),
            co2_level: Some(830),
            ..EnvReading::default()
        };
        let text = Message::nodes_data(vec![NodeReport::capture_failed(NodeId::from("1"), &env, "no frame")])
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["nodes"][0]["error"], "no frame");
        assert_eq!(value["nodes"][0]["co2_level"], 830);
        assert!(value["nodes"][0].get("detected_count").is_none());
    }

    #[test]
    fn telemetry_classification() {
        assert!(Message::heartbeat().is_telemetry());
        assert!(Message::command_response("get_status", Value::Null, true, None).is_telemetry());
        assert!(!Message::command("start", Map::new(), None).is_telemetry());
        assert!(!Message::heartbeat_response().is_telemetry());
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(matches!(
            Message::parse(r#"{"type":"authenticate"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(Message::parse("not json").is_err());
    }
}
