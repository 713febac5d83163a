//! Error types shared by the terminal modules

use campus_protocol::{NodeId, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find a config directory for this platform")]
    NoConfigDir,
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server address '{0}'")]
    InvalidUrl(String),
    #[error("handshake timed out after {0}s")]
    HandshakeTimeout(u64),
    #[error("handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {0} is not configured")]
    Unknown(NodeId),
    #[error("node request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("node answered with HTTP {0}")]
    Status(u16),
    #[error("no JPEG frame in node response")]
    NoFrame,
    #[error("node {0} does not support {1}")]
    Unsupported(NodeId, &'static str),
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("model unavailable")]
    ModelUnavailable,
    #[error("model failed to load: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("push mode is not active")]
    PushInactive,
    #[error("resource sampling failed: {0}")]
    Resource(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("no handler registered for command {0}")]
    MissingHandler(&'static str),
    #[error("{0}")]
    Failed(String),
}
