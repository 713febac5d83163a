use campus_protocol::{NodeId, TerminalId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown terminal: {0}")]
    UnknownTerminal(TerminalId),
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
