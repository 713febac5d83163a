//! Campus Protocol - wire contract between detection terminals and the coordinator
//!
//! Every frame exchanged over the terminal WebSocket is one JSON object tagged by
//! `type` and stamped with a `timestamp`:
//! - Terminal → coordinator: heartbeat, system_status, nodes_data, log, command_response
//! - Coordinator → terminal: heartbeat_response, send_command, connection_status
//! - Coordinator → observers: status, new_log, logs_batch, command_response

pub mod command;
pub mod ids;
pub mod message;
pub mod status;

pub use command::{CommandName, UnknownCommand};
pub use ids::{NodeId, TerminalId};
pub use message::{format_timestamp, EnvReading, LogRecord, Message, NodeReport, ProtocolError};
pub use status::{Co2Status, DetectionMode, DetectionStatsView, ModelState, NodeDetail, NodeState, StatusSnapshot};

/// Close code sent by the coordinator when the terminal identity is unknown.
pub const CLOSE_TERMINAL_NOT_FOUND: u16 = 4404;

/// Close code sent by the coordinator when it evicts a silent reporter.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4408;

/// Path segment that prefixes every terminal socket address.
pub const TERMINAL_PATH: &str = "ws/terminals";
