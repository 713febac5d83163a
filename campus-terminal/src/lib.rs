//! Campus terminal - edge detection agent
//!
//! Runs next to a set of camera and sensor nodes and:
//! - keeps a resilient WebSocket link to the campus coordinator
//! - schedules object detection in push and/or pull mode
//! - reports system and node status on a fixed cadence
//! - answers coordinator commands

pub mod actuators;
pub mod agent;
pub mod commands;
pub mod config;
pub mod detection;
pub mod error;
pub mod ingest;
pub mod logbook;
pub mod monitor;
pub mod nodes;
pub mod transport;

pub use agent::{Agent, AgentParts};
pub use config::{ConfigStore, TerminalConfig};
