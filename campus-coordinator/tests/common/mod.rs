//! Running coordinator on a loopback port

#![allow(dead_code)]

use campus_coordinator::config::{NodeConf, TerminalConf};
use campus_coordinator::{AppState, Coordinator, CoordinatorConfig, MemoryStore};
use campus_protocol::{NodeId, TerminalId};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Running {
    /// `ws://` base for sockets
    pub ws: String,
    /// `http://` base for REST calls
    pub http: String,
    pub state: AppState,
    pub token: CancellationToken,
    pub server: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    pub async fn stop(self) {
        self.token.cancel();
        self.server.await.unwrap().unwrap();
    }
}

/// Terminal 1 owns nodes 1 and 2, terminal 2 owns node 3
pub fn campus_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig {
        data_file: None,
        ..CoordinatorConfig::default()
    };
    let mut first = TerminalConf {
        name: Some("Library".into()),
        ..TerminalConf::default()
    };
    first.nodes.insert(NodeId::from("1"), NodeConf::default());
    first.nodes.insert(NodeId::from("2"), NodeConf::default());
    let mut second = TerminalConf::default();
    second.nodes.insert(NodeId::from("3"), NodeConf::default());
    config.terminals.insert(TerminalId::from("1"), first);
    config.terminals.insert(TerminalId::from("2"), second);
    config
}

pub async fn start(config: CoordinatorConfig) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = Arc::new(MemoryStore::in_memory(&config));
    let coordinator = Coordinator::new(config, store);
    let state = coordinator.state().clone();
    let token = CancellationToken::new();
    let server = tokio::spawn({
        let token = token.clone();
        async move { coordinator.serve(listener, token).await }
    });
    Running {
        ws: format!("ws://{addr}"),
        http: format!("http://{addr}"),
        state,
        token,
        server,
    }
}
