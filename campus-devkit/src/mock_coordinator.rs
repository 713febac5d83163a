/*!
Mock coordinator for terminal tests

A real WebSocket server on a loopback port that accepts terminals on
`/ws/terminals/{id}/`, records every frame they send, answers heartbeats and
lets a test push commands or cut the connections.
*/

use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use campus_protocol::{Message, TerminalId, CLOSE_TERMINAL_NOT_FOUND};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Outbound {
    Frame(Message),
    Drop,
}

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Message>>,
    terminals: Mutex<Vec<String>>,
    sessions: Mutex<HashMap<usize, mpsc::UnboundedSender<Outbound>>>,
    next_session: AtomicUsize,
    connections: AtomicUsize,
    rejections: AtomicUsize,
    rejecting: AtomicBool,
    silent: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockCoordinator {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockCoordinator {
    /// Accepting coordinator on a random loopback port
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind mock coordinator")?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .route("/ws/terminals/{terminal_id}/", get(upgrade))
            .route("/ws/terminals/{terminal_id}", get(upgrade))
            .with_state(Arc::clone(&state));

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("[MOCK] coordinator stopped: {}", e);
            }
        });

        log::info!("[MOCK] coordinator listening on {}", addr);
        Ok(Self { addr, state, server })
    }

    /// Coordinator that closes every handshake with code 4404
    pub async fn start_rejecting() -> Result<Self> {
        let mock = Self::start().await?;
        mock.set_rejecting(true);
        Ok(mock)
    }

    /// Base URL to put in a terminal's `server_url`
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Stop answering heartbeats (frames are still recorded)
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Every frame received from terminals, in arrival order
    pub fn frames(&self) -> Vec<Message> {
        lock(&self.state.received).clone()
    }

    pub fn frames_of(&self, kind: &str) -> Vec<Message> {
        lock(&self.state.received)
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn clear_frames(&self) {
        lock(&self.state.received).clear();
    }

    /// Terminal ids from accepted handshakes, one entry per connection
    pub fn terminals(&self) -> Vec<String> {
        lock(&self.state.terminals).clone()
    }

    /// Accepted handshakes so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Handshakes closed with 4404
    pub fn rejections(&self) -> usize {
        self.state.rejections.load(Ordering::SeqCst)
    }

    /// Currently open sessions
    pub fn live_sessions(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    /// Send `message` to every open session; returns how many got it
    pub fn push(&self, message: Message) -> usize {
        lock(&self.state.sessions)
            .values()
            .filter(|tx| tx.send(Outbound::Frame(message.clone())).is_ok())
            .count()
    }

    pub fn send_command(&self, command: &str, params: Value, request_id: Option<&str>) -> usize {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.push(Message::command(command, params, request_id.map(str::to_string)))
    }

    /// Drop every open socket without a close handshake
    pub fn drop_connections(&self) {
        for tx in lock(&self.state.sessions).values() {
            let _ = tx.send(Outbound::Drop);
        }
    }
}

impl Drop for MockCoordinator {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(terminal_id): Path<String>,
    State(state): State<Arc<MockState>>,
) -> Response {
    ws.on_upgrade(move |socket| session(state, terminal_id, socket))
}

async fn session(state: Arc<MockState>, terminal_id: String, mut socket: WebSocket) {
    if state.rejecting.load(Ordering::SeqCst) {
        state.rejections.fetch_add(1, Ordering::SeqCst);
        log::info!("[MOCK] rejecting terminal {}", terminal_id);
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_TERMINAL_NOT_FOUND,
                reason: "terminal not found".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = state.next_session.fetch_add(1, Ordering::SeqCst);
    lock(&state.sessions).insert(id, tx);
    lock(&state.terminals).push(terminal_id.clone());
    state.connections.fetch_add(1, Ordering::SeqCst);
    log::info!("[MOCK] terminal {} connected (session {})", terminal_id, id);

    let hello = Message::connection_status("connected", TerminalId::from(terminal_id.as_str()));
    if send(&mut socket, &hello).await {
        loop {
            tokio::select! {
                inbound = socket.recv() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(message) = Message::parse(text.as_str()) else {
                            log::warn!("[MOCK] malformed frame: {}", text.as_str());
                            continue;
                        };
                        let heartbeat = matches!(message, Message::Heartbeat { .. });
                        lock(&state.received).push(message);
                        if heartbeat
                            && !state.silent.load(Ordering::SeqCst)
                            && !send(&mut socket, &Message::heartbeat_response()).await
                        {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(message)) => {
                        if !send(&mut socket, &message).await {
                            break;
                        }
                    }
                    Some(Outbound::Drop) | None => break,
                },
            }
        }
    }

    lock(&state.sessions).remove(&id);
    log::info!("[MOCK] terminal {} disconnected (session {})", terminal_id, id);
}

async fn send(socket: &mut WebSocket, message: &Message) -> bool {
    match message.to_json() {
        Ok(text) => socket.send(WsMessage::Text(text.into())).await.is_ok(),
        Err(e) => {
            log::error!("[MOCK] cannot encode frame: {}", e);
            false
        }
    }
}
