//! Resilient link to the coordinator
//!
//! One WebSocket per terminal identity:
//! - A supervisor task owns (re)connection and the backoff policy
//! - Per session: one writer task (the only place that touches the sink), one
//!   heartbeat task, and the inbound loop running on the supervisor
//! - Outbound frames go through a queue and are acknowledged once written
//! - `send_command` frames are dispatched to the registered handler on their
//!   own task; every outcome is answered with `command_response`
//! - A session with no inbound frame for `missed_heartbeats` heartbeat periods
//!   is treated as lost

pub mod backoff;
pub mod url;

use crate::config::{TerminalConfig, TransportConfig};
use crate::error::{CommandError, TransportError};
use async_trait::async_trait;
use backoff::Backoff;
use campus_protocol::{Message, CLOSE_TERMINAL_NOT_FOUND};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that can carry telemetry towards the coordinator
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Returns `false` when the frame could not be written
    async fn send(&self, message: Message) -> bool;
}

/// Receiver of `send_command` frames
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: &str,
        params: Map<String, Value>,
        request_id: Option<String>,
    ) -> Result<Value, CommandError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    /// The coordinator does not know this terminal
    Rejected,
    /// Reconnect attempts used up; the agent keeps running offline
    Exhausted,
    Stopped,
}

#[derive(Debug, PartialEq)]
enum Reconnect {
    Wait(Duration),
    AlreadyPending,
    Exhausted,
}

enum SessionEnd {
    Stopped,
    Rejected,
    Lost(String),
}

struct Outbound {
    text: String,
    ack: oneshot::Sender<bool>,
}

#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    config: TransportConfig,
    backoff: Backoff,
    status: watch::Sender<LinkStatus>,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    attempts: AtomicU32,
    reconnect_pending: AtomicBool,
    rejected: AtomicBool,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    commands: Mutex<JoinSet<()>>,
}

impl TransportClient {
    pub fn new(config: &TerminalConfig) -> Result<Self, TransportError> {
        let url = url::terminal_url(&config.server_url, &config.terminal_id)?;
        let (status, _) = watch::channel(LinkStatus::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                backoff: Backoff::from_config(&config.transport),
                config: config.transport.clone(),
                status,
                connected: AtomicBool::new(false),
                outbound: Mutex::new(None),
                handler: RwLock::new(None),
                attempts: AtomicU32::new(0),
                reconnect_pending: AtomicBool::new(false),
                rejected: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
                commands: Mutex::new(JoinSet::new()),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Spawn the supervisor. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut slot = self.inner.supervisor.lock();
        if slot.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        info!(url = %self.inner.url, "Starting coordinator link");
        *slot = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
    }

    /// Cancel every link task and close the socket. Safe to call from any task.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            if timeout(CLOSE_TIMEOUT + Duration::from_secs(1), handle).await.is_err() {
                warn!("Coordinator link did not shut down in time");
            }
        }
        let mut commands = std::mem::take(&mut *self.inner.commands.lock());
        let drained = timeout(CLOSE_TIMEOUT, async {
            while commands.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending = commands.len(), "Command tasks still running after shutdown");
            commands.abort_all();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.status.send_replace(LinkStatus::Stopped);
        info!("Coordinator link stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn on_command(&self, handler: Arc<dyn CommandHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// `system_status`, `nodes_data` and `log` frames
    pub async fn send_telemetry(&self, message: Message) -> bool {
        if !matches!(
            message,
            Message::SystemStatus { .. } | Message::NodesData { .. } | Message::Log { .. }
        ) {
            warn!(kind = message.kind(), "Refusing to send non-telemetry frame");
            return false;
        }
        self.inner.send(&message).await
    }

    pub async fn send_command_response(
        &self,
        command: &str,
        result: Value,
        success: bool,
        request_id: Option<String>,
    ) -> bool {
        self.inner
            .send(&Message::command_response(command, result, success, request_id))
            .await
    }
}

#[async_trait]
impl TelemetrySink for TransportClient {
    fn is_connected(&self) -> bool {
        TransportClient::is_connected(self)
    }

    async fn send(&self, message: Message) -> bool {
        self.inner.send(&message).await
    }
}

impl Inner {
    fn set_status(&self, status: LinkStatus) {
        self.status.send_replace(status);
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.config.send_timeout_secs.max(1))
    }

    fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_secs.max(1))
    }

    /// Longest inbound silence tolerated before the session is dropped
    fn silence_limit(&self) -> Duration {
        self.heartbeat_period() * self.config.missed_heartbeats.max(1)
    }

    async fn connect(&self) -> Result<Socket, TransportError> {
        let limit = self.config.connect_timeout_secs.max(1);
        match timeout(Duration::from_secs(limit), connect_async(self.url.as_str())).await {
            Err(_) => Err(TransportError::HandshakeTimeout(limit)),
            Ok(Err(e)) => Err(TransportError::Handshake(e)),
            Ok(Ok((socket, _response))) => Ok(socket),
        }
    }

    /// Reserve the single pending reconnect slot and compute its delay
    fn schedule_reconnect(&self) -> Reconnect {
        if self
            .reconnect_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Reconnect::AlreadyPending;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.backoff.allows(attempt) {
            self.reconnect_pending.store(false, Ordering::Release);
            return Reconnect::Exhausted;
        }

        if self.rejected.load(Ordering::SeqCst) {
            Reconnect::Wait(self.backoff.max)
        } else {
            self.set_status(LinkStatus::Reconnecting);
            Reconnect::Wait(self.backoff.delay(attempt))
        }
    }

    async fn send(&self, message: &Message) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, kind = message.kind(), "Could not encode frame");
                return false;
            }
        };
        let Some(queue) = self.outbound.lock().clone() else {
            return false;
        };

        let (ack, written) = oneshot::channel();
        if queue.send(Outbound { text, ack }).await.is_err() {
            return false;
        }
        written.await.unwrap_or(false)
    }

    async fn run_session(self: &Arc<Self>, socket: Socket) -> SessionEnd {
        let (sink, mut source) = socket.split();
        let session = self.cancel.child_token();
        let (queue, pending) = mpsc::channel(OUTBOUND_QUEUE);

        *self.outbound.lock() = Some(queue);
        self.connected.store(true, Ordering::SeqCst);
        self.set_status(LinkStatus::Connected);

        let writer = tokio::spawn(write_loop(
            sink,
            pending,
            session.clone(),
            self.cancel.clone(),
            self.send_timeout(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(self), session.clone()));

        let silence_limit = self.silence_limit();
        let mut watchdog = interval(self.heartbeat_period());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        let end = loop {
            tokio::select! {
                _ = session.cancelled() => {
                    break if self.cancel.is_cancelled() {
                        SessionEnd::Stopped
                    } else {
                        SessionEnd::Lost("session torn down".to_string())
                    };
                }
                _ = watchdog.tick() => {
                    let quiet = last_inbound.elapsed();
                    if quiet > silence_limit {
                        break SessionEnd::Lost(format!(
                            "no frame from coordinator for {}s",
                            quiet.as_secs()
                        ));
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_inbound = Instant::now();
                        self.handle_inbound(text.as_str());
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) if u16::from(frame.code) == CLOSE_TERMINAL_NOT_FOUND => SessionEnd::Rejected,
                            Some(frame) => SessionEnd::Lost(format!(
                                "closed by coordinator ({}: {})",
                                u16::from(frame.code),
                                frame.reason.as_str()
                            )),
                            None => SessionEnd::Lost("closed by coordinator".to_string()),
                        };
                    }
                    Some(Ok(_)) => last_inbound = Instant::now(),
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("stream ended".to_string()),
                }
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
        session.cancel();
        let _ = writer.await;
        let _ = heartbeat.await;
        end
    }

    fn handle_inbound(self: &Arc<Self>, text: &str) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match message {
            Message::SendCommand {
                command,
                params,
                request_id,
                ..
            } => self.dispatch(command, params, request_id),
            Message::HeartbeatResponse { .. } => debug!("Heartbeat acknowledged"),
            Message::ConnectionStatus { status, .. } => info!(status = %status, "Coordinator acknowledged connection"),
            other => debug!(kind = other.kind(), "Ignoring frame"),
        }
    }

    /// Run the command on a task owned by the link; `stop` cancels and drains it
    fn dispatch(self: &Arc<Self>, command: String, params: Map<String, Value>, request_id: Option<String>) {
        let inner = Arc::clone(self);
        let token = self.cancel.child_token();
        let mut commands = self.commands.lock();
        while commands.try_join_next().is_some() {}
        commands.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(command = %command, "Command abandoned at shutdown"),
                _ = inner.answer(&command, params, request_id) => {}
            }
        });
    }

    async fn answer(&self, command: &str, params: Map<String, Value>, request_id: Option<String>) {
        let handler = self.handler.read().clone();
        let (success, result) = match handler {
            Some(handler) => match handler.handle(command, params, request_id.clone()).await {
                Ok(result) => (true, result),
                Err(e) => (false, json!({ "error": e.to_string() })),
            },
            None => (false, json!({ "error": "no command handler registered" })),
        };

        let reply = Message::command_response(command, result, success, request_id);
        if !self.send(&reply).await {
            warn!(command = %command, "Could not deliver command response");
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    inner.set_status(LinkStatus::Connecting);

    loop {
        let connected = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = inner.connect() => result,
        };

        let end = match connected {
            Ok(socket) => {
                inner.attempts.store(0, Ordering::SeqCst);
                info!(url = %inner.url, "Connected to coordinator");
                inner.run_session(socket).await
            }
            Err(e) => SessionEnd::Lost(e.to_string()),
        };

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Rejected => {
                error!(url = %inner.url, "Coordinator does not know this terminal (close 4404)");
                inner.rejected.store(true, Ordering::SeqCst);
                inner.set_status(LinkStatus::Rejected);
            }
            SessionEnd::Lost(reason) => {
                inner.rejected.store(false, Ordering::SeqCst);
                warn!(reason = %reason, "Coordinator link lost");
            }
        }

        let delay = match inner.schedule_reconnect() {
            Reconnect::Wait(delay) => delay,
            Reconnect::AlreadyPending => inner.backoff.base,
            Reconnect::Exhausted => {
                error!(
                    attempts = inner.backoff.max_attempts,
                    "Giving up on the coordinator; continuing offline"
                );
                inner.set_status(LinkStatus::Exhausted);
                break;
            }
        };
        info!(
            attempt = inner.attempts.load(Ordering::SeqCst),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        inner.reconnect_pending.store(false, Ordering::Release);
    }

    inner.connected.store(false, Ordering::SeqCst);
}

async fn write_loop(
    mut sink: SplitSink<Socket, WsMessage>,
    mut pending: mpsc::Receiver<Outbound>,
    session: CancellationToken,
    root: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            item = pending.recv() => {
                let Some(item) = item else { break };
                let written = matches!(
                    timeout(send_timeout, sink.send(WsMessage::Text(item.text.into()))).await,
                    Ok(Ok(()))
                );
                let _ = item.ack.send(written);
                if !written {
                    warn!("Socket write failed or timed out");
                    session.cancel();
                    break;
                }
            }
        }
    }

    if root.is_cancelled() {
        let farewell = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "terminal shutting down".into(),
        }));
        let _ = timeout(CLOSE_TIMEOUT, sink.send(farewell)).await;
    }
    let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
}

async fn heartbeat_loop(inner: Arc<Inner>, session: CancellationToken) {
    let mut ticker = interval(inner.heartbeat_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {
                if !inner.send(&Message::heartbeat()).await {
                    warn!("Heartbeat could not be written");
                    session.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(attempts: u32) -> TransportClient {
        let mut config = TerminalConfig::default();
        config.transport.max_reconnect_attempts = attempts;
        TransportClient::new(&config).unwrap()
    }

    #[test]
    fn test_only_one_reconnect_pending() {
        let client = client(100);
        assert_eq!(client.inner.schedule_reconnect(), Reconnect::Wait(Duration::from_secs(2)));
        assert_eq!(client.inner.schedule_reconnect(), Reconnect::AlreadyPending);

        client.inner.reconnect_pending.store(false, Ordering::Release);
        assert_eq!(client.inner.schedule_reconnect(), Reconnect::Wait(Duration::from_secs(3)));
    }

    #[test]
    fn test_exhaustion_after_limit() {
        let client = client(1);
        assert!(matches!(client.inner.schedule_reconnect(), Reconnect::Wait(_)));
        client.inner.reconnect_pending.store(false, Ordering::Release);
        assert_eq!(client.inner.schedule_reconnect(), Reconnect::Exhausted);
    }

    #[test]
    fn test_rejected_terminal_waits_the_maximum() {
        let client = client(0);
        client.inner.rejected.store(true, Ordering::SeqCst);
        assert_eq!(client.inner.schedule_reconnect(), Reconnect::Wait(Duration::from_secs(60)));
    }

    #[test]
    fn test_silence_limit_spans_missed_heartbeats() {
        let mut config = TerminalConfig::default();
        config.transport.heartbeat_secs = 10;
        config.transport.missed_heartbeats = 3;
        let client = TransportClient::new(&config).unwrap();
        assert_eq!(client.inner.silence_limit(), Duration::from_secs(30));

        config.transport.missed_heartbeats = 0;
        let client = TransportClient::new(&config).unwrap();
        assert_eq!(client.inner.silence_limit(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let client = client(1);
        assert!(!client.is_connected());
        assert!(!client.send_telemetry(Message::nodes_data(Vec::new())).await);
        assert!(!client.send_telemetry(Message::heartbeat()).await);
    }
}
