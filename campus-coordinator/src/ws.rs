//! Terminal WebSocket sessions: admission, relay and state bridging.

use crate::liveness;
use crate::sessions::{Outgoing, SessionHandle};
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use campus_protocol::{LogRecord, Message, TerminalId, CLOSE_TERMINAL_NOT_FOUND};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub async fn terminal_socket(
    ws: WebSocketUpgrade,
    Path(terminal_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let terminal = TerminalId::from(terminal_id);
    ws.on_upgrade(move |socket| serve_terminal(socket, terminal, state))
}

async fn serve_terminal(mut socket: WebSocket, terminal: TerminalId, state: AppState) {
    if !state.bridge.knows(&terminal) {
        warn!(terminal_id = %terminal, "Unknown terminal, closing socket");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_TERMINAL_NOT_FOUND,
                reason: "terminal not found".into(),
            })))
            .await;
        return;
    }

    let token = state.shutdown.child_token();
    let (session, rx) = SessionHandle::open(terminal.clone(), token.clone());
    let session = Arc::new(session);
    state.sessions.join(Arc::clone(&session));
    info!(
        terminal_id = %terminal,
        session = %session.id,
        members = state.sessions.members(&terminal),
        "Session joined"
    );

    session.send(Message::connection_status("connected", terminal.clone()));
    let backlog = state.bridge.recent_logs(&terminal);
    if !backlog.is_empty() {
        session.send(Message::LogsBatch {
            terminal_id: terminal.clone(),
            logs: backlog,
            timestamp: Utc::now(),
        });
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, token.clone()));
    let watchdog = tokio::spawn(liveness::watch(
        Arc::clone(&session),
        Arc::clone(&state.bridge),
        state.config.liveness_check(),
        state.config.heartbeat_timeout(),
    ));

    read_loop(stream, &session, &state).await;
    token.cancel();

    let was_primary = session.is_primary();
    state.sessions.leave(&terminal, session.id);
    if was_primary && !state.sessions.has_primary(&terminal) {
        state.bridge.set_online(&terminal, false);
    }
    let _ = writer.await;
    let _ = watchdog.await;
    info!(terminal_id = %terminal, session = %session.id, primary = was_primary, "Session left");
}

async fn read_loop(mut stream: SplitStream<WebSocket>, session: &SessionHandle, state: &AppState) {
    loop {
        let inbound = tokio::select! {
            _ = session.token.cancelled() => return,
            inbound = stream.next() => inbound,
        };
        match inbound {
            Some(Ok(WsMessage::Text(text))) => handle_frame(text.as_str(), session, state),
            Some(Ok(WsMessage::Close(_))) | None => return,
            Some(Err(e)) => {
                debug!(session = %session.id, error = %e, "Socket read failed");
                return;
            }
            Some(Ok(WsMessage::Binary(_))) => {
                warn!(session = %session.id, "Binary frame ignored");
            }
            Some(Ok(_)) => session.touch(),
        }
    }
}

fn handle_frame(text: &str, session: &SessionHandle, state: &AppState) {
    let message = match Message::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(terminal_id = %session.terminal, session = %session.id, error = %e, "Dropping malformed frame");
            return;
        }
    };
    session.touch();

    let terminal = &session.terminal;
    if message.is_telemetry() {
        if session.promote() {
            info!(terminal_id = %terminal, session = %session.id, "Session promoted to primary reporter");
        }
        state.bridge.set_online(terminal, true);
    }

    match message {
        Message::Heartbeat { .. } => {
            session.send(Message::heartbeat_response());
        }
        Message::SystemStatus { status, timestamp } => {
            if let Err(e) = state.bridge.on_status(terminal, &status, timestamp) {
                error!(terminal_id = %terminal, error = %e, "Failed to store status");
            }
            let update = Message::Status {
                terminal_id: terminal.clone(),
                status,
                timestamp,
            };
            state.sessions.broadcast(terminal, &update, Some(session.id));
        }
        Message::NodesData { nodes, timestamp } => {
            if let Err(e) = state.bridge.on_nodes(terminal, &nodes, timestamp) {
                error!(terminal_id = %terminal, error = %e, "Failed to store node data");
            }
        }
        Message::Log {
            level,
            message,
            source,
            timestamp,
        } => {
            let log = LogRecord {
                level,
                message,
                source,
                timestamp,
            };
            debug!(terminal_id = %terminal, level = %log.level, message = %log.message, "Terminal log");
            state.bridge.on_log(terminal, log.clone());
            let relay = Message::NewLog {
                terminal_id: terminal.clone(),
                log,
                timestamp: Utc::now(),
            };
            state.sessions.broadcast(terminal, &relay, Some(session.id));
        }
        Message::SendCommand {
            command,
            params,
            request_id,
            timestamp,
        } => {
            let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let relay = Message::SendCommand {
                command: command.clone(),
                params,
                request_id: Some(request_id.clone()),
                timestamp,
            };
            let delivered = state.sessions.broadcast(terminal, &relay, Some(session.id));
            info!(terminal_id = %terminal, command = %command, request_id = %request_id, delivered, "Command relayed");
        }
        response @ Message::CommandResponse { .. } => {
            state.sessions.broadcast(terminal, &response, Some(session.id));
        }
        other => {
            debug!(terminal_id = %terminal, kind = other.kind(), "Ignoring coordinator-bound frame");
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, WsMessage>, mut rx: Receiver<Outgoing>, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = token.cancelled() => break,
        };
        match next {
            Some(out) => {
                if !write(&mut sink, out).await {
                    return;
                }
            }
            None => break,
        }
    }
    // a close frame queued right before cancellation still goes out
    while let Ok(out) = rx.try_recv() {
        if !write(&mut sink, out).await {
            return;
        }
    }
    let _ = sink.close().await;
}

/// False when the socket is done, either failed or closed
async fn write(sink: &mut SplitSink<WebSocket, WsMessage>, out: Outgoing) -> bool {
    let frame = match out {
        Outgoing::Frame(message) => match message.to_json() {
            Ok(text) => WsMessage::Text(text.into()),
            Err(e) => {
                error!(error = %e, "Cannot encode frame");
                return true;
            }
        },
        Outgoing::Close(code, reason) => {
            let _ = sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return false;
        }
    };
    sink.send(frame).await.is_ok()
}
