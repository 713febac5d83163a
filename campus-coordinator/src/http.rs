use crate::state::AppState;
use crate::store::{HistoricalSample, TerminalRecord};
use crate::ws::terminal_socket;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use campus_protocol::{Message, NodeReport, StatusSnapshot, TerminalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Serialize)]
struct TerminalView {
    terminal_id: TerminalId,
    name: Option<String>,
    online: bool,
    last_seen: Option<DateTime<Utc>>,
    stale_for_seconds: Option<i64>,
    sessions: usize,
    nodes: usize,
}

fn to_view(app: &AppState, id: &TerminalId, record: &TerminalRecord) -> TerminalView {
    TerminalView {
        terminal_id: id.clone(),
        name: record.name.clone(),
        online: record.online,
        last_seen: record.last_seen,
        stale_for_seconds: record.last_seen.map(|seen| (Utc::now() - seen).num_seconds().max(0)),
        sessions: app.sessions.members(id),
        nodes: record.nodes.len(),
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandAccepted {
    pub request_id: String,
    pub delivered: usize,
}

/// Detection result posted by a terminal whose link is down
#[derive(Debug, Deserialize)]
struct UploadRequest {
    #[serde(flatten)]
    report: NodeReport,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// `/terminals` routes need `x-api-key` when a key is configured
async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(next.run(req).await);
    };
    if !req.uri().path().starts_with("/terminals") {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "Rejected request without a valid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/terminals", get(list_terminals))
        .route("/terminals/{id}", get(get_terminal))
        .route("/terminals/{id}/status", get(get_status))
        .route("/terminals/{id}/samples", get(get_samples))
        .route("/terminals/{id}/commands", post(submit_command))
        .route("/api/upload/", post(upload))
        .route("/ws/terminals/{terminal_id}/", get(terminal_socket))
        .route("/ws/terminals/{terminal_id}", get(terminal_socket))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn health(State(app): State<AppState>) -> Json<Value> {
    let terminals = app.bridge.store().terminals();
    Json(json!({
        "status": "ok",
        "terminals": terminals.len(),
        "online": terminals.values().filter(|t| t.online).count(),
        "sessions": app.sessions.total(),
    }))
}

async fn list_terminals(State(app): State<AppState>) -> Json<Vec<TerminalView>> {
    let terminals = app.bridge.store().terminals();
    Json(terminals.iter().map(|(id, record)| to_view(&app, id, record)).collect())
}

async fn get_terminal(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TerminalRecord>, StatusCode> {
    app.bridge
        .store()
        .terminal(&TerminalId::from(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusSnapshot>, StatusCode> {
    app.bridge
        .status(&TerminalId::from(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_samples(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoricalSample>>, StatusCode> {
    let id = TerminalId::from(id);
    if !app.bridge.knows(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(app.bridge.store().samples(&id)))
}

async fn submit_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<CommandAccepted>, StatusCode> {
    let id = TerminalId::from(id);
    if !app.bridge.knows(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    let request_id = body.request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let message = Message::command(body.command.as_str(), body.params, Some(request_id.clone()));
    let delivered = app.sessions.broadcast(&id, &message, None);
    info!(terminal_id = %id, command = %body.command, request_id = %request_id, delivered, "Command submitted over HTTP");
    Ok(Json(CommandAccepted { request_id, delivered }))
}

async fn upload(
    State(app): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> (StatusCode, Json<Value>) {
    let at = body.timestamp.unwrap_or_else(Utc::now);
    match app.bridge.on_upload(&body.report, at) {
        Ok(terminal) => (
            StatusCode::CREATED,
            Json(json!({ "terminal_id": terminal, "node_id": body.report.id })),
        ),
        Err(e) => {
            warn!(node = %body.report.id, error = %e, "Upload rejected");
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() })))
        }
    }
}
