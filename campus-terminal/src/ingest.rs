//! Push-mode ingest routes
//!
//! - `POST /frames/{node_id}`: JPEG body, optional `temperature`/`humidity` query
//! - `POST /environment/{node_id}`: JSON `{temperature?, humidity?}`

use crate::detection::DetectionScheduler;
use crate::error::{DetectionError, NodeError};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use campus_protocol::{EnvReading, NodeId};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(scheduler: Arc<DetectionScheduler>) -> Router {
    Router::new()
        .route("/frames/{node_id}", post(push_frame))
        .route("/environment/{node_id}", post(push_environment))
        .with_state(scheduler)
}

pub async fn serve(addr: &str, scheduler: Arc<DetectionScheduler>, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind ingest address {addr}"))?;
    info!(addr = %addr, "Push ingest listening");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("Ingest server failed")
}

async fn push_frame(
    State(scheduler): State<Arc<DetectionScheduler>>,
    Path(node_id): Path<String>,
    Query(env): Query<EnvReading>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "empty frame" }))).into_response();
    }
    match scheduler
        .process_pushed_frame(&NodeId::from(node_id), body.to_vec(), Some(env))
        .await
    {
        Ok(count) => Json(json!({ "detected_count": count })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn push_environment(
    State(scheduler): State<Arc<DetectionScheduler>>,
    Path(node_id): Path<String>,
    Json(env): Json<EnvReading>,
) -> Response {
    match scheduler
        .process_pushed_environment(&NodeId::from(node_id), env)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: DetectionError) -> Response {
    let status = match &error {
        DetectionError::PushInactive => StatusCode::CONFLICT,
        DetectionError::Node(NodeError::Unknown(_)) => StatusCode::NOT_FOUND,
        DetectionError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}
