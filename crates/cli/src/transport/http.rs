// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP request/response types and axum handler implementations for the
//! control surface.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::supervisor::SpawnOptions;
use crate::transcript::TranscriptEntry;
use crate::transport::{ClientAddr, Store};

// -- Types --------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub name: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cols: Option<f64>,
    pub rows: Option<f64>,
    pub task: Option<String>,
    pub skip_permissions: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: Option<f64>,
    pub rows: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub task: String,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub entries: Vec<TranscriptEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub state: String,
    pub total_working_ms: u64,
    pub total_idle_ms: u64,
    pub total_permission_wait_ms: u64,
    pub current_state_ms: u64,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<Store>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": s.supervisor.count().await,
        "clients": s.bridge.client_count(),
    }))
}

/// `POST /api/v1/sessions`
pub async fn spawn(
    State(s): State<Arc<Store>>,
    Extension(addr): Extension<ClientAddr>,
    Json(req): Json<SpawnRequest>,
) -> Result<impl IntoResponse, OpError> {
    let info = s
        .supervisor
        .spawn(SpawnOptions {
            name: req.name,
            group: req.group,
            cwd: req.cwd,
            args: req.args,
            cols: req.cols,
            rows: req.rows,
            task: req.task,
            skip_permissions: req.skip_permissions,
        })
        .await?;
    s.audit.emit(&addr.0, "session.spawn", &info.id);
    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /api/v1/sessions`
pub async fn list(State(s): State<Arc<Store>>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": s.supervisor.list().await }))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    State(s): State<Arc<Store>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpError> {
    match s.supervisor.get_info(&id).await {
        Some(info) => Ok(Json(info)),
        None => Err(OpError::not_found(&id)),
    }
}

/// `DELETE /api/v1/sessions/{id}`
pub async fn kill(
    State(s): State<Arc<Store>>,
    Extension(addr): Extension<ClientAddr>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpError> {
    if s.supervisor.kill(&id).await {
        s.audit.emit(&addr.0, "session.kill", &id);
        Ok(Json(serde_json::json!({ "killed": true })))
    } else {
        Err(OpError::not_found(&id))
    }
}

/// `POST /api/v1/sessions/{id}/input`
pub async fn input(
    State(s): State<Arc<Store>>,
    Extension(addr): Extension<ClientAddr>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<impl IntoResponse, OpError> {
    s.supervisor.write(&id, &req.data).await?;
    s.audit.emit(&addr.0, "session.input", &id);
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `POST /api/v1/sessions/{id}/resize`
pub async fn resize(
    State(s): State<Arc<Store>>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<impl IntoResponse, OpError> {
    let (cols, rows) = s.supervisor.resize(&id, req.cols, req.rows).await?;
    Ok(Json(serde_json::json!({ "cols": cols, "rows": rows })))
}

/// `POST /api/v1/sessions/{id}/task`
pub async fn set_task(
    State(s): State<Arc<Store>>,
    Path(id): Path<String>,
    Json(req): Json<TaskRequest>,
) -> Result<impl IntoResponse, OpError> {
    let info = s.supervisor.set_task(&id, req.task).await?;
    Ok(Json(info))
}

/// `GET /api/v1/sessions/{id}/scrollback`
pub async fn scrollback(
    State(s): State<Arc<Store>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpError> {
    match s.supervisor.scrollback(&id).await {
        Some(data) => Ok(Json(serde_json::json!({
            "sessionId": id,
            "data": String::from_utf8_lossy(&data),
        }))),
        None => Err(OpError::not_found(&id)),
    }
}

/// `GET /api/v1/sessions/{id}/transcript`
pub async fn transcript(
    State(s): State<Arc<Store>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpError> {
    match s.supervisor.transcript(&id).await {
        Some(entries) => Ok(Json(TranscriptResponse { entries })),
        None => Err(OpError::not_found(&id)),
    }
}

/// `GET /api/v1/sessions/{id}/metrics`
pub async fn metrics(
    State(s): State<Arc<Store>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpError> {
    if let Some(m) = s.supervisor.metrics(&id).await {
        return Ok(Json(MetricsResponse {
            state: m.state.to_string(),
            total_working_ms: m.totals.working_ms,
            total_idle_ms: m.totals.idle_ms,
            total_permission_wait_ms: m.totals.permission_wait_ms,
            current_state_ms: m.current_state_ms,
        }));
    }
    // Exited sessions no longer have a detector block; serve the frozen
    // descriptor totals instead.
    match s.supervisor.get_info(&id).await {
        Some(info) => Ok(Json(MetricsResponse {
            state: info.detailed_state.to_string(),
            total_working_ms: info.total_working_ms,
            total_idle_ms: info.total_idle_ms,
            total_permission_wait_ms: info.total_permission_wait_ms,
            current_state_ms: 0,
        })),
        None => Err(OpError::not_found(&id)),
    }
}

/// `GET /api/v1/groups`
pub async fn groups(State(s): State<Arc<Store>>) -> impl IntoResponse {
    Json(serde_json::json!({ "groups": s.supervisor.groups().await }))
}

/// `GET /api/v1/audit`
pub async fn audit(State(s): State<Arc<Store>>) -> impl IntoResponse {
    Json(serde_json::json!({ "entries": s.audit.entries() }))
}
