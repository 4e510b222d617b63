// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! API contract types and server wiring for the HTTP and WebSocket surfaces.

pub mod auth;
pub mod browse;
pub mod http;
pub mod ratelimit;
pub mod ws;
pub mod ws_msg;

use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::audit::AuditLog;
use crate::bridge::Bridge;
use crate::error::{ErrorCode, OpError};
use crate::supervisor::Supervisor;

use ratelimit::RateLimiter;

/// Request bodies above this size are rejected.
pub const MAX_BODY_BYTES: usize = 65_536;

/// Shared server state passed to all handlers via the axum `State` extractor.
pub struct Store {
    pub supervisor: Arc<Supervisor>,
    pub bridge: Arc<Bridge>,
    pub audit: Arc<AuditLog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth_token: String,
    pub browse_enabled: bool,
    pub shutdown: CancellationToken,
}

/// Source address tag attached to every request by [`client_addr_layer`].
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

/// JSON error body shared by HTTP and WebSocket error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody { code: code.as_str().to_string(), message: message.into() },
        }
    }
}

impl IntoResponse for OpError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::new(self.code, self.message))).into_response()
    }
}

/// Build the full API router.
pub fn build_router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/sessions", post(http::spawn).get(http::list))
        .route("/api/v1/sessions/{id}", get(http::get_session).delete(http::kill))
        .route("/api/v1/sessions/{id}/input", post(http::input))
        .route("/api/v1/sessions/{id}/resize", post(http::resize))
        .route("/api/v1/sessions/{id}/task", post(http::set_task))
        .route("/api/v1/sessions/{id}/scrollback", get(http::scrollback))
        .route("/api/v1/sessions/{id}/transcript", get(http::transcript))
        .route("/api/v1/sessions/{id}/metrics", get(http::metrics))
        .route("/api/v1/groups", get(http::groups))
        .route("/api/v1/audit", get(http::audit))
        .route("/api/v1/browse", get(browse::browse))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&store),
            ratelimit::ratelimit_layer,
        ))
        .layer(middleware::from_fn_with_state(Arc::clone(&store), auth::auth_layer))
        .layer(middleware::from_fn(client_addr_layer))
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(store)
}

/// Tag each request with its peer address (or `local` when the transport
/// does not surface one, e.g. in-process tests).
async fn client_addr_layer(mut req: Request, next: Next) -> Response {
    let addr = req
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_string());
    req.extensions_mut().insert(ClientAddr(addr));
    next.run(req).await
}

/// Origin allowed only when it is localhost or 127.0.0.1 over http, any port.
fn allowed_origin(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else { return false };
    for base in ["http://localhost", "http://127.0.0.1"] {
        if let Some(rest) = origin.strip_prefix(base) {
            if rest.is_empty() || rest.starts_with(':') {
                return true;
            }
        }
    }
    false
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| allowed_origin(origin)))
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
