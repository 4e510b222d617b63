// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ErrorCode;
use crate::transport::{ErrorResponse, Store};

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers.
pub fn validate_bearer(headers: &HeaderMap, expected: &str) -> Result<(), ErrorCode> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ErrorCode::Unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or(ErrorCode::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(ErrorCode::Unauthorized)
    }
}

/// Validate the token presented on a WebSocket upgrade query string.
pub fn validate_ws_token(token: Option<&str>, expected: &str) -> Result<(), ErrorCode> {
    match token {
        Some(token) if constant_time_eq(token, expected) => Ok(()),
        _ => Err(ErrorCode::Unauthorized),
    }
}

/// Axum middleware enforcing Bearer authentication on all routes except
/// `/api/v1/health` and the WebSocket upgrade, which validates its own
/// query-parameter token.
pub async fn auth_layer(
    State(state): State<Arc<Store>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/ws" {
        return next.run(req).await;
    }

    if let Err(code) = validate_bearer(req.headers(), &state.auth_token) {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(ErrorResponse::new(code, "unauthorized")),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
