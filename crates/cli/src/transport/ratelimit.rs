// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-source spawn rate limiting: a sliding window per address, with a
//! periodic sweep that prunes addresses whose windows have emptied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::ErrorCode;
use crate::transport::{ClientAddr, ErrorResponse, Store};

/// Spawns allowed per source address per window.
pub const SPAWN_LIMIT: usize = 10;

/// Sliding window length.
pub const SPAWN_WINDOW: Duration = Duration::from_secs(60);

/// Cadence of the address sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sliding-window counter keyed by source address.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { windows: Mutex::new(HashMap::new()), limit, window }
    }

    /// Record an attempt for `key`. Returns `false` when over the limit
    /// (the attempt is not recorded in that case).
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            window.pop_front();
        }
        if window.len() >= self.limit {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop addresses whose windows have emptied.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.retain(|_, window| {
            while window.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
                window.pop_front();
            }
            !window.is_empty()
        });
    }

    /// Number of tracked addresses (sweep observability).
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }

    /// Periodic sweeper, cancelled with the server.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => limiter.sweep(),
                }
            }
        });
    }
}

/// Middleware limiting session spawns per source address.
pub async fn ratelimit_layer(
    State(state): State<Arc<Store>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::POST && req.uri().path() == "/api/v1/sessions" {
        let addr = req
            .extensions()
            .get::<ClientAddr>()
            .map(|a| a.0.clone())
            .unwrap_or_else(|| "local".to_string());
        if !state.rate_limiter.check(&addr) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(ErrorResponse::new(ErrorCode::RateLimited, "spawn rate exceeded")),
            )
                .into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
