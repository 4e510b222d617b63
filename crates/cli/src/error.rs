// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the HTTP and WebSocket surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidCwd,
    DisallowedArg,
    BadRequest,
    NotFound,
    AtCapacity,
    RateLimited,
    Unauthorized,
    AccessDenied,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCwd => 400,
            Self::DisallowedArg => 400,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::AtCapacity => 429,
            Self::RateLimited => 429,
            Self::Unauthorized => 401,
            Self::AccessDenied => 403,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCwd => "INVALID_CWD",
            Self::DisallowedArg => "DISALLOWED_ARG",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::AtCapacity => "AT_CAPACITY",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure crossing the supervisor boundary: a code for status
/// mapping plus a human-readable message.
#[derive(Debug, Clone)]
pub struct OpError {
    pub code: ErrorCode,
    pub message: String,
}

impl OpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("unknown session: {id}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for OpError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
