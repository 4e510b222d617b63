// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Home-rooted directory listing for the dashboard's cwd picker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, OpError};
use crate::transport::Store;

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Serialize)]
pub struct BrowseResponse {
    pub path: String,
    pub entries: Vec<BrowseEntry>,
}

/// `GET /api/v1/browse?path=`: list a directory at or beneath the user's
/// home. Anything whose realpath escapes home is refused.
pub async fn browse(
    State(state): State<Arc<Store>>,
    Query(query): Query<BrowseQuery>,
) -> Result<impl IntoResponse, OpError> {
    if !state.browse_enabled {
        return Err(OpError::new(ErrorCode::NotFound, "browse endpoint disabled"));
    }

    let home = home_dir()?;
    let requested = query.path.map(PathBuf::from).unwrap_or_else(|| home.clone());
    let resolved = resolve_under(&requested, &home).await?;

    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(&resolved)
        .await
        .map_err(|e| OpError::new(ErrorCode::BadRequest, format!("not listable: {e}")))?;
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push(BrowseEntry { name, is_dir });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    Ok(Json(BrowseResponse { path: resolved.display().to_string(), entries }))
}

fn home_dir() -> Result<PathBuf, OpError> {
    let home = std::env::var("HOME")
        .map_err(|_| OpError::internal("no home directory"))?;
    std::fs::canonicalize(home).map_err(|e| OpError::internal(format!("bad home: {e}")))
}

/// Canonicalize `requested` and require it to equal or sit beneath `home`.
async fn resolve_under(requested: &Path, home: &Path) -> Result<PathBuf, OpError> {
    let resolved = tokio::fs::canonicalize(requested)
        .await
        .map_err(|_| OpError::new(ErrorCode::AccessDenied, "access denied"))?;
    if resolved == home || resolved.starts_with(home) {
        Ok(resolved)
    } else {
        Err(OpError::new(ErrorCode::AccessDenied, "access denied"))
    }
}

#[cfg(test)]
#[path = "browse_tests.rs"]
mod tests;
