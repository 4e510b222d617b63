// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup recovery: rediscover tmux-hosted sessions left over from a prior
//! supervisor instance and rehydrate their descriptors.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::store::{AgentState, SessionInfo, SessionStatus};

use super::tmux::{SessionListing, TmuxBackend, TmuxSession};
use super::DriverMsg;

/// Pane lines replayed through the state detector per recovered session.
const BOOTSTRAP_LINES: u32 = 50;

/// A session rediscovered from the daemon.
pub struct RecoveredSession {
    pub info: SessionInfo,
    pub handle: TmuxSession,
    /// Rendered pane tail, fed through the detector to seed its state.
    pub bootstrap: String,
}

/// Enumerate managed daemon sessions and rehydrate those not already known.
///
/// Sessions whose tee cannot be re-attached are skipped (their pipe file is
/// unlinked by the failed attach). Never fails: recovery problems are logged
/// and the supervisor starts with whatever could be rescued.
pub async fn discover(
    backend: &TmuxBackend,
    known_ids: &HashSet<String>,
    events: &mpsc::Sender<DriverMsg>,
    default_cols: u16,
    default_rows: u16,
) -> Vec<RecoveredSession> {
    let ids = match backend.list_sessions().await {
        Ok(SessionListing::Ids(ids)) => ids,
        Ok(SessionListing::DaemonDown) => return Vec::new(),
        Err(e) => {
            warn!("recovery: session enumeration failed: {e}");
            return Vec::new();
        }
    };

    let mut recovered = Vec::new();
    for id in ids {
        if known_ids.contains(&id) {
            continue;
        }

        let handle = match backend.attach_existing(&id, events.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session = %id, "recovery: tee re-attach failed, skipping: {e}");
                continue;
            }
        };

        let info = match backend.load_metadata(&id).await {
            Some(mut info) => {
                // The metadata was written while running; force the liveness
                // fields back regardless of what the file says.
                info.status = SessionStatus::Running;
                info.detailed_state = AgentState::Idle;
                info.exit_code = None;
                info.pid = handle.pid();
                info
            }
            None => synthesize_info(backend, &id, handle.pid(), default_cols, default_rows).await,
        };

        let bootstrap = match backend.capture_tail(&id, BOOTSTRAP_LINES).await {
            Ok(tail) => tail,
            Err(e) => {
                warn!(session = %id, "recovery: pane capture failed: {e}");
                String::new()
            }
        };

        info!(session = %id, name = %info.name, "recovered session");
        recovered.push(RecoveredSession { info, handle, bootstrap });
    }
    recovered
}

/// Minimal descriptor for a session with no metadata file.
async fn synthesize_info(
    backend: &TmuxBackend,
    id: &str,
    pid: Option<u32>,
    cols: u16,
    rows: u16,
) -> SessionInfo {
    let cwd = backend.pane_cwd(id).await.unwrap_or_else(|_| PathBuf::from("/"));
    let mut info = SessionInfo::new(
        id.to_string(),
        format!("recovered {id}"),
        "recovered".to_string(),
        cwd,
        cols,
        rows,
        None,
    );
    info.detailed_state = AgentState::Idle;
    info.pid = pid;
    info
}
