// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket message types: internally-tagged JSON enums, one per direction.

use serde::{Deserialize, Serialize};

use crate::store::SessionInfo;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full session list, sent once on connect.
    Sessions { sessions: Vec<SessionInfo> },
    #[serde(rename = "session:created")]
    SessionCreated { session: Box<SessionInfo> },
    #[serde(rename = "session:exited")]
    SessionExited {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    #[serde(rename = "session:stateChanged")]
    SessionStateChanged {
        session_id: String,
        state: String,
        prev: String,
    },
    /// Coalesced terminal output.
    Output { session_id: String, data: String },
    /// Scrollback snapshot delivered on subscribe.
    Scrollback { session_id: String, data: String },
    Error { message: String },
}

impl ServerMessage {
    /// Output and scrollback frames may be dropped under backpressure;
    /// everything else must get through.
    pub fn droppable(&self) -> bool {
        matches!(self, Self::Output { .. } | Self::Scrollback { .. })
    }

    /// Rough payload size used against the per-client byte budget.
    pub fn cost(&self) -> usize {
        match self {
            Self::Output { data, .. } | Self::Scrollback { data, .. } => data.len(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        session_id: String,
        #[serde(default)]
        cols: Option<f64>,
        #[serde(default)]
        rows: Option<f64>,
    },
    Unsubscribe {
        session_id: String,
    },
    Input {
        session_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        #[serde(default)]
        cols: Option<f64>,
        #[serde(default)]
        rows: Option<f64>,
    },
}

#[cfg(test)]
#[path = "ws_msg_tests.rs"]
mod tests;
