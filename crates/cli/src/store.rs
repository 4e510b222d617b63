// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry: descriptors, id/name assignment, capacity accounting.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::driver::SessionHandle;
use crate::scrollback::Scrollback;
use crate::transcript::Transcript;

/// Base for auto-assigned session names.
pub const AUTO_NAME_BASE: &str = "agent";

/// Default session group.
pub const DEFAULT_GROUP: &str = "default";

/// Coarse lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Classified state of the agent inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Idle,
    Working,
    PermissionNeeded,
    Compacting,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::PermissionNeeded => "permission_needed",
            Self::Compacting => "compacting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable, observable record for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub group: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub detailed_state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub task_started_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
    pub task: Option<String>,
    pub compaction_count: u32,
    pub total_working_ms: u64,
    pub total_idle_ms: u64,
    pub total_permission_wait_ms: u64,
}

impl SessionInfo {
    /// Fresh descriptor for a session that was just spawned.
    pub fn new(
        id: String,
        name: String,
        group: String,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
        task: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            group,
            cwd,
            status: SessionStatus::Running,
            detailed_state: AgentState::Starting,
            exit_code: None,
            pid: None,
            created_at: now,
            last_activity_at: now,
            task_started_at: now,
            cols,
            rows,
            task,
            compaction_count: 0,
            total_working_ms: 0,
            total_idle_ms: 0,
            total_permission_wait_ms: 0,
        }
    }
}

/// Everything the supervisor tracks for one live session.
pub struct SessionEntry {
    pub info: SessionInfo,
    pub handle: SessionHandle,
    pub scrollback: Scrollback,
    pub transcript: Transcript,
    /// First message to auto-inject on the first transition to idle.
    /// Consumed once; cleared on exit so it can never fire late.
    pub pending_task: Option<String>,
}

/// In-memory registry of session entries keyed by 8-hex-digit ids.
pub struct SessionStore {
    sessions: HashMap<String, SessionEntry>,
    /// Ids handed out by [`reserve_id`](Self::reserve_id) whose driver is
    /// still being created; they count toward capacity.
    reserved: HashSet<String>,
    name_counter: u64,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            reserved: HashSet::new(),
            name_counter: 0,
            max_sessions,
        }
    }

    /// Whether another session may be admitted.
    pub fn at_capacity(&self) -> bool {
        self.sessions.len() + self.reserved.len() >= self.max_sessions
    }

    /// Reserve a fresh id, regenerating on collision with live or reserved ids.
    pub fn reserve_id(&mut self) -> String {
        loop {
            let id = format!("{:08x}", rand::rng().random::<u32>());
            if !self.sessions.contains_key(&id) && !self.reserved.contains(&id) {
                self.reserved.insert(id.clone());
                return id;
            }
        }
    }

    /// Drop a reservation without inserting a session (spawn failed).
    pub fn release_reservation(&mut self, id: &str) {
        self.reserved.remove(id);
    }

    /// Next auto-assigned name. The counter advances monotonically and is
    /// never reused, regardless of kills or exits in between.
    pub fn next_auto_name(&mut self) -> String {
        self.name_counter += 1;
        if self.name_counter == 1 {
            AUTO_NAME_BASE.to_string()
        } else {
            format!("{} {}", AUTO_NAME_BASE, self.name_counter)
        }
    }

    /// Insert a session, consuming its reservation.
    pub fn insert(&mut self, entry: SessionEntry) {
        self.reserved.remove(&entry.info.id);
        self.sessions.insert(entry.info.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        self.sessions.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionEntry> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionEntry> {
        self.sessions.values_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Descriptor snapshots, newest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> =
            self.sessions.values().map(|e| e.info.clone()).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Sorted, deduplicated group names across live sessions.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> =
            self.sessions.values().map(|e| e.info.group.clone()).collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
