// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session transcript: the abstracted user/assistant exchange recovered
//! from the raw byte stream via state transitions.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default cap on retained transcript entries per session.
pub const DEFAULT_TRANSCRIPT_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
}

/// Bounded ring of transcript entries, oldest dropped when full.
#[derive(Debug)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    max_entries: usize,
}

impl Transcript {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: VecDeque::new(), max_entries }
    }

    /// Record a user input line. Trailing carriage return is stripped;
    /// empty content is not recorded. Returns the entry when recorded.
    pub fn push_user(&mut self, data: &str) -> Option<TranscriptEntry> {
        let content = data.strip_suffix('\r').unwrap_or(data);
        if content.is_empty() {
            return None;
        }
        Some(self.push(Role::User, content.to_string()))
    }

    /// Record an assistant reply. Empty content is not recorded.
    pub fn push_assistant(&mut self, content: String) -> Option<TranscriptEntry> {
        if content.is_empty() {
            return None;
        }
        Some(self.push(Role::Assistant, content))
    }

    fn push(&mut self, role: Role, content: String) -> TranscriptEntry {
        let entry = TranscriptEntry { timestamp: Utc::now(), role, content };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        entry
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Optional JSONL sink appending every entry to `<dir>/<session-id>.jsonl`.
///
/// Failures are logged once per write and never propagated; the supervisor's
/// liveness does not depend on transcript files. The disk write runs on the
/// blocking pool so a stalled transcript directory cannot hold up the async
/// workers; outside a runtime (unit tests) it happens inline.
#[derive(Debug, Clone)]
pub struct TranscriptSink {
    dir: Option<PathBuf>,
}

impl TranscriptSink {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn append(&self, session_id: &str, entry: &TranscriptEntry) {
        let Some(ref dir) = self.dir else { return };
        let dir = dir.clone();
        let session_id = session_id.to_string();
        let entry = entry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_entry(&dir, &session_id, &entry));
            }
            Err(_) => write_entry(&dir, &session_id, &entry),
        }
    }
}

fn write_entry(dir: &Path, session_id: &str, entry: &TranscriptEntry) {
    if let Err(e) = append_jsonl(dir, session_id, entry) {
        warn!(session = session_id, "transcript file append failed: {e}");
    }
}

fn append_jsonl(dir: &Path, session_id: &str, entry: &TranscriptEntry) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{session_id}.jsonl"));
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
#[path = "transcript_tests.rs"]
mod tests;
