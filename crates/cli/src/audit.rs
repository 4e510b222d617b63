// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit trail: a bounded in-memory ring of control-surface actions, with an
//! optional append-only JSONL file.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub detail: String,
}

/// Ring of recent audit entries. Emitting never fails; file problems are
/// logged and swallowed. The file append runs on the blocking pool so a
/// slow audit disk cannot stall async request handling; outside a runtime
/// (unit tests) it happens inline.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    file: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(capacity: usize, file: Option<PathBuf>) -> Self {
        Self { ring: Mutex::new(VecDeque::new()), capacity, file }
    }

    pub fn emit(&self, actor: &str, action: &str, detail: &str) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            detail: detail.to_string(),
        };

        {
            let mut ring = self.ring.lock();
            ring.push_back(entry.clone());
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }

        if let Some(ref path) = self.file {
            let path = path.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || write_line(&path, &entry));
                }
                Err(_) => write_line(&path, &entry),
            }
        }
    }

    /// Snapshot of retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

fn write_line(path: &Path, entry: &AuditEntry) {
    if let Err(e) = append_line(path, entry) {
        warn!("audit file append failed: {e}");
    }
}

fn append_line(path: &Path, entry: &AuditEntry) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(entry)?)?;
    Ok(())
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
