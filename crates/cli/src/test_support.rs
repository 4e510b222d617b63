// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test fixtures: a null driver backend that records writes without
//! spawning anything, and small conversion helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::SpawnSpec;

/// Backend that fabricates sessions without any child process.
#[derive(Default)]
pub struct NullBackend {
    /// Every write delivered to any session, in order: `(session_id, data)`.
    pub writes: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    /// Every spawn spec, in order: `(session_id, spec)`.
    pub specs: Arc<Mutex<Vec<(String, SpawnSpec)>>>,
    /// When set, resize calls report failure.
    pub refuse_resize: bool,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing_resize() -> Self {
        Self { refuse_resize: true, ..Self::default() }
    }

    pub fn create(&self, id: &str, spec: &SpawnSpec) -> NullSession {
        self.specs.lock().push((id.to_string(), spec.clone()));
        NullSession {
            id: id.to_string(),
            writes: Arc::clone(&self.writes),
            refuse_resize: self.refuse_resize,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Argv recorded for one session's spawn.
    pub fn argv_for(&self, id: &str) -> Option<Vec<String>> {
        self.specs
            .lock()
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, spec)| spec.argv.clone())
    }

    /// Writes recorded for one session, concatenated.
    pub fn written_to(&self, id: &str) -> Vec<u8> {
        let writes = self.writes.lock();
        writes
            .iter()
            .filter(|(sid, _)| sid == id)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// Number of write calls delivered to one session.
    pub fn write_count(&self, id: &str) -> usize {
        self.writes.lock().iter().filter(|(sid, _)| sid == id).count()
    }
}

/// Handle for a fabricated session.
#[derive(Clone)]
pub struct NullSession {
    id: String,
    writes: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    refuse_resize: bool,
    killed: Arc<AtomicBool>,
}

impl NullSession {
    pub fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        self.writes.lock().push((self.id.clone(), data.to_vec()));
        Ok(())
    }

    pub fn resize(&self, _cols: u16, _rows: u16) -> bool {
        !self.refuse_resize
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    pub fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

/// Adapt non-anyhow error types (e.g. axum-test's) to `anyhow::Result`.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}
