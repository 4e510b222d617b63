// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend drivers: the abstraction owning each agent's terminal.
//!
//! Two production variants behind one contract (a direct PTY owned by this
//! process, and tmux-hosted sessions that survive supervisor restarts) plus
//! a null variant for tests. Selection happens once at startup; a supervisor
//! never mixes backends.

pub mod pty;
pub mod recover;
pub mod tmux;

pub use pty::{PtyBackend, PtySession};
pub use tmux::{TmuxBackend, TmuxSession};

use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::test_support::{NullBackend, NullSession};

/// Push notification from a driver to the supervisor core.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Output(Bytes),
    Exit { code: Option<i32> },
}

/// A driver event addressed to its session.
#[derive(Debug, Clone)]
pub struct DriverMsg {
    pub id: String,
    pub event: DriverEvent,
}

impl DriverMsg {
    pub fn output(id: impl Into<String>, data: Bytes) -> Self {
        Self { id: id.into(), event: DriverEvent::Output(data) }
    }

    pub fn exit(id: impl Into<String>, code: Option<i32>) -> Self {
        Self { id: id.into(), event: DriverEvent::Exit { code } }
    }
}

/// Everything needed to create one agent session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Program plus arguments; never empty.
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Environment variable names stripped from the child environment.
    pub env_strip: Vec<String>,
}

/// The backend hosting all of a supervisor's sessions.
pub enum Backend {
    Pty(PtyBackend),
    Tmux(TmuxBackend),
    Null(NullBackend),
}

impl Backend {
    /// Create a session, wiring its output and exit notifications into
    /// `events`.
    pub async fn create(
        &self,
        id: &str,
        spec: &SpawnSpec,
        events: mpsc::Sender<DriverMsg>,
    ) -> anyhow::Result<SessionHandle> {
        match self {
            Self::Pty(backend) => {
                Ok(SessionHandle::Pty(backend.create(id, spec, events)?))
            }
            Self::Tmux(backend) => {
                Ok(SessionHandle::Tmux(backend.create(id, spec, events).await?))
            }
            Self::Null(backend) => Ok(SessionHandle::Null(backend.create(id, spec))),
        }
    }

    pub fn tmux(&self) -> Option<&TmuxBackend> {
        match self {
            Self::Tmux(backend) => Some(backend),
            _ => None,
        }
    }
}

/// Per-session driver resources, released exactly once per session.
#[derive(Clone)]
pub enum SessionHandle {
    Pty(PtySession),
    Tmux(TmuxSession),
    Null(NullSession),
}

impl SessionHandle {
    /// Deliver input bytes to the agent.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::Pty(session) => session.write(data).await,
            Self::Tmux(session) => session.write(data).await,
            Self::Null(session) => session.write(data),
        }
    }

    /// Propagate a terminal resize. Returns `false` when the driver refused;
    /// descriptor dimensions must then stay unchanged.
    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        match self {
            Self::Pty(session) => session.resize(cols, rows),
            Self::Tmux(session) => session.resize(cols, rows).await,
            Self::Null(session) => session.resize(cols, rows),
        }
    }

    /// Terminate the session and release driver resources. Harmless when
    /// already terminated.
    pub async fn kill(&self) {
        match self {
            Self::Pty(session) => session.kill(),
            Self::Tmux(session) => session.kill().await,
            Self::Null(session) => session.kill(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Pty(session) => Some(session.pid()),
            Self::Tmux(session) => session.pid(),
            Self::Null(session) => session.pid(),
        }
    }
}
