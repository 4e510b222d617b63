// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session supervisor: spawn/kill/write/resize orchestration atop the chosen
//! backend driver.
//!
//! All Session Store and State Detector mutations happen under one async
//! mutex, the serialized core. Driver subprocess invocations and pipe reads
//! run outside the lock and re-enter through small events, so a slow tmux
//! command never stalls bookkeeping for other sessions.

mod transition;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::SKIP_PERMISSIONS_FLAG;
use crate::detector::{StateDetector, StateMetrics};
use crate::driver::{Backend, DriverMsg, SessionHandle, SpawnSpec};
use crate::error::{ErrorCode, OpError};
use crate::event::Event;
use crate::scrollback::{Scrollback, SCROLLBACK_LIMIT};
use crate::store::{
    SessionEntry, SessionInfo, SessionStatus, SessionStore, DEFAULT_GROUP,
};
use crate::transcript::{Transcript, TranscriptEntry, TranscriptSink};

/// Upper bound on session/group name length.
const MAX_NAME_LEN: usize = 200;

/// Static knobs for a supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub agent_command: String,
    pub allowed_args: Vec<String>,
    pub skip_permissions_default: bool,
    pub env_strip: Vec<String>,
    pub max_sessions: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    pub transcript_max: usize,
}

/// Caller-supplied spawn parameters.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub name: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Agent arguments, validated against the allow-list.
    pub args: Vec<String>,
    pub cols: Option<f64>,
    pub rows: Option<f64>,
    /// First user message, auto-injected on the first idle transition.
    pub task: Option<String>,
    /// Overrides the configured skip-permissions default.
    pub skip_permissions: Option<bool>,
}

pub(crate) struct Core {
    pub store: SessionStore,
    pub detector: StateDetector,
}

/// The supervisor. Constructed once per process via [`Supervisor::new`].
pub struct Supervisor {
    pub(crate) core: Mutex<Core>,
    pub(crate) backend: Backend,
    pub(crate) settings: SupervisorSettings,
    pub(crate) transcript_sink: TranscriptSink,
    events_tx: broadcast::Sender<Event>,
    driver_tx: mpsc::Sender<DriverMsg>,
    pub(crate) exit_poll_cancel: CancellationToken,
}

impl Supervisor {
    /// Build the supervisor and start its driver event pump.
    pub fn new(
        backend: Backend,
        settings: SupervisorSettings,
        transcript_sink: TranscriptSink,
    ) -> anyhow::Result<Arc<Self>> {
        let (events_tx, _) = broadcast::channel(1024);
        let (driver_tx, mut driver_rx) = mpsc::channel::<DriverMsg>(256);

        let supervisor = Arc::new(Self {
            core: Mutex::new(Core {
                store: SessionStore::new(settings.max_sessions),
                detector: StateDetector::new()?,
            }),
            backend,
            settings,
            transcript_sink,
            events_tx,
            driver_tx,
            exit_poll_cancel: CancellationToken::new(),
        });

        let pump = Arc::clone(&supervisor);
        tokio::spawn(async move {
            while let Some(msg) = driver_rx.recv().await {
                pump.handle_driver_event(msg).await;
            }
        });

        Ok(supervisor)
    }

    /// Subscribe to the supervisor event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn driver_tx(&self) -> mpsc::Sender<DriverMsg> {
        self.driver_tx.clone()
    }

    /// Spawn a new agent session.
    pub async fn spawn(self: &Arc<Self>, opts: SpawnOptions) -> Result<SessionInfo, OpError> {
        let cwd = match opts.cwd {
            Some(ref cwd) => cwd.clone(),
            None => std::env::current_dir()
                .map_err(|e| OpError::internal(format!("no working directory: {e}")))?,
        };
        match std::fs::metadata(&cwd) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(OpError::new(
                    ErrorCode::InvalidCwd,
                    format!("cwd does not exist or is not a directory: {}", cwd.display()),
                ))
            }
        }

        validate_args(&opts.args, &self.settings.allowed_args)?;
        validate_name(opts.name.as_deref())?;
        validate_name(opts.group.as_deref())?;

        let args = merge_skip_permissions(
            opts.args.clone(),
            opts.skip_permissions.unwrap_or(self.settings.skip_permissions_default),
        );
        let mut argv = vec![self.settings.agent_command.clone()];
        argv.extend(args);

        let cols = crate::config::clamp_dimension(opts.cols, self.settings.default_cols);
        let rows = crate::config::clamp_dimension(opts.rows, self.settings.default_rows);

        // Reserve identity under the lock; create the driver outside it.
        let (id, name) = {
            let mut core = self.core.lock().await;
            if core.store.at_capacity() {
                return Err(OpError::new(
                    ErrorCode::AtCapacity,
                    format!("session limit reached ({})", self.settings.max_sessions),
                ));
            }
            let id = core.store.reserve_id();
            let name = match opts.name {
                Some(ref name) => name.clone(),
                None => core.store.next_auto_name(),
            };
            (id, name)
        };

        let spec = SpawnSpec {
            argv,
            cwd: cwd.clone(),
            cols,
            rows,
            env_strip: self.settings.env_strip.clone(),
        };
        let handle = match self.backend.create(&id, &spec, self.driver_tx()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.core.lock().await.store.release_reservation(&id);
                return Err(OpError::internal(format!("driver spawn failed: {e:#}")));
            }
        };

        let group = opts.group.unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let mut info = SessionInfo::new(id.clone(), name, group, cwd, cols, rows, opts.task.clone());
        info.pid = handle.pid();

        {
            let mut core = self.core.lock().await;
            core.detector.add(&id);
            core.store.insert(SessionEntry {
                info: info.clone(),
                handle,
                scrollback: Scrollback::new(SCROLLBACK_LIMIT),
                transcript: Transcript::new(self.settings.transcript_max),
                pending_task: opts.task,
            });
            self.emit(Event::Created(Box::new(info.clone())));
        }

        self.persist_metadata(&info).await;
        Ok(info)
    }

    /// Inject input bytes into a running session, recording the user
    /// transcript entry and opening a new assistant segment.
    pub async fn write(&self, id: &str, data: &str) -> Result<(), OpError> {
        let handle = self.running_handle(id).await?;
        handle
            .write(data.as_bytes())
            .await
            .map_err(|e| OpError::internal(format!("driver write failed: {e:#}")))?;

        let mut core = self.core.lock().await;
        if let Some(entry) = core.store.get_mut(id) {
            if let Some(recorded) = entry.transcript.push_user(data) {
                self.append_transcript_file(id, &recorded);
            }
            entry.scrollback.mark_assistant_start();
        }
        Ok(())
    }

    /// Resize a running session's terminal. Dimensions are clamped; the
    /// descriptor is updated only when the driver accepts the resize.
    pub async fn resize(
        &self,
        id: &str,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<(u16, u16), OpError> {
        let (handle, cur_cols, cur_rows) = {
            let core = self.core.lock().await;
            let entry = core.store.get(id).ok_or_else(|| OpError::not_found(id))?;
            if entry.info.status != SessionStatus::Running {
                return Err(OpError::new(ErrorCode::NotFound, format!("session exited: {id}")));
            }
            (entry.handle.clone(), entry.info.cols, entry.info.rows)
        };

        let cols = crate::config::clamp_dimension(cols, cur_cols);
        let rows = crate::config::clamp_dimension(rows, cur_rows);

        if handle.resize(cols, rows).await {
            let mut core = self.core.lock().await;
            if let Some(entry) = core.store.get_mut(id) {
                entry.info.cols = cols;
                entry.info.rows = rows;
            }
            Ok((cols, rows))
        } else {
            Ok((cur_cols, cur_rows))
        }
    }

    /// Kill a session. Removes the descriptor; idempotent at the removal
    /// level: the second call returns `false`.
    ///
    /// A session whose exit event was already emitted is removed silently:
    /// exactly one terminal event per session, ever.
    pub async fn kill(&self, id: &str) -> bool {
        let (entry, was_running) = {
            let mut core = self.core.lock().await;
            let Some(entry) = core.store.remove(id) else {
                return false;
            };
            core.detector.remove(id);
            let was_running = entry.info.status == SessionStatus::Running;
            if was_running {
                // Detach-before-terminate: the driver's own exit event will
                // find no session and be dropped, so this emission is the
                // only terminal event.
                let code = match entry.handle {
                    SessionHandle::Tmux(_) => None,
                    SessionHandle::Pty(_) | SessionHandle::Null(_) => Some(-1),
                };
                self.emit(Event::Exit { id: id.to_string(), code });
            }
            (entry, was_running)
        };

        if was_running {
            entry.handle.kill().await;
        } else if let Some(tmux) = self.backend.tmux() {
            tmux.remove_files(id).await;
        }
        true
    }

    /// Stop the exit poller, then kill every session.
    ///
    /// The ordering matters: a poll tick interleaving with the kills would
    /// re-mark sessions exited and double-emit events.
    pub async fn kill_all(&self) {
        self.exit_poll_cancel.cancel();
        let ids = self.core.lock().await.store.ids();
        for id in ids {
            self.kill(&id).await;
        }
    }

    /// Update the session's task and refresh `task_started_at`.
    pub async fn set_task(&self, id: &str, task: String) -> Result<SessionInfo, OpError> {
        let info = {
            let mut core = self.core.lock().await;
            let entry = core.store.get_mut(id).ok_or_else(|| OpError::not_found(id))?;
            entry.info.task = Some(task);
            entry.info.task_started_at = chrono::Utc::now();
            entry.info.clone()
        };
        self.persist_metadata(&info).await;
        Ok(info)
    }

    pub async fn get_info(&self, id: &str) -> Option<SessionInfo> {
        self.core.lock().await.store.get(id).map(|e| e.info.clone())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.core.lock().await.store.list()
    }

    pub async fn groups(&self) -> Vec<String> {
        self.core.lock().await.store.groups()
    }

    pub async fn count(&self) -> usize {
        self.core.lock().await.store.count()
    }

    /// Defensive copy of a session's scrollback.
    pub async fn scrollback(&self, id: &str) -> Option<Vec<u8>> {
        self.core.lock().await.store.get(id).map(|e| e.scrollback.contents())
    }

    pub async fn transcript(&self, id: &str) -> Option<Vec<TranscriptEntry>> {
        self.core.lock().await.store.get(id).map(|e| e.transcript.entries())
    }

    /// Detector totals plus elapsed time in the current state.
    pub async fn metrics(&self, id: &str) -> Option<StateMetrics> {
        self.core.lock().await.detector.metrics(id)
    }

    async fn running_handle(&self, id: &str) -> Result<SessionHandle, OpError> {
        let core = self.core.lock().await;
        let entry = core.store.get(id).ok_or_else(|| OpError::not_found(id))?;
        if entry.info.status != SessionStatus::Running {
            return Err(OpError::new(ErrorCode::NotFound, format!("session exited: {id}")));
        }
        Ok(entry.handle.clone())
    }

    pub(crate) async fn persist_metadata(&self, info: &SessionInfo) {
        if let Some(tmux) = self.backend.tmux() {
            if let Err(e) = tmux.persist_metadata(info).await {
                warn!(session = %info.id, "metadata persist failed: {e}");
            }
        }
    }

    pub(crate) fn append_transcript_file(&self, id: &str, entry: &TranscriptEntry) {
        self.transcript_sink.append(id, entry);
    }
}

/// Check every argument against the allow-list: exact flags, `flag=value`
/// forms, and non-flag positionals pass; anything else is rejected.
fn validate_args(args: &[String], allowed: &[String]) -> Result<(), OpError> {
    for arg in args {
        if !arg.starts_with('-') {
            continue;
        }
        let flag = arg.split('=').next().unwrap_or(arg.as_str());
        if !allowed.iter().any(|a| a == flag) {
            return Err(OpError::new(
                ErrorCode::DisallowedArg,
                format!("argument not allowed: {arg}"),
            ));
        }
    }
    Ok(())
}

fn validate_name(name: Option<&str>) -> Result<(), OpError> {
    if let Some(name) = name {
        if name.chars().count() > MAX_NAME_LEN {
            return Err(OpError::new(
                ErrorCode::BadRequest,
                format!("name longer than {MAX_NAME_LEN} characters"),
            ));
        }
    }
    Ok(())
}

/// Apply the effective skip-permissions switch: `true` adds the flag when
/// absent, `false` strips it when present.
fn merge_skip_permissions(mut args: Vec<String>, skip: bool) -> Vec<String> {
    let present = args.iter().any(|a| a == SKIP_PERMISSIONS_FLAG);
    if skip && !present {
        args.push(SKIP_PERMISSIONS_FLAG.to_string());
    } else if !skip && present {
        args.retain(|a| a != SKIP_PERMISSIONS_FLAG);
    }
    args
}

#[cfg(test)]
#[path = "../supervisor_tests.rs"]
mod tests;
