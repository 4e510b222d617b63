// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output, state-change, and exit handling: the event side of the
//! serialized core.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::warn;

use crate::detector::{strip_controls, IDLE_TIMEOUT};
use crate::driver::tmux::SessionListing;
use crate::driver::{recover, DriverEvent, DriverMsg, SessionHandle, TmuxSession};
use crate::event::Event;
use crate::scrollback::{Scrollback, SCROLLBACK_LIMIT};
use crate::store::{AgentState, SessionEntry, SessionStatus};
use crate::transcript::Transcript;

use super::{Core, Supervisor};

/// Cadence of the supervisor-wide tmux exit poll.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

impl Supervisor {
    /// Entry point for all driver push events.
    pub(crate) async fn handle_driver_event(self: &Arc<Self>, msg: DriverMsg) {
        match msg.event {
            DriverEvent::Output(data) => self.handle_output(&msg.id, data).await,
            DriverEvent::Exit { code } => self.handle_exit(&msg.id, code).await,
        }
    }

    /// One output chunk: scrollback append, activity refresh, detector feed,
    /// event emission.
    async fn handle_output(self: &Arc<Self>, id: &str, data: Bytes) {
        let (task, arm_idle) = {
            let mut core = self.core.lock().await;
            match core.store.get_mut(id) {
                Some(entry) if entry.info.status == SessionStatus::Running => {
                    entry.scrollback.push(data.clone());
                    entry.info.last_activity_at = Utc::now();
                }
                // Unknown (killed) or already exited: no events after exit.
                _ => return,
            }

            let outcome = core.detector.feed(id, &data);
            self.emit(Event::Output { id: id.to_string(), data });

            let task = outcome
                .transition
                .and_then(|(prev, new)| self.apply_transition(&mut core, id, prev, new));
            (task, outcome.arm_idle)
        };

        if let Some(gen) = arm_idle {
            self.spawn_idle_timer(id.to_string(), gen);
        }
        if let Some(task) = task {
            self.inject_task(id.to_string(), task);
        }
    }

    /// Descriptor bookkeeping for a detector transition. Returns the pending
    /// task when the session just reached idle for the first time.
    fn apply_transition(
        &self,
        core: &mut Core,
        id: &str,
        prev: AgentState,
        new: AgentState,
    ) -> Option<String> {
        let totals = core.detector.totals(id);
        let entry = core.store.get_mut(id)?;

        entry.info.detailed_state = new;
        if let Some(t) = totals {
            entry.info.total_working_ms = t.working_ms;
            entry.info.total_idle_ms = t.idle_ms;
            entry.info.total_permission_wait_ms = t.permission_wait_ms;
        }
        if new == AgentState::Compacting {
            entry.info.compaction_count += 1;
        }

        if prev == AgentState::Working && new == AgentState::Idle {
            let segment = entry.scrollback.assistant_segment();
            let text = strip_controls(&String::from_utf8_lossy(&segment));
            let text = text.trim().to_string();
            if let Some(recorded) = entry.transcript.push_assistant(text) {
                self.append_transcript_file(id, &recorded);
            }
        }
        if new == AgentState::Working {
            entry.scrollback.mark_assistant_start();
        }

        let task = if new == AgentState::Idle { entry.pending_task.take() } else { None };

        self.emit(Event::StateChange { id: id.to_string(), state: new, prev });
        task
    }

    /// Single-shot 30 s idle timer for a working session. The generation
    /// goes stale the moment another chunk arrives, making cancellation
    /// implicit.
    fn spawn_idle_timer(self: &Arc<Self>, id: String, gen: u64) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(IDLE_TIMEOUT).await;
            supervisor.idle_timer_fired(&id, gen).await;
        });
    }

    async fn idle_timer_fired(self: &Arc<Self>, id: &str, gen: u64) {
        let task = {
            let mut core = self.core.lock().await;
            match core.detector.idle_timeout(id, gen) {
                Some((prev, new)) => self.apply_transition(&mut core, id, prev, new),
                None => None,
            }
        };
        if let Some(task) = task {
            self.inject_task(id.to_string(), task);
        }
    }

    /// Deliver the auto-task as a regular write (so the user transcript
    /// entry and assistant segmentation apply), off the core path.
    fn inject_task(self: &Arc<Self>, id: String, task: String) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let line = format!("{task}\r");
            if let Err(e) = supervisor.write(&id, &line).await {
                warn!(session = %id, "task auto-inject failed: {e}");
            }
        });
    }

    /// Natural exit pushed by the direct-PTY driver. The descriptor stays in
    /// the store until an explicit kill removes it.
    async fn handle_exit(self: &Arc<Self>, id: &str, code: Option<i32>) {
        let mut core = self.core.lock().await;
        let Some(entry) = core.store.get_mut(id) else {
            // Killed before the natural exit arrived; the kill already
            // emitted the terminal event.
            return;
        };
        if entry.info.status == SessionStatus::Exited {
            return;
        }
        entry.info.status = SessionStatus::Exited;
        entry.info.exit_code = code;
        entry.info.pid = None;
        entry.pending_task = None;
        core.detector.remove(id);
        self.emit(Event::Exit { id: id.to_string(), code });
    }

    /// Start the 2 s exit poll. No-op for the direct-PTY backend, which
    /// pushes exits instead.
    pub fn spawn_exit_poller(self: &Arc<Self>) {
        if self.backend.tmux().is_none() {
            return;
        }
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXIT_POLL_INTERVAL);
            // Ticks are processed sequentially; a slow one delays rather
            // than stacking.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = supervisor.exit_poll_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                supervisor.exit_poll_tick().await;
            }
        });
    }

    async fn exit_poll_tick(&self) {
        let Some(tmux) = self.backend.tmux() else { return };
        match tmux.list_sessions().await {
            Ok(SessionListing::Ids(ids)) => {
                let alive: HashSet<String> = ids.into_iter().collect();
                self.mark_missing_exited(Some(&alive)).await;
            }
            Ok(SessionListing::DaemonDown) => {
                self.mark_missing_exited(None).await;
            }
            // Transient query failure: do NOT mark sessions exited.
            Err(e) => warn!("exit poll failed: {e}"),
        }
    }

    /// Transition running sessions absent from `alive` (or all of them when
    /// the daemon is gone) to exited, with no exit code.
    async fn mark_missing_exited(&self, alive: Option<&HashSet<String>>) {
        let mut released: Vec<TmuxSession> = Vec::new();
        {
            let mut core = self.core.lock().await;
            let running: Vec<String> = core
                .store
                .iter()
                .filter(|e| e.info.status == SessionStatus::Running)
                .map(|e| e.info.id.clone())
                .collect();

            for id in running {
                if alive.is_some_and(|a| a.contains(&id)) {
                    continue;
                }
                if let Some(entry) = core.store.get_mut(&id) {
                    entry.info.status = SessionStatus::Exited;
                    entry.info.exit_code = None;
                    entry.info.pid = None;
                    entry.pending_task = None;
                    if let SessionHandle::Tmux(session) = &entry.handle {
                        released.push(session.clone());
                    }
                }
                core.detector.remove(&id);
                self.emit(Event::Exit { id, code: None });
            }
        }
        for session in released {
            session.release_after_exit().await;
        }
    }

    /// Rehydrate sessions from a prior supervisor instance. Returns how many
    /// were recovered.
    pub async fn recover(self: &Arc<Self>) -> usize {
        let Some(tmux) = self.backend.tmux() else { return 0 };

        let known: HashSet<String> =
            self.core.lock().await.store.ids().into_iter().collect();
        let recovered = recover::discover(
            tmux,
            &known,
            &self.driver_tx(),
            self.settings.default_cols,
            self.settings.default_rows,
        )
        .await;

        let mut infos = Vec::new();
        let mut timers = Vec::new();
        {
            let mut core = self.core.lock().await;
            for r in recovered {
                let mut info = r.info;
                core.detector.add(&info.id);
                if !r.bootstrap.is_empty() {
                    let outcome = core.detector.feed(&info.id, r.bootstrap.as_bytes());
                    if let Some(gen) = outcome.arm_idle {
                        timers.push((info.id.clone(), gen));
                    }
                }
                // Keep the metadata's idle default unless the pane tail
                // showed something more specific.
                match core.detector.state(&info.id) {
                    Some(AgentState::Starting) | None => {}
                    Some(state) => info.detailed_state = state,
                }

                core.store.insert(SessionEntry {
                    info: info.clone(),
                    handle: SessionHandle::Tmux(r.handle),
                    scrollback: Scrollback::new(SCROLLBACK_LIMIT),
                    transcript: Transcript::new(self.settings.transcript_max),
                    pending_task: None,
                });
                infos.push(info);
            }
        }

        for (id, gen) in timers {
            self.spawn_idle_timer(id, gen);
        }
        for info in &infos {
            self.persist_metadata(info).await;
        }
        infos.len()
    }
}
