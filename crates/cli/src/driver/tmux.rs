// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multiplexer driver: agents live in detached tmux sessions, so they
//! survive supervisor restarts. Output is teed to a file-backed pipe and
//! polled; input goes through a staged paste buffer; exits are discovered by
//! the supervisor-wide session poll.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::SessionInfo;

use super::{DriverMsg, SpawnSpec};

/// Name prefix for tmux sessions managed by this supervisor.
pub const SESSION_PREFIX: &str = "corral-";

/// Cadence of the per-session pipe poll.
pub const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound on any single tmux invocation.
const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of asking the daemon for its session set.
#[derive(Debug)]
pub enum SessionListing {
    /// Managed session ids currently known to the daemon.
    Ids(Vec<String>),
    /// The daemon is not running; every hosted session is gone.
    DaemonDown,
}

/// Factory and shared state for tmux-hosted sessions.
pub struct TmuxBackend {
    state_dir: PathBuf,
}

impl TmuxBackend {
    /// Prepare the backend, creating the owner-only state layout.
    pub fn new(state_dir: PathBuf) -> anyhow::Result<Self> {
        let backend = Self { state_dir };
        create_private_dir(&backend.state_dir)?;
        create_private_dir(&backend.pipes_dir())?;
        create_private_dir(&backend.sessions_dir())?;
        Ok(backend)
    }

    /// Whether the tmux binary is reachable.
    pub async fn daemon_available() -> bool {
        matches!(
            tmux(&["-V".to_string()]).await,
            Ok(out) if out.status.success()
        )
    }

    fn pipes_dir(&self) -> PathBuf {
        self.state_dir.join("pipes")
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn session_name(&self, id: &str) -> String {
        format!("{SESSION_PREFIX}{id}")
    }

    pub fn pipe_path(&self, id: &str) -> PathBuf {
        self.pipes_dir().join(format!("{id}.pipe"))
    }

    pub fn input_path(&self, id: &str) -> PathBuf {
        self.pipes_dir().join(format!("input-{id}.tmp"))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    /// Create a detached session running the agent, tee its pane to the
    /// pipe file, and start the pipe poller.
    pub async fn create(
        &self,
        id: &str,
        spec: &SpawnSpec,
        events: mpsc::Sender<DriverMsg>,
    ) -> anyhow::Result<TmuxSession> {
        if spec.argv.is_empty() {
            bail!("empty argv");
        }
        let name = self.session_name(id);
        recreate_pipe(&self.pipe_path(id)).await?;

        let shell_cmd = compose_command(spec);
        run_tmux(&[
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            name.clone(),
            "-x".to_string(),
            spec.cols.to_string(),
            "-y".to_string(),
            spec.rows.to_string(),
            "-c".to_string(),
            spec.cwd.display().to_string(),
            shell_cmd,
        ])
        .await
        .context("tmux new-session failed")?;

        if let Err(e) = self.attach_tee(&name, id).await {
            // Roll back: the half-created session would otherwise leak.
            let _ = run_tmux(&["kill-session".to_string(), "-t".to_string(), name.clone()]).await;
            let _ = tokio::fs::remove_file(self.pipe_path(id)).await;
            return Err(e);
        }

        let pid = self.pane_pid(&name).await.ok();
        Ok(self.build_session(id, name, pid, events))
    }

    /// Re-attach to a session discovered during recovery: fresh pipe, fresh
    /// tee, fresh poller.
    pub async fn attach_existing(
        &self,
        id: &str,
        events: mpsc::Sender<DriverMsg>,
    ) -> anyhow::Result<TmuxSession> {
        let name = self.session_name(id);
        recreate_pipe(&self.pipe_path(id)).await?;
        if let Err(e) = self.attach_tee(&name, id).await {
            let _ = tokio::fs::remove_file(self.pipe_path(id)).await;
            return Err(e);
        }
        let pid = self.pane_pid(&name).await.ok();
        Ok(self.build_session(id, name, pid, events))
    }

    fn build_session(
        &self,
        id: &str,
        name: String,
        pid: Option<u32>,
        events: mpsc::Sender<DriverMsg>,
    ) -> TmuxSession {
        let session = TmuxSession {
            id: id.to_string(),
            name,
            pipe_path: self.pipe_path(id),
            input_path: self.input_path(id),
            metadata_path: self.metadata_path(id),
            buffer_name: format!("{SESSION_PREFIX}input-{id}"),
            pid,
            poll_cancel: CancellationToken::new(),
        };
        session.spawn_poller(events);
        session
    }

    async fn attach_tee(&self, name: &str, id: &str) -> anyhow::Result<()> {
        let tee = format!("cat >> {}", shell_quote(&self.pipe_path(id).display().to_string()));
        run_tmux(&["pipe-pane".to_string(), "-t".to_string(), name.to_string(), tee])
            .await
            .context("tmux pipe-pane failed")?;
        Ok(())
    }

    async fn pane_pid(&self, name: &str) -> anyhow::Result<u32> {
        let out = run_tmux(&[
            "display-message".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            name.to_string(),
            "#{pane_pid}".to_string(),
        ])
        .await?;
        String::from_utf8_lossy(&out.stdout).trim().parse().context("unparsable pane pid")
    }

    /// Current working directory of the session's pane.
    pub async fn pane_cwd(&self, id: &str) -> anyhow::Result<PathBuf> {
        let name = self.session_name(id);
        let out = run_tmux(&[
            "display-message".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            name,
            "#{pane_current_path}".to_string(),
        ])
        .await?;
        Ok(PathBuf::from(String::from_utf8_lossy(&out.stdout).trim()))
    }

    /// Pane pid for a recovered session.
    pub async fn pane_pid_for(&self, id: &str) -> Option<u32> {
        self.pane_pid(&self.session_name(id)).await.ok()
    }

    /// Last `lines` of rendered pane content, for detector bootstrap.
    pub async fn capture_tail(&self, id: &str, lines: u32) -> anyhow::Result<String> {
        let name = self.session_name(id);
        let out = run_tmux(&[
            "capture-pane".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            name,
            "-S".to_string(),
            format!("-{lines}"),
        ])
        .await?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Ask the daemon for the managed session ids.
    pub async fn list_sessions(&self) -> anyhow::Result<SessionListing> {
        let out = tmux(&["list-sessions".to_string(), "-F".to_string(), "#{session_name}".to_string()])
            .await
            .context("tmux list-sessions failed")?;

        if out.status.success() {
            let ids = String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|l| l.strip_prefix(SESSION_PREFIX))
                .map(|s| s.to_string())
                .collect();
            return Ok(SessionListing::Ids(ids));
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("no server running") || stderr.contains("error connecting to") {
            return Ok(SessionListing::DaemonDown);
        }
        bail!("tmux list-sessions: {}", stderr.trim());
    }

    /// Rewrite the descriptor metadata file (owner-only).
    pub async fn persist_metadata(&self, info: &SessionInfo) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(info)?;
        write_private_file(&self.metadata_path(&info.id), &json).await
    }

    /// Load persisted metadata for a session id, if present and readable.
    pub async fn load_metadata(&self, id: &str) -> Option<SessionInfo> {
        let raw = tokio::fs::read(self.metadata_path(id)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Remove the pipe and metadata files for a session.
    pub async fn remove_files(&self, id: &str) {
        let _ = tokio::fs::remove_file(self.pipe_path(id)).await;
        let _ = tokio::fs::remove_file(self.metadata_path(id)).await;
    }
}

/// One tmux-hosted session.
#[derive(Clone)]
pub struct TmuxSession {
    id: String,
    name: String,
    pipe_path: PathBuf,
    input_path: PathBuf,
    metadata_path: PathBuf,
    buffer_name: String,
    pid: Option<u32>,
    poll_cancel: CancellationToken,
}

impl TmuxSession {
    /// Binary-safe input: stage to an owner-only temp file, load it into a
    /// named buffer, paste literally. The temp file is removed by the guard
    /// even when a tmux command fails.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        write_private_file(&self.input_path, data).await?;
        let _guard = TempFileGuard(self.input_path.clone());

        run_tmux(&[
            "load-buffer".to_string(),
            "-b".to_string(),
            self.buffer_name.clone(),
            self.input_path.display().to_string(),
        ])
        .await
        .context("tmux load-buffer failed")?;

        run_tmux(&[
            "paste-buffer".to_string(),
            "-d".to_string(),
            "-b".to_string(),
            self.buffer_name.clone(),
            "-t".to_string(),
            self.name.clone(),
        ])
        .await
        .context("tmux paste-buffer failed")?;

        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        run_tmux(&[
            "resize-window".to_string(),
            "-t".to_string(),
            self.name.clone(),
            "-x".to_string(),
            cols.to_string(),
            "-y".to_string(),
            rows.to_string(),
        ])
        .await
        .is_ok()
    }

    /// Stop the poller, kill the hosted session, remove its files.
    pub async fn kill(&self) {
        self.poll_cancel.cancel();
        let _ = run_tmux(&["kill-session".to_string(), "-t".to_string(), self.name.clone()]).await;
        let _ = tokio::fs::remove_file(&self.pipe_path).await;
        let _ = tokio::fs::remove_file(&self.metadata_path).await;
    }

    /// Stop the poller and unlink the pipe; used when the exit poll finds
    /// the session gone from the daemon.
    pub async fn release_after_exit(&self) {
        self.poll_cancel.cancel();
        let _ = tokio::fs::remove_file(&self.pipe_path).await;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pipe poller: reads the tee file at a fixed cadence with a byte
    /// cursor. A missing file means the session is gone; the poll stops
    /// silently and the exit poll confirms shortly after.
    fn spawn_poller(&self, events: mpsc::Sender<DriverMsg>) {
        let id = self.id.clone();
        let path = self.pipe_path.clone();
        let cancel = self.poll_cancel.clone();
        tokio::spawn(async move {
            let mut cursor: u64 = 0;
            let mut interval = tokio::time::interval(PIPE_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let len = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(_) => break,
                };
                if len < cursor {
                    // Pipe recreated underneath us; restart from the top.
                    cursor = 0;
                }
                if len == cursor {
                    continue;
                }

                match read_delta(&path, cursor, len).await {
                    Ok(data) if !data.is_empty() => {
                        cursor += data.len() as u64;
                        if events.send(DriverMsg::output(id.as_str(), Bytes::from(data))).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(session = %id, "pipe read failed: {e}");
                        break;
                    }
                }
            }
        });
    }
}

/// Removes the staged paste file on scope exit.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Single-quote an argument for the tmux shell command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Shell command for the detached session: unset directives for sensitive
/// variables, then the quoted argv.
pub fn compose_command(spec: &SpawnSpec) -> String {
    let mut cmd = String::from("env");
    for var in &spec.env_strip {
        cmd.push_str(" -u ");
        cmd.push_str(var);
    }
    for arg in &spec.argv {
        cmd.push(' ');
        cmd.push_str(&shell_quote(arg));
    }
    cmd
}

async fn read_delta(path: &Path, from: u64, to: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(from)).await?;
    let mut data = Vec::with_capacity((to - from) as usize);
    file.take(to - from).read_to_end(&mut data).await?;
    Ok(data)
}

/// Run tmux, capturing output, bounded by [`TMUX_TIMEOUT`].
async fn tmux(args: &[String]) -> anyhow::Result<std::process::Output> {
    let fut = Command::new("tmux").args(args).output();
    match tokio::time::timeout(TMUX_TIMEOUT, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => bail!("tmux command timed out: {}", args.join(" ")),
    }
}

/// Run tmux and require success.
async fn run_tmux(args: &[String]) -> anyhow::Result<std::process::Output> {
    let out = tmux(args).await?;
    if !out.status.success() {
        bail!(
            "tmux {} failed: {}",
            args.first().map(String::as_str).unwrap_or(""),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out)
}

/// Create a directory with owner-only permissions.
fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("create {}", path.display()))),
    }
}

/// Write a file with owner-only permissions, truncating any previous content.
async fn write_private_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600);
    let mut file = opts.open(path).await?;
    file.write_all(data).await?;
    Ok(())
}

/// Unlink-then-create the pipe file, empty, owner-only.
async fn recreate_pipe(path: &Path) -> anyhow::Result<()> {
    let _ = tokio::fs::remove_file(path).await;
    write_private_file(path, b"").await
}

#[cfg(test)]
#[path = "tmux_tests.rs"]
mod tests;
