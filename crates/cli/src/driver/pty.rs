// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Direct-PTY driver: forks the agent as a child of the supervisor with a
//! pseudoterminal master owned by this process. Output and exit arrive as
//! push events; no polling.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::debug;

use super::{DriverMsg, SpawnSpec};

/// The PTY master descriptor, registered with the tokio reactor.
#[derive(Debug)]
struct Master(OwnedFd);

impl AsRawFd for Master {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl Master {
    /// Reactor-driven I/O requires a non-blocking descriptor.
    fn nonblocking(self) -> io::Result<Self> {
        let current = fcntl(&self.0, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_retain(current) | OFlag::O_NONBLOCK;
        fcntl(&self.0, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(self)
    }
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 }
}

/// Factory for direct-PTY sessions.
pub struct PtyBackend;

impl PtyBackend {
    pub fn new() -> Self {
        Self
    }

    /// Fork the agent on a fresh PTY and spawn its output reader.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn create(
        &self,
        id: &str,
        spec: &SpawnSpec,
        events: mpsc::Sender<DriverMsg>,
    ) -> anyhow::Result<PtySession> {
        if spec.argv.is_empty() {
            bail!("empty argv");
        }

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize(spec.cols, spec.rows), None) }
            .context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                for name in &spec.env_strip {
                    std::env::remove_var(name);
                }
                std::env::set_current_dir(&spec.cwd).context("chdir failed")?;

                let c_args: Vec<CString> = spec
                    .argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                let master = Master(master).nonblocking()?;
                let session = PtySession {
                    master: Arc::new(
                        AsyncFd::new(master).context("reactor registration failed")?,
                    ),
                    child_pid: child,
                };
                session.spawn_reader(id.to_string(), events);
                Ok(session)
            }
        }
    }
}

impl Default for PtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One agent on a PTY master owned by the supervisor.
#[derive(Clone)]
pub struct PtySession {
    master: Arc<AsyncFd<Master>>,
    child_pid: Pid,
}

impl PtySession {
    /// Reader task: pushes output chunks until EOF, then reaps the child and
    /// pushes the exit notification.
    fn spawn_reader(&self, id: String, events: mpsc::Sender<DriverMsg>) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match session.read_output(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(DriverMsg::output(id.as_str(), data)).await.is_err() {
                            break;
                        }
                    }
                    // The slave side closed: normal child exit on Linux.
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                    Err(e) => {
                        debug!(session = %id, "pty read error: {e}");
                        break;
                    }
                }
            }

            // Reap on a blocking thread to avoid stalling the runtime.
            let pid = session.child_pid;
            let code = tokio::task::spawn_blocking(move || reap_exit_code(pid))
                .await
                .unwrap_or(None);
            let _ = events.send(DriverMsg::exit(id.as_str(), code)).await;
        });
    }

    /// One read through the reactor; `Ok(0)` is EOF.
    async fn read_output(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut ready = self.master.readable().await?;
            match ready.try_io(|fd| {
                nix::unistd::read(fd, buf).map_err(io::Error::from)
            }) {
                Ok(done) => return done,
                // Spurious readiness; wait for the next edge.
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut ready = self.master.writable().await?;
            match ready.try_io(|fd| nix::unistd::write(fd, remaining).map_err(io::Error::from)) {
                Ok(written) => remaining = &remaining[written?..],
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        let ws = winsize(cols, rows);
        // SAFETY: TIOCSWINSZ only reads the properly-initialized Winsize
        // struct and applies it to a descriptor we own.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        ret == 0
    }

    /// Best-effort graceful termination: SIGHUP, then SIGKILL.
    ///
    /// The reader task observes the resulting EOF and reaps the child, so
    /// calling this on an already-exited session is harmless.
    pub fn kill(&self) {
        let _ = kill(self.child_pid, Signal::SIGHUP);
        let pid = self.child_pid;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let _ = kill(pid, Signal::SIGKILL);
        });
    }

    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }
}

/// Block until the child is reaped; `None` when it died to a signal or was
/// already collected elsewhere.
fn reap_exit_code(pid: Pid) -> Option<i32> {
    loop {
        break match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(..)) => None,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => None,
        };
    }
}
