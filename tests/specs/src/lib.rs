// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `corral` binary as a subprocess and exercises it over
//! HTTP and WebSocket with the direct-pty backend hosting `/bin/cat`.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Token used by every spec process.
pub const TOKEN: &str = "spec-test-token";

/// Resolve the path to the compiled `corral` binary.
pub fn corral_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("corral")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `corral` process, killed on drop.
pub struct CorralProcess {
    child: Child,
    port: u16,
    _state_dir: tempfile::TempDir,
}

impl CorralProcess {
    /// Spawn corral on the pty backend with `cat` as the hosted agent.
    pub fn start() -> anyhow::Result<Self> {
        let binary = corral_binary();
        anyhow::ensure!(binary.exists(), "corral binary not found at {}", binary.display());

        let port = free_port()?;
        let state_dir = tempfile::tempdir()?;

        let child = Command::new(&binary)
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--auth-token",
                TOKEN,
                "--backend",
                "pty",
                "--agent-command",
                "cat",
                "--log-format",
                "text",
                "--log-level",
                "warn",
                "--state-dir",
                &state_dir.path().to_string_lossy(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, _state_dir: state_dir })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws?token={TOKEN}", self.port)
    }

    /// Poll health until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("corral did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for CorralProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
