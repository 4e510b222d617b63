// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;
use rand::RngCore;

/// Flags always accepted for the spawned agent, before configured extras.
pub const BASE_ALLOWED_ARGS: &[&str] = &[
    "--model",
    "-m",
    "--print",
    "-p",
    "--resume",
    "-r",
    "--continue",
    "-c",
    "--dangerously-skip-permissions",
    "--verbose",
    "--version",
];

/// The permission-skip flag merged into argv by the spawn path.
pub const SKIP_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";

/// Environment variable names never passed to agent children.
pub const SENSITIVE_ENV_VARS: &[&str] = &["CORRAL_AUTH_TOKEN", "CORRAL_HOST", "CORRAL_PORT"];

/// Multi-session supervisor for terminal AI coding agents.
#[derive(Debug, Clone, Parser)]
#[command(name = "corral", version, about)]
pub struct Config {
    /// Host address to bind to.
    #[arg(long, env = "CORRAL_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// HTTP port to listen on.
    #[arg(long, env = "CORRAL_PORT", default_value = "18900")]
    pub port: u16,

    /// Bearer token for API authentication. Generated when unset.
    #[arg(long, env = "CORRAL_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Session backend: tmux, pty, or auto.
    #[arg(long, env = "CORRAL_BACKEND", default_value = "auto")]
    pub backend: String,

    /// Agent program to spawn.
    #[arg(long, env = "CORRAL_AGENT_COMMAND", default_value = "claude")]
    pub agent_command: String,

    /// Inject the permission-skip flag into agent argv by default.
    #[arg(long, env = "CORRAL_SKIP_PERMISSIONS", default_value = "false")]
    pub skip_permissions: bool,

    /// Enable the home-rooted directory browse endpoint.
    #[arg(long, env = "CORRAL_BROWSE", default_value = "false")]
    pub browse: bool,

    /// Extra allowed agent argv flags, comma-separated.
    #[arg(long, env = "CORRAL_ALLOW_ARGS", allow_hyphen_values = true)]
    pub allow_args: Option<String>,

    /// Webhook URL notified of session lifecycle events.
    #[arg(long, env = "CORRAL_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Directory receiving per-session transcript JSONL files.
    #[arg(long, env = "CORRAL_TRANSCRIPT_DIR")]
    pub transcript_dir: Option<PathBuf>,

    /// Maximum transcript entries retained per session.
    #[arg(long, env = "CORRAL_TRANSCRIPT_MAX", default_value = "500")]
    pub transcript_max: usize,

    /// Audit ring capacity.
    #[arg(long, env = "CORRAL_AUDIT_RING", default_value = "1000")]
    pub audit_ring: usize,

    /// Append-only audit log file.
    #[arg(long, env = "CORRAL_AUDIT_FILE")]
    pub audit_file: Option<PathBuf>,

    /// State directory for pipes, metadata, and the connection file.
    #[arg(long, env = "CORRAL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Maximum concurrent live sessions.
    #[arg(long, env = "CORRAL_MAX_SESSIONS", default_value = "100")]
    pub max_sessions: usize,

    /// Default terminal columns for new sessions.
    #[arg(long, env = "CORRAL_COLS", default_value = "200")]
    pub cols: u16,

    /// Default terminal rows for new sessions.
    #[arg(long, env = "CORRAL_ROWS", default_value = "50")]
    pub rows: u16,

    /// Log format (json or text).
    #[arg(long, env = "CORRAL_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CORRAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Which backend hosts agent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Tmux,
    Pty,
    Auto,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.backend_kind()?;
        if let Some(ref token) = self.auth_token {
            if token.len() < 8 {
                anyhow::bail!("auth token must be at least 8 characters");
            }
        }
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        Ok(())
    }

    pub fn backend_kind(&self) -> anyhow::Result<BackendKind> {
        match self.backend.to_lowercase().as_str() {
            "tmux" => Ok(BackendKind::Tmux),
            "pty" => Ok(BackendKind::Pty),
            "auto" => Ok(BackendKind::Auto),
            other => anyhow::bail!("invalid backend: {other}"),
        }
    }

    /// The configured token, or a freshly generated one.
    pub fn effective_auth_token(&self) -> String {
        match self.auth_token {
            Some(ref token) => token.clone(),
            None => generate_token(),
        }
    }

    /// Full argv allow-list: base flags plus configured extras.
    pub fn allowed_args(&self) -> Vec<String> {
        let mut allowed: Vec<String> =
            BASE_ALLOWED_ARGS.iter().map(|s| s.to_string()).collect();
        if let Some(ref extra) = self.allow_args {
            for flag in extra.split(',') {
                let flag = flag.trim();
                if !flag.is_empty() {
                    allowed.push(flag.to_string());
                }
            }
        }
        allowed
    }

    /// State directory, defaulting to `$XDG_STATE_HOME/corral`.
    pub fn effective_state_dir(&self) -> PathBuf {
        match self.state_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_default();
                    format!("{home}/.local/state")
                });
                PathBuf::from(state_home).join("corral")
            }
        }
    }
}

/// 16 random bytes, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Clamp a terminal dimension to [1, 500] after rounding.
///
/// Non-finite or absent inputs fall back to the caller-provided default.
pub fn clamp_dimension(value: Option<f64>, fallback: u16) -> u16 {
    match value {
        Some(v) if v.is_finite() => {
            let rounded = v.round();
            if rounded < 1.0 {
                1
            } else if rounded > 500.0 {
                500
            } else {
                rounded as u16
            }
        }
        _ => fallback,
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
