// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level service runner: config to listening server to graceful
//! shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::audit::AuditLog;
use crate::bridge::Bridge;
use crate::config::{BackendKind, Config, SENSITIVE_ENV_VARS};
use crate::driver::{Backend, PtyBackend, TmuxBackend};
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::transcript::TranscriptSink;
use crate::transport::ratelimit::{RateLimiter, SPAWN_LIMIT, SPAWN_WINDOW};
use crate::transport::{build_router, Store};
use crate::webhook::WebhookNotifier;

pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / CORRAL_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("CORRAL_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the supervisor service until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let auth_token = config.effective_auth_token();
    if config.auth_token.is_none() {
        info!("generated auth token: {auth_token}");
    }

    let state_dir = config.effective_state_dir();
    let backend = select_backend(&config, &state_dir).await?;
    let is_tmux = matches!(backend, Backend::Tmux(_));

    let settings = SupervisorSettings {
        agent_command: config.agent_command.clone(),
        allowed_args: config.allowed_args(),
        skip_permissions_default: config.skip_permissions,
        env_strip: SENSITIVE_ENV_VARS.iter().map(|s| s.to_string()).collect(),
        max_sessions: config.max_sessions,
        default_cols: config.cols,
        default_rows: config.rows,
        transcript_max: config.transcript_max,
    };
    let sink = TranscriptSink::new(config.transcript_dir.clone());
    let supervisor = Supervisor::new(backend, settings, sink)?;

    if is_tmux {
        let recovered = supervisor.recover().await;
        if recovered > 0 {
            info!("recovered {recovered} session(s) from a previous instance");
        }
        supervisor.spawn_exit_poller();
    }

    let bridge = Bridge::new(Arc::clone(&supervisor));
    if let Some(webhook) = WebhookNotifier::new(config.webhook_url.clone()) {
        webhook.spawn_forwarder(supervisor.subscribe_events());
    }

    let shutdown = CancellationToken::new();
    let rate_limiter = Arc::new(RateLimiter::new(SPAWN_LIMIT, SPAWN_WINDOW));
    rate_limiter.spawn_sweeper(shutdown.clone());

    let store = Arc::new(Store {
        supervisor: Arc::clone(&supervisor),
        bridge,
        audit: Arc::new(AuditLog::new(config.audit_ring, config.audit_file.clone())),
        rate_limiter,
        auth_token,
        browse_enabled: config.browse,
        shutdown: shutdown.clone(),
    });

    // A panicking task is a fatal condition: log it and begin the graceful
    // shutdown path rather than limping along with torn state.
    let panic_shutdown = shutdown.clone();
    std::panic::set_hook(Box::new(move |info| {
        error!("fatal: {info}");
        panic_shutdown.cancel();
    }));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let local = listener.local_addr()?;
    info!("corral listening on {local}");

    let connection_file = write_connection_file(&state_dir, &config.host, local.port());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.cancel();
    });

    let router = build_router(Arc::clone(&store));
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    if let Err(e) = serve.await {
        error!("HTTP server error: {e}");
    }

    // Kill-all stops the exit poller before touching sessions; the
    // connection file goes last.
    info!("shutting down");
    supervisor.kill_all().await;
    if let Some(path) = connection_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

async fn select_backend(config: &Config, state_dir: &Path) -> anyhow::Result<Backend> {
    match config.backend_kind()? {
        BackendKind::Pty => Ok(Backend::Pty(PtyBackend::new())),
        BackendKind::Tmux => {
            if !TmuxBackend::daemon_available().await {
                anyhow::bail!("tmux backend selected but tmux is not installed");
            }
            Ok(Backend::Tmux(TmuxBackend::new(state_dir.to_path_buf())?))
        }
        BackendKind::Auto => {
            if TmuxBackend::daemon_available().await {
                Ok(Backend::Tmux(TmuxBackend::new(state_dir.to_path_buf())?))
            } else {
                info!("tmux not found, using direct-pty backend");
                Ok(Backend::Pty(PtyBackend::new()))
            }
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

/// Advertise the bound address for local clients; owner-only, removed on
/// shutdown. Best-effort: a failure is logged, not fatal.
fn write_connection_file(state_dir: &Path, host: &str, port: u16) -> Option<PathBuf> {
    use std::io::Write;
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    let result = (|| -> anyhow::Result<PathBuf> {
        let _ = std::fs::DirBuilder::new().recursive(true).mode(0o700).create(state_dir);
        let path = state_dir.join("corral.json");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        let body = serde_json::json!({
            "host": host,
            "port": port,
            "pid": std::process::id(),
        });
        writeln!(file, "{body}")?;
        Ok(path)
    })();

    match result {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!("connection file write failed: {e}");
            None
        }
    }
}
