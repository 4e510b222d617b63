// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::config::BASE_ALLOWED_ARGS;
use crate::detector::IDLE_TIMEOUT;
use crate::driver::{Backend, DriverMsg};
use crate::error::ErrorCode;
use crate::event::Event;
use crate::store::{AgentState, SessionStatus};
use crate::test_support::NullBackend;
use crate::transcript::{Role, TranscriptSink};

use super::*;

fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        agent_command: "agent".to_string(),
        allowed_args: BASE_ALLOWED_ARGS.iter().map(|s| s.to_string()).collect(),
        skip_permissions_default: false,
        env_strip: vec!["CORRAL_AUTH_TOKEN".to_string()],
        max_sessions: 100,
        default_cols: 200,
        default_rows: 50,
        transcript_max: 500,
    }
}

struct Fixture {
    supervisor: Arc<Supervisor>,
    backend: NullBackend,
}

fn fixture_with(settings: SupervisorSettings) -> Fixture {
    let backend = NullBackend::new();
    let shared = NullBackend {
        writes: Arc::clone(&backend.writes),
        specs: Arc::clone(&backend.specs),
        refuse_resize: backend.refuse_resize,
    };
    #[allow(clippy::expect_used)]
    let supervisor = Supervisor::new(Backend::Null(shared), settings, TranscriptSink::disabled())
        .expect("build supervisor");
    Fixture { supervisor, backend }
}

fn fixture() -> Fixture {
    fixture_with(test_settings())
}

async fn feed(supervisor: &Arc<Supervisor>, id: &str, chunk: &[u8]) {
    supervisor
        .handle_driver_event(DriverMsg::output(id, Bytes::copy_from_slice(chunk)))
        .await;
}

/// Let spawned helper tasks (task injection, idle timers) run.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn spawn_returns_running_descriptor() -> anyhow::Result<()> {
    let f = fixture();
    let info = f
        .supervisor
        .spawn(SpawnOptions {
            name: Some("test".to_string()),
            group: Some("g1".to_string()),
            ..SpawnOptions::default()
        })
        .await?;

    assert_eq!(info.status, SessionStatus::Running);
    assert_eq!(info.detailed_state, AgentState::Starting);
    assert_eq!(info.name, "test");
    assert_eq!(info.group, "g1");
    assert_eq!(info.task, None);
    assert_eq!(info.compaction_count, 0);
    assert_eq!(info.id.len(), 8);
    assert!(info.id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert_eq!(info.pid, Some(4242));
    Ok(())
}

#[tokio::test]
async fn auto_names_are_monotonic_across_kills() -> anyhow::Result<()> {
    let f = fixture();
    let a = f.supervisor.spawn(SpawnOptions::default()).await?;
    let b = f.supervisor.spawn(SpawnOptions::default()).await?;
    let c = f.supervisor.spawn(SpawnOptions::default()).await?;
    assert_eq!(a.name, "agent");
    assert_eq!(b.name, "agent 2");
    assert_eq!(c.name, "agent 3");

    // Kills never recycle the counter.
    assert!(f.supervisor.kill(&b.id).await);
    let d = f.supervisor.spawn(SpawnOptions::default()).await?;
    assert_eq!(d.name, "agent 4");
    Ok(())
}

#[tokio::test]
async fn spawn_rejects_bad_cwd() {
    let f = fixture();
    let result = f
        .supervisor
        .spawn(SpawnOptions {
            cwd: Some("/definitely/not/a/real/dir".into()),
            ..SpawnOptions::default()
        })
        .await;
    match result {
        Err(e) => assert_eq!(e.code, ErrorCode::InvalidCwd),
        Ok(_) => unreachable!("spawn must fail"),
    }
}

#[tokio::test]
async fn spawn_validates_argv_against_allow_list() -> anyhow::Result<()> {
    let f = fixture();

    // Enumerated flags, flag=value forms, and positionals all pass.
    let ok = f
        .supervisor
        .spawn(SpawnOptions {
            args: vec![
                "--model".to_string(),
                "opus".to_string(),
                "-p".to_string(),
                "--model=sonnet".to_string(),
                "positional".to_string(),
            ],
            ..SpawnOptions::default()
        })
        .await;
    assert!(ok.is_ok());

    let rejected = f
        .supervisor
        .spawn(SpawnOptions {
            args: vec!["--exec".to_string()],
            ..SpawnOptions::default()
        })
        .await;
    match rejected {
        Err(e) => assert_eq!(e.code, ErrorCode::DisallowedArg),
        Ok(_) => unreachable!("disallowed flag must fail"),
    }
    Ok(())
}

#[tokio::test]
async fn skip_permissions_option_overrides_default() -> anyhow::Result<()> {
    let f = fixture();

    let plain = f.supervisor.spawn(SpawnOptions::default()).await?;
    let argv = f.backend.argv_for(&plain.id).unwrap_or_default();
    assert!(!argv.iter().any(|a| a == "--dangerously-skip-permissions"));

    let skipping = f
        .supervisor
        .spawn(SpawnOptions { skip_permissions: Some(true), ..SpawnOptions::default() })
        .await?;
    let argv = f.backend.argv_for(&skipping.id).unwrap_or_default();
    assert_eq!(argv[0], "agent");
    assert!(argv.iter().any(|a| a == "--dangerously-skip-permissions"));

    // Explicit false strips a caller-provided flag.
    let stripped = f
        .supervisor
        .spawn(SpawnOptions {
            args: vec!["--dangerously-skip-permissions".to_string()],
            skip_permissions: Some(false),
            ..SpawnOptions::default()
        })
        .await?;
    let argv = f.backend.argv_for(&stripped.id).unwrap_or_default();
    assert!(!argv.iter().any(|a| a == "--dangerously-skip-permissions"));
    Ok(())
}

#[tokio::test]
async fn sensitive_env_names_reach_the_driver_spec() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    let specs = f.backend.specs.lock();
    let (_, spec) = specs.iter().find(|(id, _)| *id == info.id).map(|s| s.clone()).unwrap_or_else(
        || unreachable!("spawn recorded"),
    );
    assert_eq!(spec.env_strip, vec!["CORRAL_AUTH_TOKEN".to_string()]);
    Ok(())
}

#[tokio::test]
async fn spawn_enforces_session_ceiling() -> anyhow::Result<()> {
    let mut settings = test_settings();
    settings.max_sessions = 2;
    let f = fixture_with(settings);

    f.supervisor.spawn(SpawnOptions::default()).await?;
    f.supervisor.spawn(SpawnOptions::default()).await?;
    let third = f.supervisor.spawn(SpawnOptions::default()).await;
    match third {
        Err(e) => assert_eq!(e.code, ErrorCode::AtCapacity),
        Ok(_) => unreachable!("over-capacity spawn must fail"),
    }
    Ok(())
}

#[tokio::test]
async fn kill_is_idempotent_at_removal_level() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    assert!(f.supervisor.kill(&info.id).await);
    assert!(!f.supervisor.kill(&info.id).await);
    assert_eq!(f.supervisor.count().await, 0);
    Ok(())
}

#[tokio::test]
async fn kill_emits_exactly_one_exit() -> anyhow::Result<()> {
    let f = fixture();
    let mut rx = f.supervisor.subscribe_events();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    f.supervisor.kill(&info.id).await;
    f.supervisor.kill(&info.id).await;

    let events = drain(&mut rx);
    let exits: Vec<_> = events.iter().filter(|e| matches!(e, Event::Exit { .. })).collect();
    assert_eq!(exits.len(), 1);
    match exits[0] {
        Event::Exit { code, .. } => assert_eq!(*code, Some(-1)),
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test]
async fn natural_exit_keeps_descriptor_and_kill_is_silent() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    let mut rx = f.supervisor.subscribe_events();

    f.supervisor.handle_driver_event(DriverMsg::exit(&info.id, Some(0))).await;

    let after = f.supervisor.get_info(&info.id).await;
    match after {
        Some(ref i) => {
            assert_eq!(i.status, SessionStatus::Exited);
            assert_eq!(i.exit_code, Some(0));
            assert_eq!(i.pid, None);
        }
        None => unreachable!("descriptor stays until kill"),
    }

    // Kill removes the descriptor without a second terminal event.
    assert!(f.supervisor.kill(&info.id).await);
    let events = drain(&mut rx);
    let exits = events.iter().filter(|e| matches!(e, Event::Exit { .. })).count();
    assert_eq!(exits, 1);
    assert_eq!(f.supervisor.get_info(&info.id).await.map(|i| i.id), None);
    Ok(())
}

#[tokio::test]
async fn write_records_one_user_transcript_entry() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;

    f.supervisor.write(&info.id, "x\r").await?;
    let transcript = f.supervisor.transcript(&info.id).await.unwrap_or_default();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content, "x");

    // A bare carriage return records nothing.
    f.supervisor.write(&info.id, "\r").await?;
    assert_eq!(f.supervisor.transcript(&info.id).await.unwrap_or_default().len(), 1);
    Ok(())
}

#[tokio::test]
async fn write_rejects_unknown_and_exited_sessions() -> anyhow::Result<()> {
    let f = fixture();
    match f.supervisor.write("deadbeef", "hi").await {
        Err(e) => assert_eq!(e.code, ErrorCode::NotFound),
        Ok(_) => unreachable!(),
    }

    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    f.supervisor.handle_driver_event(DriverMsg::exit(&info.id, Some(0))).await;
    match f.supervisor.write(&info.id, "hi").await {
        Err(e) => assert_eq!(e.code, ErrorCode::NotFound),
        Ok(_) => unreachable!("write after exit must fail"),
    }
    Ok(())
}

#[tokio::test]
async fn output_chunk_with_prompt_reaches_idle() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    feed(&f.supervisor, &info.id, "some output\n\u{276f} ".as_bytes()).await;

    let after = f.supervisor.get_info(&info.id).await;
    assert_eq!(after.map(|i| i.detailed_state), Some(AgentState::Idle));
    Ok(())
}

#[tokio::test]
async fn permission_prompt_chunk_detected() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    feed(
        &f.supervisor,
        &info.id,
        b"Some context\nDo you want to proceed?\n(Y)es / No",
    )
    .await;

    let after = f.supervisor.get_info(&info.id).await;
    assert_eq!(after.map(|i| i.detailed_state), Some(AgentState::PermissionNeeded));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn working_session_falls_idle_after_timeout() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;

    feed(&f.supervisor, &info.id, b"\x1b[36m\xe2\x9c\xbb\x1b[0m Thinking...").await;
    assert_eq!(
        f.supervisor.get_info(&info.id).await.map(|i| i.detailed_state),
        Some(AgentState::Working)
    );

    // Let the timer task register its sleep before advancing the clock.
    settle().await;
    tokio::time::advance(IDLE_TIMEOUT).await;
    settle().await;

    let after = match f.supervisor.get_info(&info.id).await {
        Some(i) => i,
        None => unreachable!("session exists"),
    };
    assert_eq!(after.detailed_state, AgentState::Idle);
    assert_eq!(after.total_working_ms, IDLE_TIMEOUT.as_millis() as u64);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_capture_with_empty_segment_records_nothing() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;

    feed(&f.supervisor, &info.id, "\u{273b} Thinking...".as_bytes()).await;
    settle().await;
    tokio::time::advance(IDLE_TIMEOUT).await;
    settle().await;

    // Nothing was emitted after the assistant segment opened.
    assert!(f.supervisor.transcript(&info.id).await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn assistant_reply_captured_on_working_to_idle() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;

    f.supervisor.write(&info.id, "question\r").await?;
    feed(&f.supervisor, &info.id, "\u{273b} Thinking...".as_bytes()).await;
    feed(&f.supervisor, &info.id, "The answer is 42\n\u{276f} ".as_bytes()).await;

    let transcript = f.supervisor.transcript(&info.id).await.unwrap_or_default();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].role, Role::Assistant);
    assert!(transcript[1].content.starts_with("The answer is 42"));
    Ok(())
}

#[tokio::test]
async fn compacting_increments_counter() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    feed(&f.supervisor, &info.id, b"Compacting conversation").await;

    let after = f.supervisor.get_info(&info.id).await;
    match after {
        Some(i) => {
            assert_eq!(i.detailed_state, AgentState::Compacting);
            assert_eq!(i.compaction_count, 1);
        }
        None => unreachable!(),
    }
    Ok(())
}

#[tokio::test]
async fn task_auto_injects_exactly_once() -> anyhow::Result<()> {
    let f = fixture();
    let info = f
        .supervisor
        .spawn(SpawnOptions {
            task: Some("do the thing".to_string()),
            ..SpawnOptions::default()
        })
        .await?;

    feed(&f.supervisor, &info.id, "\u{276f} ".as_bytes()).await;
    settle().await;

    assert_eq!(f.backend.write_count(&info.id), 1);
    assert_eq!(f.backend.written_to(&info.id), b"do the thing\r");

    // Drive a second idle; no further auto-input.
    feed(&f.supervisor, &info.id, b"building...\n").await;
    feed(&f.supervisor, &info.id, "done\n\u{276f} ".as_bytes()).await;
    settle().await;
    assert_eq!(f.backend.write_count(&info.id), 1);

    // The injected task shows up as a user transcript entry.
    let transcript = f.supervisor.transcript(&info.id).await.unwrap_or_default();
    assert!(transcript
        .iter()
        .any(|e| e.role == Role::User && e.content == "do the thing"));
    Ok(())
}

#[tokio::test]
async fn task_slot_cleared_when_session_exits_first() -> anyhow::Result<()> {
    let f = fixture();
    let info = f
        .supervisor
        .spawn(SpawnOptions { task: Some("late".to_string()), ..SpawnOptions::default() })
        .await?;

    f.supervisor.handle_driver_event(DriverMsg::exit(&info.id, Some(1))).await;
    settle().await;
    assert_eq!(f.backend.write_count(&info.id), 0);
    Ok(())
}

#[tokio::test]
async fn resize_clamps_and_updates_descriptor() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;

    let (cols, rows) = f.supervisor.resize(&info.id, Some(600.0), Some(0.0)).await?;
    assert_eq!((cols, rows), (500, 1));

    let after = f.supervisor.get_info(&info.id).await;
    assert_eq!(after.map(|i| (i.cols, i.rows)), Some((500, 1)));
    Ok(())
}

#[tokio::test]
async fn refused_resize_leaves_descriptor_unchanged() -> anyhow::Result<()> {
    let backend = NullBackend::refusing_resize();
    let shared = NullBackend {
        writes: Arc::clone(&backend.writes),
        specs: Arc::clone(&backend.specs),
        refuse_resize: true,
    };
    #[allow(clippy::expect_used)]
    let supervisor =
        Supervisor::new(Backend::Null(shared), test_settings(), TranscriptSink::disabled())
            .expect("build supervisor");

    let info = supervisor.spawn(SpawnOptions::default()).await?;
    supervisor.resize(&info.id, Some(80.0), Some(24.0)).await?;

    let after = supervisor.get_info(&info.id).await;
    assert_eq!(after.map(|i| (i.cols, i.rows)), Some((200, 50)));
    Ok(())
}

#[tokio::test]
async fn no_events_after_exit() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    let mut rx = f.supervisor.subscribe_events();

    feed(&f.supervisor, &info.id, b"before\n").await;
    f.supervisor.handle_driver_event(DriverMsg::exit(&info.id, Some(0))).await;
    feed(&f.supervisor, &info.id, b"after\n").await;

    let events = drain(&mut rx);
    match events.last() {
        Some(Event::Exit { .. }) => {}
        other => unreachable!("exit must be the final event, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn scrollback_getter_returns_copy() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    feed(&f.supervisor, &info.id, b"hello ").await;
    feed(&f.supervisor, &info.id, b"world").await;

    let mut copy = f.supervisor.scrollback(&info.id).await.unwrap_or_default();
    assert_eq!(copy, b"hello world");
    copy.clear();
    assert_eq!(
        f.supervisor.scrollback(&info.id).await.unwrap_or_default(),
        b"hello world"
    );
    Ok(())
}

#[tokio::test]
async fn groups_are_sorted_and_deduplicated() -> anyhow::Result<()> {
    let f = fixture();
    f.supervisor
        .spawn(SpawnOptions { group: Some("zeta".to_string()), ..SpawnOptions::default() })
        .await?;
    f.supervisor
        .spawn(SpawnOptions { group: Some("alpha".to_string()), ..SpawnOptions::default() })
        .await?;
    f.supervisor
        .spawn(SpawnOptions { group: Some("alpha".to_string()), ..SpawnOptions::default() })
        .await?;

    assert_eq!(f.supervisor.groups().await, vec!["alpha", "zeta"]);
    Ok(())
}

#[tokio::test]
async fn set_task_updates_descriptor() -> anyhow::Result<()> {
    let f = fixture();
    let info = f.supervisor.spawn(SpawnOptions::default()).await?;
    let before = info.task_started_at;

    let updated = f.supervisor.set_task(&info.id, "new goal".to_string()).await?;
    assert_eq!(updated.task.as_deref(), Some("new goal"));
    assert!(updated.task_started_at >= before);
    Ok(())
}
