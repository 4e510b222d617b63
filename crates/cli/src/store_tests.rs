// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use super::*;
use crate::driver::{SessionHandle, SpawnSpec};
use crate::test_support::NullBackend;

fn entry(id: &str, name: &str, group: &str) -> SessionEntry {
    let backend = NullBackend::new();
    let spec = SpawnSpec {
        argv: vec!["agent".to_string()],
        cwd: PathBuf::from("/tmp"),
        cols: 80,
        rows: 24,
        env_strip: vec![],
    };
    SessionEntry {
        info: SessionInfo::new(
            id.to_string(),
            name.to_string(),
            group.to_string(),
            PathBuf::from("/tmp"),
            80,
            24,
            None,
        ),
        handle: SessionHandle::Null(backend.create(id, &spec)),
        scrollback: Scrollback::new(1024),
        transcript: Transcript::new(10),
        pending_task: None,
    }
}

#[test]
fn reserve_id_yields_unique_8_hex() {
    let mut store = SessionStore::new(100);
    let a = store.reserve_id();
    let b = store.reserve_id();
    assert_ne!(a, b);
    for id in [&a, &b] {
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

#[test]
fn reservations_count_toward_capacity() {
    let mut store = SessionStore::new(2);
    let _a = store.reserve_id();
    let _b = store.reserve_id();
    assert!(store.at_capacity());

    store.release_reservation(&_b);
    assert!(!store.at_capacity());
}

#[test]
fn insert_consumes_reservation() {
    let mut store = SessionStore::new(1);
    let id = store.reserve_id();
    store.insert(entry(&id, "agent", "default"));
    assert!(store.at_capacity());
    assert_eq!(store.count(), 1);
}

#[test]
fn auto_name_counter_never_reuses() {
    let mut store = SessionStore::new(100);
    assert_eq!(store.next_auto_name(), "agent");
    assert_eq!(store.next_auto_name(), "agent 2");
    assert_eq!(store.next_auto_name(), "agent 3");

    // A removal does not roll the counter back.
    store.insert(entry("00000001", "agent", "default"));
    store.remove("00000001");
    assert_eq!(store.next_auto_name(), "agent 4");
}

#[test]
fn groups_sorted_and_deduplicated() {
    let mut store = SessionStore::new(100);
    store.insert(entry("00000001", "a", "zeta"));
    store.insert(entry("00000002", "b", "alpha"));
    store.insert(entry("00000003", "c", "alpha"));
    assert_eq!(store.groups(), vec!["alpha", "zeta"]);
}

#[test]
fn list_is_newest_first() {
    let mut store = SessionStore::new(100);
    let mut first = entry("00000001", "old", "default");
    first.info.created_at -= chrono::Duration::seconds(10);
    store.insert(first);
    store.insert(entry("00000002", "new", "default"));

    let list = store.list();
    assert_eq!(list[0].name, "new");
    assert_eq!(list[1].name, "old");
}

#[test]
fn descriptor_serializes_camel_case() -> anyhow::Result<()> {
    let info = SessionInfo::new(
        "ab12cd34".to_string(),
        "test".to_string(),
        DEFAULT_GROUP.to_string(),
        PathBuf::from("/tmp"),
        80,
        24,
        None,
    );
    let json = serde_json::to_value(&info)?;
    assert_eq!(json["detailedState"], "starting");
    assert_eq!(json["status"], "running");
    assert_eq!(json["compactionCount"], 0);
    assert_eq!(json["totalWorkingMs"], 0);
    // Absent exit code and pid are omitted; task is null until set.
    assert!(json.get("exitCode").is_none());
    assert!(json.get("pid").is_none());
    assert_eq!(json["task"], serde_json::Value::Null);
    // Timestamps are ISO-8601.
    let created = json["createdAt"].as_str().unwrap_or("");
    assert!(created.contains('T'));
    Ok(())
}

#[test]
fn exited_descriptor_roundtrips() -> anyhow::Result<()> {
    let mut info = SessionInfo::new(
        "ab12cd34".to_string(),
        "test".to_string(),
        DEFAULT_GROUP.to_string(),
        PathBuf::from("/tmp"),
        80,
        24,
        None,
    );
    info.status = SessionStatus::Exited;
    info.exit_code = Some(0);

    let json = serde_json::to_string(&info)?;
    let back: SessionInfo = serde_json::from_str(&json)?;
    assert_eq!(back.status, SessionStatus::Exited);
    assert_eq!(back.exit_code, Some(0));
    Ok(())
}
