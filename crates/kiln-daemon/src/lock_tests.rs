// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn acquire_then_check_reports_our_own_pid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("ws");
    let guard = acquire(&root, Some(PathBuf::from("/tmp/kiln.sock"))).expect("acquire");
    assert_eq!(guard.path(), root.join("daemon.json"));

    let info = check(&root).expect("check").expect("lock present");
    assert_eq!(info.pid, std::process::id());
    assert_eq!(info.version, 1);
}

#[test]
fn second_acquire_while_held_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("ws");
    let _guard = acquire(&root, None).expect("first acquire");

    let err = acquire(&root, None).expect_err("second acquire should fail");
    assert!(matches!(err, LockError::Held { pid } if pid == std::process::id()));
}

#[test]
fn release_allows_reacquire() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("ws");
    let guard = acquire(&root, None).expect("first acquire");
    guard.release();

    acquire(&root, None).expect("reacquire after release");
}

#[test]
fn stale_pid_is_reclaimed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("ws");
    std::fs::create_dir_all(&root).expect("mkdir");

    // Spawn and reap a child so its pid is guaranteed dead, rather than
    // guessing at an unused pid (0 addresses the caller's process group,
    // not "no such process", and would defeat this test).
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn short-lived child");
    let dead_pid = child.id();
    child.wait().expect("reap child");

    write_json_atomic(
        &root.join("daemon.json"),
        &LockInfo {
            pid: dead_pid,
            socket_path: None,
            started_at: Utc::now(),
            version: 1,
        },
    )
    .expect("seed stale lock");

    assert!(check(&root).expect("check").is_none());
    acquire(&root, None).expect("reclaim stale lock");
}

#[test]
fn release_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("ws");
    let guard = acquire(&root, None).expect("acquire");
    drop(guard);
    // A second drop-equivalent (dropping twice isn't expressible, but
    // calling remove_file on an already-removed path must not panic).
    assert!(check(&root).expect("check").is_none());
}
