// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use kiln_core::SequentialIdGen;
use std::collections::HashSet;

fn workdir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

#[test]
fn create_then_open_round_trips() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    assert_eq!(ws.id().as_str(), "alpha");
    assert!(ws.staging_dir().is_dir());
    assert!(ws.runs_dir().is_dir());

    let reopened = Workspace::open(dir.path(), "alpha").unwrap();
    assert_eq!(reopened.id().as_str(), "alpha");
}

#[test]
fn create_twice_is_an_error() {
    let dir = workdir();
    Workspace::create(dir.path(), "alpha").unwrap();
    let err = Workspace::create(dir.path(), "alpha").unwrap_err();
    assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
}

#[test]
fn open_missing_is_not_found() {
    let dir = workdir();
    let err = Workspace::open(dir.path(), "ghost").unwrap_err();
    assert!(matches!(err, WorkspaceError::NotFound(_)));
}

#[test]
fn list_returns_sorted_workspace_ids() {
    let dir = workdir();
    Workspace::create(dir.path(), "zeta").unwrap();
    Workspace::create(dir.path(), "alpha").unwrap();
    let ids: Vec<String> = Workspace::list(dir.path())
        .unwrap()
        .into_iter()
        .map(|id| id.as_str().to_string())
        .collect();
    assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
}

#[test]
fn remove_deletes_the_workspace_directory() {
    let dir = workdir();
    Workspace::create(dir.path(), "alpha").unwrap();
    Workspace::remove(dir.path(), "alpha").unwrap();
    assert!(!dir.path().join("alpha").exists());
}

#[test]
fn remove_rejects_traversal_ids() {
    let dir = workdir();
    let err = Workspace::remove(dir.path(), "../escape").unwrap_err();
    assert!(matches!(err, WorkspaceError::InvalidId(_)));
}

#[test]
fn prepare_commit_run_moves_staging_to_runs() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let idgen = SequentialIdGen::new();
    let run_id = ws.generate_run_id(1_700_000_000_000, &idgen);

    ws.prepare_run(&run_id).unwrap();
    assert!(ws.staging_run_dir(&run_id).unwrap().join("artifacts").is_dir());

    ws.commit_run(&run_id).unwrap();
    assert!(!ws.staging_run_dir(&run_id).unwrap().exists());
    assert!(ws.committed_run_dir(&run_id).unwrap().is_dir());
}

#[test]
fn discard_run_removes_staging_only() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let idgen = SequentialIdGen::new();
    let run_id = ws.generate_run_id(1_700_000_000_000, &idgen);
    ws.prepare_run(&run_id).unwrap();
    ws.discard_run(&run_id).unwrap();
    assert!(!ws.staging_run_dir(&run_id).unwrap().exists());
    assert!(!ws.committed_run_dir(&run_id).unwrap().exists());
}

#[test]
fn cleanup_staging_and_running_purge_crash_debris() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let idgen = SequentialIdGen::new();
    let run_id = ws.generate_run_id(1_700_000_000_000, &idgen);
    ws.prepare_run(&run_id).unwrap();
    ws.mark_step_running(
        &StepId::new("build"),
        &RunningMarker {
            started_at: Utc::now(),
            pid: std::process::id(),
            step_name: None,
        },
    )
    .unwrap();

    ws.cleanup_staging().unwrap();
    ws.cleanup_running().unwrap();

    assert!(std::fs::read_dir(ws.staging_dir()).unwrap().next().is_none());
    assert!(std::fs::read_dir(ws.running_dir()).unwrap().next().is_none());
}

#[test]
fn link_run_and_get_step_run_round_trip() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let step_id = StepId::new("build");
    let run_id = RunId::new("1700000000000-00000001");
    ws.link_run(&step_id, &run_id).unwrap();
    assert_eq!(ws.get_step_run(&step_id).unwrap(), Some(run_id));
}

#[test]
fn link_run_overwrite_is_last_writer_wins() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let step_id = StepId::new("build");
    ws.link_run(&step_id, &RunId::new("a")).unwrap();
    ws.link_run(&step_id, &RunId::new("b")).unwrap();
    assert_eq!(ws.get_step_run(&step_id).unwrap(), Some(RunId::new("b")));
}

#[test]
fn prune_runs_removes_inactive_runs_only() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    for name in ["a", "b", "c"] {
        let run_id = RunId::new(name);
        ws.prepare_run(&run_id).unwrap();
        ws.commit_run(&run_id).unwrap();
    }
    let active: HashSet<RunId> = [RunId::new("b")].into_iter().collect();
    let removed = ws.prune_runs(&active).unwrap();
    assert_eq!(removed, 2);
    let remaining: HashSet<String> = ws
        .list_runs()
        .unwrap()
        .into_iter()
        .map(|id| id.as_str().to_string())
        .collect();
    assert_eq!(remaining, HashSet::from(["b".to_string()]));
}

#[test]
fn mark_step_running_then_done_round_trip() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let step_id = StepId::new("build");
    let marker = RunningMarker {
        started_at: Utc::now(),
        pid: std::process::id(),
        step_name: Some("Build".to_string()),
    };
    ws.mark_step_running(&step_id, &marker).unwrap();
    let running = ws.list_running_steps().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].0, step_id);

    ws.mark_step_done(&step_id).unwrap();
    assert!(ws.list_running_steps().unwrap().is_empty());
}

#[test]
fn mark_step_done_is_idempotent() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let step_id = StepId::new("build");
    ws.mark_step_done(&step_id).unwrap();
    ws.mark_step_done(&step_id).unwrap();
}

#[test]
fn prepare_cache_creates_directory_and_is_idempotent() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let path1 = ws.prepare_cache("node-modules").unwrap();
    let path2 = ws.prepare_cache("node-modules").unwrap();
    assert_eq!(path1, path2);
    assert!(path1.is_dir());
    assert_eq!(ws.list_caches().unwrap(), vec!["node-modules".to_string()]);
}

#[test]
fn cache_name_must_be_a_slug() {
    let dir = workdir();
    let ws = Workspace::create(dir.path(), "alpha").unwrap();
    let err = ws.prepare_cache("../escape").unwrap_err();
    assert!(matches!(err, WorkspaceError::InvalidId(_)));
}
