// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use kiln_core::Fingerprint;
use std::collections::HashSet;

fn sample(run_id: &str, fingerprint: &str) -> StepState {
    StepState {
        run_id: RunId::new(run_id),
        fingerprint: Fingerprint(fingerprint.to_string()),
    }
}

#[test]
fn load_missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::load(dir.path().join("state.json")).unwrap();
    assert_eq!(store.list_steps().count(), 0);
}

#[test]
fn set_then_save_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut store = StateStore::load(path.clone()).unwrap();
    store.set_step(StepId::new("build"), sample("1700000000000-00000001", "abc123"));
    store.save().unwrap();

    let reloaded = StateStore::load(path).unwrap();
    let state = reloaded.get_step(&StepId::new("build")).unwrap();
    assert_eq!(state.run_id.as_str(), "1700000000000-00000001");
    assert_eq!(state.fingerprint.as_str(), "abc123");
}

#[test]
fn remove_step_drops_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = StateStore::load(dir.path().join("state.json")).unwrap();
    store.set_step(StepId::new("build"), sample("r1", "fp1"));
    assert!(store.remove_step(&StepId::new("build")).is_some());
    assert!(store.get_step(&StepId::new("build")).is_none());
}

#[test]
fn active_run_ids_collects_every_step_run_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = StateStore::load(dir.path().join("state.json")).unwrap();
    store.set_step(StepId::new("build"), sample("r1", "fp1"));
    store.set_step(StepId::new("test"), sample("r2", "fp2"));
    let active = store.active_run_ids();
    assert_eq!(active, HashSet::from([RunId::new("r1"), RunId::new("r2")]));
}
