// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn sequential_id_gen_is_deterministic_and_unique() {
    let gen = SequentialIdGen::new();
    let a = gen.next_run_id(1_700_000_000_000);
    let b = gen.next_run_id(1_700_000_000_000);
    assert_ne!(a, b);
    assert!(a.as_str().starts_with("1700000000000-"));
}

#[test]
fn short_truncates_without_panicking_on_short_strings() {
    let id = WorkspaceId::new("abc");
    assert_eq!(id.short(10), "abc");
    let id = WorkspaceId::new("abcdefghij");
    assert_eq!(id.short(4), "abcd");
}

#[test]
fn id_compares_equal_to_str() {
    let id = RunId::new("run-1");
    assert_eq!(id, "run-1");
    assert_eq!(id, *"run-1");
}
