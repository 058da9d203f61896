// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::path::Path;
use yare::parameterized;

#[parameterized(
    alnum = {"abc123"},
    with_dash = {"build-image"},
    with_underscore = {"build_image"},
    single_char = {"a"},
)]
fn valid_slugs(value: &str) {
    assert!(validate_slug("id", value).is_ok());
}

#[parameterized(
    empty = {""},
    dot = {"."},
    dotdot = {".."},
    slash = {"a/b"},
    space = {"a b"},
    leading_slash = {"/abs"},
)]
fn invalid_slugs(value: &str) {
    assert!(validate_slug("id", value).is_err());
}

#[test]
fn absolute_path_rejects_relative() {
    let err = validate_absolute_no_traversal("container", "relative/path").unwrap_err();
    assert!(matches!(err, ValidationError::MustBeAbsolute { .. }));
}

#[test]
fn absolute_path_rejects_traversal() {
    let err = validate_absolute_no_traversal("container", "/a/../../etc").unwrap_err();
    assert!(matches!(err, ValidationError::PathTraversal { .. }));
}

#[test]
fn absolute_path_accepts_clean_path() {
    assert!(validate_absolute_no_traversal("container", "/output").is_ok());
}

#[test]
fn mount_host_rejects_leading_slash() {
    let root = Path::new("/work/pipeline");
    let err = validate_mount_host("host", "/abs", root, root).unwrap_err();
    assert!(matches!(err, ValidationError::MustBeRelative { .. }));
}

#[test]
fn mount_host_rejects_traversal_outside_cwd() {
    let root = Path::new("/work/pipeline");
    let cwd = Path::new("/work/pipeline");
    let err = validate_mount_host("host", "../../etc", root, cwd).unwrap_err();
    assert!(matches!(err, ValidationError::OutsideWorkingDirectory { .. }));
}

#[test]
fn mount_host_accepts_path_under_cwd() {
    let root = Path::new("/work/pipeline");
    let cwd = Path::new("/work");
    let resolved = validate_mount_host("host", "src/data", root, cwd).unwrap();
    assert_eq!(resolved, Path::new("/work/pipeline/src/data"));
}

#[test]
fn mount_host_allows_dotdot_that_stays_inside_cwd() {
    let root = Path::new("/work/pipeline/nested");
    let cwd = Path::new("/work");
    let resolved = validate_mount_host("host", "../sibling", root, cwd).unwrap();
    assert_eq!(resolved, Path::new("/work/pipeline/sibling"));
}
