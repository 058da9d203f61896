// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identifier and path validation shared by the resolver, workspace, and cache-lock manager.
//!
//! Every id that ends up as a path segment (step id, run id, workspace id, cache
//! name) must pass [`validate_slug`] before it touches the filesystem, and every
//! mount/source host path must pass [`validate_relative_no_traversal`] /
//! [`validate_absolute_no_traversal`] before it is resolved against a root.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: String },

    #[error("{field} {value:?} is not a valid slug (must match [A-Za-z0-9_-]+)")]
    InvalidSlug { field: String, value: String },

    #[error("{field} {value:?} must not contain '..'")]
    PathTraversal { field: String, value: String },

    #[error("{field} {value:?} must be relative (no leading '/')")]
    MustBeRelative { field: String, value: String },

    #[error("{field} {value:?} must be absolute")]
    MustBeAbsolute { field: String, value: String },

    #[error("{field} {value:?} resolves outside the working directory")]
    OutsideWorkingDirectory { field: String, value: String },
}

/// `^[A-Za-z0-9_-]+$`, applied to step/run/workspace ids and cache/kit names.
pub fn validate_slug(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty {
            field: field.to_string(),
        });
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(ValidationError::InvalidSlug {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

fn contains_dotdot(value: &str) -> bool {
    Path::new(value)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Mount/source `container` paths: absolute, no `..`.
pub fn validate_absolute_no_traversal(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty {
            field: field.to_string(),
        });
    }
    if !value.starts_with('/') {
        return Err(ValidationError::MustBeAbsolute {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    if contains_dotdot(value) {
        return Err(ValidationError::PathTraversal {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Cache `path`: absolute, no `..` (same rule as container mount paths).
pub fn validate_cache_path(field: &str, value: &str) -> Result<(), ValidationError> {
    validate_absolute_no_traversal(field, value)
}

/// Mount `host` paths: relative to the pipeline root, no leading `/`, no `..`,
/// and the resolved path must land at or under `cwd`.
pub fn validate_mount_host(
    field: &str,
    value: &str,
    root: &Path,
    cwd: &Path,
) -> Result<PathBuf, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty {
            field: field.to_string(),
        });
    }
    if value.starts_with('/') {
        return Err(ValidationError::MustBeRelative {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    let resolved = normalize(&root.join(value));
    let cwd = normalize(cwd);
    if !resolved.starts_with(&cwd) {
        return Err(ValidationError::OutsideWorkingDirectory {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(resolved)
}

/// Lexically normalize a path (resolve `.`/`..` components) without touching the
/// filesystem — `root`/`cwd` need not exist yet when validating a pipeline.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
