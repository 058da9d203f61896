// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single-writer-per-workspace lock: `daemon.json`, guarded by a
//! PID-liveness probe rather than an `flock`. Grounded on the teacher's
//! `daemon::lifecycle::Config`/lock-acquisition flow and its
//! `daemon_process::process_exists` liveness check (`kill -0`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_workspace::fs_atomic::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The contents of `daemon.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub version: u32,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("workspace is locked by pid {pid}")]
    Held { pid: u32 },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path:?}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<kiln_workspace::WorkspaceError> for LockError {
    fn from(err: kiln_workspace::WorkspaceError) -> Self {
        match err {
            kiln_workspace::WorkspaceError::Io { path, source } => LockError::Io { path, source },
            kiln_workspace::WorkspaceError::Serde { path, source } => LockError::Serde { path, source },
            other => LockError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
            },
        }
    }
}

/// Signal-0 a PID to test whether it's still alive, the same way the
/// teacher's CLI layer does it (`kill -0`) rather than linking `libc`
/// directly — this workspace forbids `unsafe_code`, so shelling out is
/// both the grounded and the only available option.
fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Held while this process owns the workspace lock. Dropping releases it;
/// `release` does the same explicitly and is idempotent (the file is
/// simply removed, and removing an absent file is a no-op).
pub struct WorkspaceLockGuard {
    path: PathBuf,
    released: bool,
}

impl WorkspaceLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for WorkspaceLockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Read `daemon.json` at `<root>/daemon.json`, auto-cleaning a stale entry
/// (one whose `pid` is no longer alive) as it goes.
pub fn check(root: &Path) -> Result<Option<LockInfo>, LockError> {
    let path = lock_path(root);
    let Some(info) = read_json::<LockInfo>(&path)? else {
        return Ok(None);
    };
    if process_exists(info.pid) {
        Ok(Some(info))
    } else {
        let _ = std::fs::remove_file(&path);
        Ok(None)
    }
}

/// Acquire the workspace lock, reclaiming a stale one (dead PID) in place.
/// Refuses if a live process already holds it.
pub fn acquire(root: &Path, socket_path: Option<PathBuf>) -> Result<WorkspaceLockGuard, LockError> {
    if let Some(parent) = root.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::create_dir_all(root).map_err(|e| LockError::Io {
        path: root.to_path_buf(),
        source: e,
    })?;

    if let Some(existing) = check(root)? {
        return Err(LockError::Held { pid: existing.pid });
    }

    let path = lock_path(root);
    let info = LockInfo {
        pid: std::process::id(),
        socket_path,
        started_at: Utc::now(),
        version: 1,
    };
    write_json_atomic(&path, &info)?;
    Ok(WorkspaceLockGuard { path, released: false })
}

fn lock_path(root: &Path) -> PathBuf {
    root.join("daemon.json")
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
