// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Write-tmp, fsync, rename: the one idiom every durable write in this crate
//! goes through (`state.json`, `meta.json`, running markers, `daemon.json`).

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WorkspaceError;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkspaceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| WorkspaceError::serde(path, e))?;
    {
        let mut file = File::create(&tmp).map_err(|e| WorkspaceError::io(&tmp, e))?;
        file.write_all(&bytes)
            .map_err(|e| WorkspaceError::io(&tmp, e))?;
        file.sync_all().map_err(|e| WorkspaceError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| WorkspaceError::io(path, e))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, WorkspaceError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| WorkspaceError::serde(path, e))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WorkspaceError::io(path, e)),
    }
}

#[cfg(test)]
#[path = "fs_atomic_tests.rs"]
mod tests;
