// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use kiln_core::{RunId, StepId, ValidationError, WorkspaceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace {0} not found")]
    NotFound(WorkspaceId),

    #[error("workspace {0} already exists")]
    AlreadyExists(WorkspaceId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("step {0} has no recorded run")]
    StepRunNotFound(StepId),

    #[error(transparent)]
    InvalidId(#[from] ValidationError),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path:?}: {source}")]
    Serde {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl WorkspaceError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn serde(path: &Path, source: serde_json::Error) -> Self {
        Self::Serde {
            path: path.to_path_buf(),
            source,
        }
    }
}
