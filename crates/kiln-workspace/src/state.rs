// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State store: the persisted `stepId -> {runId, fingerprint}` table a
//! pipeline run consults for cache hits. Key iteration order is not
//! semantic; callers must not rely on it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use kiln_core::{Fingerprint, RunId, StepId};
use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::fs_atomic::{read_json, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: RunId,
    pub fingerprint: Fingerprint,
}

/// Keyed by `StepId::as_str()` rather than the id type itself, since JSON
/// object keys must be strings and this avoids relying on how a newtype
/// wrapper happens to serialize as a map key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDoc {
    #[serde(default)]
    steps: HashMap<String, StepState>,
}

/// Loads, mutates, and atomically persists `state.json`.
pub struct StateStore {
    path: PathBuf,
    doc: StateDoc,
}

impl StateStore {
    /// Load `state.json` at `path`, or start with an empty table if it
    /// doesn't exist yet.
    pub fn load(path: PathBuf) -> Result<Self, WorkspaceError> {
        let doc = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, doc })
    }

    pub fn save(&self) -> Result<(), WorkspaceError> {
        write_json_atomic(&self.path, &self.doc)
    }

    pub fn get_step(&self, step_id: &StepId) -> Option<&StepState> {
        self.doc.steps.get(step_id.as_str())
    }

    pub fn set_step(&mut self, step_id: StepId, state: StepState) {
        self.doc.steps.insert(step_id.as_str().to_string(), state);
    }

    pub fn remove_step(&mut self, step_id: &StepId) -> Option<StepState> {
        self.doc.steps.remove(step_id.as_str())
    }

    pub fn list_steps(&self) -> impl Iterator<Item = (&str, &StepState)> {
        self.doc.steps.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn active_run_ids(&self) -> HashSet<RunId> {
        self.doc.steps.values().map(|s| s.run_id.clone()).collect()
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
