// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run options accepted by the pipeline runner. Grounded on `spec.md` §4.7's
//! `opts` surface; defaults (`concurrency` from `num_cpus::get()`) match the
//! teacher's own reach for a host-resource-sized worker pool.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_core::{JobId, StepId};

/// Which steps to force-rerun regardless of cache state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Force {
    #[default]
    None,
    All,
    Steps(Vec<StepId>),
}

impl Force {
    pub fn applies_to(&self, step_id: &StepId) -> bool {
        match self {
            Force::None => false,
            Force::All => true,
            Force::Steps(ids) => ids.contains(step_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Overrides the workspace id derived from the pipeline definition.
    pub workspace: Option<String>,
    pub force: Force,
    pub dry_run: bool,
    /// Steps (and their transitive dependencies) to build. Defaults to
    /// every leaf node when empty.
    pub target: Vec<StepId>,
    pub concurrency: usize,
    pub env_file: Option<PathBuf>,
    /// Set by the daemon, which already holds the workspace lock itself.
    pub skip_lock: bool,
    /// Set by the daemon so it can ack a `run` command with the job id
    /// before `PIPELINE_START` is emitted, rather than waiting on the
    /// runner to mint one internally. `None` lets the runner generate a
    /// fresh id, as any non-daemon caller does.
    pub job_id: Option<JobId>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workspace: None,
            force: Force::None,
            dry_run: false,
            target: Vec::new(),
            concurrency: num_cpus::get().max(1),
            env_file: None,
            skip_lock: false,
            job_id: None,
        }
    }
}

/// Extra per-step env, layered under a step's own declared `env` (the step's
/// own entries win on key collision — see `spec.md` §4.1's user-wins merge
/// rule, applied here identically to the global env file).
pub fn merge_env(
    global: &BTreeMap<String, String>,
    step: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = global.clone();
    merged.extend(step.clone());
    merged
}
