// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace filesystem layout: staging/commit run lifecycle, running
//! markers, cache directories, and pruning. All path segments derived from
//! an id are validated as slugs before touching the filesystem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::{validate_slug, IdGen, RunId, StepId, WorkspaceId};
use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::fs_atomic::{read_json, write_json_atomic};

/// `running/<stepId>.json`: written on step start, removed on step completion.
/// A marker whose `pid` is no longer alive is stale and must not block a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMarker {
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
}

/// A filesystem-backed workspace rooted at `<workdir>/<id>`. Cheap to clone
/// (just a root path + id) so concurrent step tasks within a wave can each
/// hold their own handle onto the same on-disk tree.
#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    id: WorkspaceId,
}

impl Workspace {
    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn caches_dir(&self) -> PathBuf {
        self.root.join("caches")
    }

    pub fn step_runs_dir(&self) -> PathBuf {
        self.root.join("step-runs")
    }

    pub fn running_dir(&self) -> PathBuf {
        self.root.join("running")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// `daemon.json`. Layout lives here; the lock itself is owned by
    /// `kiln-daemon`, which only needs the path.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("daemon.json")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("kiln.sock")
    }

    fn run_dir(&self, base: &Path, run_id: &RunId) -> Result<PathBuf, WorkspaceError> {
        validate_slug("runId", run_id.as_str())?;
        Ok(base.join(run_id.as_str()))
    }

    fn step_running_path(&self, step_id: &StepId) -> Result<PathBuf, WorkspaceError> {
        validate_slug("stepId", step_id.as_str())?;
        Ok(self.running_dir().join(format!("{}.json", step_id.as_str())))
    }

    fn step_run_link_path(&self, step_id: &StepId) -> Result<PathBuf, WorkspaceError> {
        validate_slug("stepId", step_id.as_str())?;
        Ok(self.step_runs_dir().join(format!("{}.json", step_id.as_str())))
    }

    fn cache_dir(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        validate_slug("cacheName", name)?;
        Ok(self.caches_dir().join(name))
    }

    /// Create a brand new workspace directory tree. Errors if it already exists.
    pub fn create(workdir: &Path, id: impl Into<WorkspaceId>) -> Result<Self, WorkspaceError> {
        let id = id.into();
        validate_slug("workspaceId", id.as_str())?;
        let root = workdir.join(id.as_str());
        if root.exists() {
            return Err(WorkspaceError::AlreadyExists(id));
        }
        for subdir in ["staging", "runs", "caches", "step-runs", "running"] {
            std::fs::create_dir_all(root.join(subdir)).map_err(|e| WorkspaceError::io(&root, e))?;
        }
        Ok(Self { root, id })
    }

    /// Open an existing workspace directory.
    pub fn open(workdir: &Path, id: impl Into<WorkspaceId>) -> Result<Self, WorkspaceError> {
        let id = id.into();
        validate_slug("workspaceId", id.as_str())?;
        let root = workdir.join(id.as_str());
        if !root.is_dir() {
            return Err(WorkspaceError::NotFound(id));
        }
        Ok(Self { root, id })
    }

    /// Open an existing workspace, or create it if it doesn't exist yet.
    pub fn open_or_create(workdir: &Path, id: impl Into<WorkspaceId>) -> Result<Self, WorkspaceError> {
        let id = id.into();
        match Self::open(workdir, id.clone()) {
            Ok(ws) => Ok(ws),
            Err(WorkspaceError::NotFound(_)) => Self::create(workdir, id),
            Err(e) => Err(e),
        }
    }

    pub fn list(workdir: &Path) -> Result<Vec<WorkspaceId>, WorkspaceError> {
        if !workdir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(workdir).map_err(|e| WorkspaceError::io(workdir, e))? {
            let entry = entry.map_err(|e| WorkspaceError::io(workdir, e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(WorkspaceId::new(name));
                }
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// Remove a workspace entirely. Refuses ids containing `..` or `/`.
    pub fn remove(workdir: &Path, id: impl Into<WorkspaceId>) -> Result<(), WorkspaceError> {
        let id = id.into();
        validate_slug("workspaceId", id.as_str())?;
        let root = workdir.join(id.as_str());
        if root.exists() {
            std::fs::remove_dir_all(&root).map_err(|e| WorkspaceError::io(&root, e))?;
        }
        Ok(())
    }

    /// `<unix-millis>-<8-hex>`; uniqueness per workspace is the only requirement.
    pub fn generate_run_id(&self, epoch_ms: u64, idgen: &dyn IdGen) -> RunId {
        idgen.next_run_id(epoch_ms)
    }

    pub fn prepare_run(&self, run_id: &RunId) -> Result<(), WorkspaceError> {
        let dir = self.run_dir(&self.staging_dir(), run_id)?;
        std::fs::create_dir_all(dir.join("artifacts")).map_err(|e| WorkspaceError::io(&dir, e))?;
        Ok(())
    }

    pub fn artifacts_dir(&self, run_id: &RunId) -> Result<PathBuf, WorkspaceError> {
        Ok(self.run_dir(&self.staging_dir(), run_id)?.join("artifacts"))
    }

    pub fn staging_run_dir(&self, run_id: &RunId) -> Result<PathBuf, WorkspaceError> {
        self.run_dir(&self.staging_dir(), run_id)
    }

    pub fn committed_run_dir(&self, run_id: &RunId) -> Result<PathBuf, WorkspaceError> {
        self.run_dir(&self.runs_dir(), run_id)
    }

    /// Atomic directory rename from `staging/<runId>` to `runs/<runId>`. A
    /// single syscall, so concurrent readers never observe a partial run.
    pub fn commit_run(&self, run_id: &RunId) -> Result<(), WorkspaceError> {
        let from = self.run_dir(&self.staging_dir(), run_id)?;
        let to = self.run_dir(&self.runs_dir(), run_id)?;
        std::fs::rename(&from, &to).map_err(|e| WorkspaceError::io(&to, e))?;
        Ok(())
    }

    pub fn discard_run(&self, run_id: &RunId) -> Result<(), WorkspaceError> {
        let dir = self.run_dir(&self.staging_dir(), run_id)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Purge crash debris left in `staging/` by a process that died mid-run.
    pub fn cleanup_staging(&self) -> Result<(), WorkspaceError> {
        remove_children(&self.staging_dir())
    }

    /// Purge crash debris left in `running/` by a process that died mid-run.
    pub fn cleanup_running(&self) -> Result<(), WorkspaceError> {
        remove_children(&self.running_dir())
    }

    /// Overwrite `step-runs/<stepId>` with a reference to `runId`.
    /// Last-writer-wins via atomic rename.
    pub fn link_run(&self, step_id: &StepId, run_id: &RunId) -> Result<(), WorkspaceError> {
        let path = self.step_run_link_path(step_id)?;
        write_json_atomic(&path, &StepRunLink { run_id: run_id.clone() })
    }

    pub fn get_step_run(&self, step_id: &StepId) -> Result<Option<RunId>, WorkspaceError> {
        let path = self.step_run_link_path(step_id)?;
        let link: Option<StepRunLink> = read_json(&path)?;
        Ok(link.map(|l| l.run_id))
    }

    pub fn list_runs(&self) -> Result<Vec<RunId>, WorkspaceError> {
        list_dir_entries(&self.runs_dir()).map(|names| names.into_iter().map(RunId::new).collect())
    }

    /// Delete runs not in `active`; returns the count removed.
    pub fn prune_runs(&self, active: &HashSet<RunId>) -> Result<usize, WorkspaceError> {
        let mut removed = 0;
        for run_id in self.list_runs()? {
            if !active.contains(&run_id) {
                let dir = self.run_dir(&self.runs_dir(), &run_id)?;
                std::fs::remove_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn mark_step_running(
        &self,
        step_id: &StepId,
        marker: &RunningMarker,
    ) -> Result<(), WorkspaceError> {
        let path = self.step_running_path(step_id)?;
        write_json_atomic(&path, marker)
    }

    pub fn mark_step_done(&self, step_id: &StepId) -> Result<(), WorkspaceError> {
        let path = self.step_running_path(step_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(&path, e)),
        }
    }

    /// Enumerate running markers. Callers judge liveness (signal-0 the pid);
    /// a marker for a dead pid is stale and must not block a retry.
    pub fn list_running_steps(&self) -> Result<Vec<(StepId, RunningMarker)>, WorkspaceError> {
        let dir = self.running_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| WorkspaceError::io(&dir, e))? {
            let entry = entry.map_err(|e| WorkspaceError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(marker) = read_json::<RunningMarker>(&path)? {
                out.push((StepId::new(stem), marker));
            }
        }
        Ok(out)
    }

    pub fn prepare_cache(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.cache_dir(name)?;
        std::fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
        Ok(dir)
    }

    pub fn cache_path(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        self.cache_dir(name)
    }

    pub fn list_caches(&self) -> Result<Vec<String>, WorkspaceError> {
        list_dir_entries(&self.caches_dir())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRunLink {
    run_id: RunId,
}

fn list_dir_entries(dir: &Path) -> Result<Vec<String>, WorkspaceError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| WorkspaceError::io(dir, e))? {
        let entry = entry.map_err(|e| WorkspaceError::io(dir, e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn remove_children(dir: &Path) -> Result<(), WorkspaceError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).map_err(|e| WorkspaceError::io(dir, e))? {
        let entry = entry.map_err(|e| WorkspaceError::io(dir, e))?;
        let path = entry.path();
        let result = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| WorkspaceError::io(&path, e))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
