// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `ContainerExecutor` contract: the interface `kiln-engine`'s step
//! runner calls through. Everything here describes a request/response
//! shape and an error taxonomy; no implementation detail of any particular
//! container runtime leaks into it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{StepId, WorkspaceId};
use thiserror::Error;

/// `none` (no network namespace) or `bridge` (the default container
/// network), selected by `step.allowNetwork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    None,
    Bridge,
}

/// A committed input step's artifacts, mounted read-only at
/// `/input/<stepId>`.
#[derive(Debug, Clone)]
pub struct InputMount {
    pub step_id: StepId,
    pub host_path: PathBuf,
    pub container_path: String,
}

/// The staging artifacts directory, mounted read-write at `step.outputPath`.
#[derive(Debug, Clone)]
pub struct OutputMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// A persistent, shared cache directory, mounted read-write.
#[derive(Debug, Clone)]
pub struct CacheMount {
    pub name: String,
    pub host_path: PathBuf,
    pub container_path: String,
    /// Connected for the setup phase only when true; the contract still
    /// receives the mount for the run phase, but callers may choose to
    /// disconnect it between phases (the mutex protecting concurrent
    /// writers is `kiln-workspace`'s cache-lock manager, not this flag).
    pub exclusive: bool,
}

/// A host path copied into the container's writable layer (not bind
/// mounted) before execution.
#[derive(Debug, Clone)]
pub struct SourceMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// The setup phase: runs before `cmd`, sharing the writable layer.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub cmd: Vec<String>,
    pub allow_network: bool,
}

/// Everything the executor needs to run one step.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workspace_id: WorkspaceId,
    pub step_id: StepId,
    pub image: String,
    pub cmd: Vec<String>,
    pub setup: Option<SetupRequest>,
    pub env: BTreeMap<String, String>,
    pub input_mounts: Vec<InputMount>,
    pub output_mount: OutputMount,
    pub caches: Vec<CacheMount>,
    pub sources: Vec<SourceMount>,
    pub network: NetworkMode,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// Invoked once per captured output line, in real time. Boxed rather than
/// generic so `ContainerExecutor` stays object-safe.
pub type LogSink = Arc<dyn Fn(LogLine) + Send + Sync>;

/// Invoked once the setup phase finishes (used to release setup-only cache
/// locks promptly rather than holding them for the whole run phase).
pub type SetupCompleteSink = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("container runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to pull image {image:?}: {message}")]
    ImagePullFailed { image: String, message: String },

    #[error("step {0} timed out")]
    Timeout(StepId),

    #[error("failed to spawn container: {0}")]
    Spawn(String),

    #[error("container cleanup failed: {0}")]
    Cleanup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Runtime-availability errors (runtime not installed/reachable, image
    /// pull failure) are transient and eligible for the step runner's
    /// retry loop. Everything else — a timeout, a crashed spawn, a cleanup
    /// failure — is permanent: retrying won't change the outcome.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutorError::RuntimeUnavailable(_) | ExecutorError::ImagePullFailed { .. }
        )
    }
}

/// The interface the scheduler calls through. The container runtime itself
/// is an external collaborator; [`crate::cli::CliExecutor`] is one
/// reference implementation against a `docker`/`podman`-style CLI.
#[async_trait]
pub trait ContainerExecutor: Send + Sync + 'static {
    /// Availability probe, called once per pipeline run (unless dry-run).
    async fn check(&self) -> Result<(), ExecutorError>;

    /// Run one step. Honors setup-phase-before-run-phase ordering, network
    /// mode, per-request timeout, and the mount/cache/source set in
    /// `request`. `on_log_line` is called for every captured output line;
    /// `on_setup_complete` (if the request has a setup phase) is called
    /// once the setup command exits zero, before the run-phase command
    /// starts.
    async fn run(
        &self,
        request: RunRequest,
        on_log_line: LogSink,
        on_setup_complete: Option<SetupCompleteSink>,
    ) -> Result<RunOutcome, ExecutorError>;

    /// Force-terminate any containers this executor currently has running,
    /// used by cooperative cancellation.
    async fn kill_running_containers(&self) -> Result<(), ExecutorError>;

    /// Crash recovery: remove any containers left behind (by label) from a
    /// previous process that died mid-run, for the given workspace.
    async fn cleanup_containers(&self, workspace_id: &WorkspaceId) -> Result<(), ExecutorError>;
}
