// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use kiln_core::StepId;
use kiln_executor::ExecutorError;
use kiln_workspace::WorkspaceError;
use thiserror::Error;

/// A step's container exited non-zero (and the step did not declare
/// `allowFailure`). Carries enough to let a caller report the first failure
/// without re-deriving it from the event stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("step {step_id} exited with code {exit_code}")]
pub struct ContainerCrashError {
    pub step_id: StepId,
    pub exit_code: i32,
}

/// One step run's terminal failure, as surfaced by [`crate::step_runner`].
#[derive(Debug, Error)]
pub enum StepRunError {
    #[error(transparent)]
    Crashed(#[from] ContainerCrashError),

    #[error("step {0} timed out")]
    Timeout(StepId),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("failed to evaluate condition for step {step}: {message}")]
    Condition { step: StepId, message: String },
}

/// A whole pipeline run's terminal failure, as surfaced by
/// [`crate::scheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Crashed(#[from] ContainerCrashError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("pipeline graph has a cycle among: {0:?}")]
    Cyclic(Vec<StepId>),

    #[error("pipeline run was cancelled")]
    Cancelled,
}
