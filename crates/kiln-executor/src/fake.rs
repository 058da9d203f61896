// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted `ContainerExecutor` for other crates' tests. Grounded on
//! `oj-adapters::session::fake::FakeSessionAdapter`: a mutex-protected call
//! log plus per-step programmable behavior, so a test can assert both "what
//! was requested" and "what happened" without a real container runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{StepId, WorkspaceId};
use parking_lot::Mutex;

use crate::contract::{
    ContainerExecutor, ExecutorError, LogLine, LogSink, RunOutcome, RunRequest, SetupCompleteSink,
};

/// One recorded `run()` invocation.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub step_id: StepId,
    pub request: RunRequest,
}

/// Scripted outcome for a step id: exit code, emitted log lines, and
/// whether the executor should report a setup-complete callback.
#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub error: Option<String>,
    /// Number of leading `run()` calls for this step that should fail with
    /// a transient `RuntimeUnavailable` before this outcome is returned,
    /// for exercising the step runner's retry loop.
    pub transient_failures: u32,
}

impl Default for ScriptedOutcome {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            error: None,
            transient_failures: 0,
        }
    }
}

struct FakeState {
    runs: Vec<RecordedRun>,
    scripts: HashMap<String, ScriptedOutcome>,
    attempts: HashMap<String, u32>,
    check_unavailable: bool,
    killed: bool,
    cleaned: Vec<WorkspaceId>,
    next_clock_ms: u64,
}

/// A fake executor a test can program per step id before handing it to the
/// step runner / scheduler.
#[derive(Clone)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                runs: Vec::new(),
                scripts: HashMap::new(),
                attempts: HashMap::new(),
                check_unavailable: false,
                killed: false,
                cleaned: Vec::new(),
                next_clock_ms: 1_700_000_000_000,
            })),
        }
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome for a given step id. Steps with no script default
    /// to an immediate success with no output.
    pub fn script(&self, step_id: impl Into<String>, outcome: ScriptedOutcome) {
        self.state.lock().scripts.insert(step_id.into(), outcome);
    }

    /// Make [`ContainerExecutor::check`] fail, simulating a runtime that
    /// isn't installed or reachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().check_unavailable = unavailable;
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.state.lock().runs.clone()
    }

    pub fn was_killed(&self) -> bool {
        self.state.lock().killed
    }

    pub fn cleaned_workspaces(&self) -> Vec<WorkspaceId> {
        self.state.lock().cleaned.clone()
    }
}

#[async_trait]
impl ContainerExecutor for FakeExecutor {
    async fn check(&self) -> Result<(), ExecutorError> {
        if self.state.lock().check_unavailable {
            return Err(ExecutorError::RuntimeUnavailable("fake executor unavailable".to_string()));
        }
        Ok(())
    }

    async fn run(
        &self,
        request: RunRequest,
        on_log_line: LogSink,
        on_setup_complete: Option<SetupCompleteSink>,
    ) -> Result<RunOutcome, ExecutorError> {
        let step_id = request.step_id.clone();
        let (outcome, started_at_ms, finished_at_ms, attempt) = {
            let mut state = self.state.lock();
            state.runs.push(RecordedRun {
                step_id: step_id.clone(),
                request: request.clone(),
            });
            let outcome = state
                .scripts
                .get(step_id.as_str())
                .cloned()
                .unwrap_or_default();
            let attempt = state.attempts.entry(step_id.as_str().to_string()).or_insert(0);
            let this_attempt = *attempt;
            *attempt += 1;
            let started_at_ms = state.next_clock_ms;
            state.next_clock_ms += 1000;
            let finished_at_ms = state.next_clock_ms;
            (outcome, started_at_ms, finished_at_ms, this_attempt)
        };

        if attempt < outcome.transient_failures {
            return Err(ExecutorError::RuntimeUnavailable(format!(
                "fake executor: scripted transient failure {} of {}",
                attempt + 1,
                outcome.transient_failures
            )));
        }

        if let Some(message) = outcome.error {
            return Err(ExecutorError::Spawn(message));
        }

        if request.setup.is_some() {
            if let Some(cb) = on_setup_complete {
                cb();
            }
        }
        for line in outcome.stdout_lines {
            on_log_line(LogLine {
                stream: crate::contract::LogStream::Stdout,
                line,
            });
        }
        for line in outcome.stderr_lines {
            on_log_line(LogLine {
                stream: crate::contract::LogStream::Stderr,
                line,
            });
        }

        Ok(RunOutcome {
            exit_code: outcome.exit_code,
            started_at_ms,
            finished_at_ms,
        })
    }

    async fn kill_running_containers(&self) -> Result<(), ExecutorError> {
        self.state.lock().killed = true;
        Ok(())
    }

    async fn cleanup_containers(&self, workspace_id: &WorkspaceId) -> Result<(), ExecutorError> {
        self.state.lock().cleaned.push(workspace_id.clone());
        Ok(())
    }
}
