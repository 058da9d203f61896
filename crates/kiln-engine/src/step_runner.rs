// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The ten-step state machine that runs one step: cache check, dry-run
//! shortcut, condition check, prepare, setup-cache locking, execute with
//! retries, meta.json, commit-or-discard, ephemeral discard, cleanup.
//! Grounded on `oj-engine::executor::Executor::execute` (span-wrapped
//! `execute_inner`, elapsed-ms logging, `Result<Option<Event>, _>` return
//! shape), adapted to this crate's own cache-check/prepare/exec/commit
//! sequence. Transient/permanent classification follows the
//! adapter-error-enum convention used across the teacher's executor
//! contracts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use kiln_core::{fingerprint, Clock, FingerprintInput, IdGen, MountRef, RunId, StepId, WorkspaceId};
use kiln_executor::{
    CacheMount, ContainerExecutor, InputMount, LogLine, LogStream, NetworkMode, OutputMount,
    RunRequest, SetupRequest, SourceMount,
};
use kiln_pipeline::Step;
use kiln_workspace::{CacheLockManager, RunningMarker, StateStore, StepState, Workspace};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{ContainerCrashError, StepRunError};
use crate::event::{Event, EventKind, LogStreamKind, SkipReason, StreamReporter};

/// Evaluates a step's `if` condition. The expression language itself is
/// explicitly out of scope (`spec.md` §1) — this is the pluggable seam a
/// caller supplies a real evaluator through; [`EnvTruthyCondition`] is the
/// simplest implementation that satisfies "evaluate against a process env
/// snapshot".
pub trait ConditionEvaluator: Send + Sync + 'static {
    fn evaluate(&self, condition: &str, env: &BTreeMap<String, String>) -> bool;
}

/// Treats the condition string as an env var name; truthy unless the
/// variable is unset, empty, `"0"`, or `"false"` (case-insensitive).
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvTruthyCondition;

impl ConditionEvaluator for EnvTruthyCondition {
    fn evaluate(&self, condition: &str, env: &BTreeMap<String, String>) -> bool {
        match env.get(condition.trim()) {
            None => false,
            Some(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "" | "0" | "false"),
        }
    }
}

/// `staging/<run-id>/meta.json`, written before commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: RunId,
    pub step_id: StepId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub image: String,
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<RunMetaInput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<RunMetaMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<Vec<String>>,
    pub caches: Vec<String>,
    pub allow_network: bool,
    pub fingerprint: String,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetaInput {
    pub step: StepId,
    pub run_id: RunId,
    pub mounted_as: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetaMount {
    pub host: String,
    pub container: String,
}

/// Outcome of running one step, for the scheduler to fold into its wave
/// bookkeeping and the aggregator-facing event stream.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Skipped {
        run_id: Option<RunId>,
        reason: SkipReason,
    },
    WouldRun,
    Finished {
        run_id: Option<RunId>,
        exit_code: i32,
        artifact_size: u64,
        ephemeral: bool,
    },
    Failed {
        exit_code: i32,
    },
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Everything one `run()` call needs beyond the step itself.
pub struct StepRunRequest<'a> {
    pub step: &'a Step,
    /// The pipeline's root directory; pipeline-root-relative mount/source
    /// hosts (`spec.md` §3 Mount) are absolutized against this before
    /// reaching the executor.
    pub root: &'a Path,
    /// Committed run ids for this step's inputs that are currently
    /// available (an `optional` input simply won't appear here if its
    /// producer was skipped/failed/never run).
    pub inputs: &'a BTreeMap<StepId, RunId>,
    pub force: bool,
    pub dry_run: bool,
    pub ephemeral: bool,
    pub global_env: &'a BTreeMap<String, String>,
}

pub struct StepRunner<G: IdGen, C: Clock> {
    executor: Arc<dyn ContainerExecutor>,
    cache_locks: CacheLockManager,
    idgen: G,
    clock: C,
    condition: Arc<dyn ConditionEvaluator>,
}

impl<G: IdGen, C: Clock> StepRunner<G, C> {
    pub fn new(
        executor: Arc<dyn ContainerExecutor>,
        cache_locks: CacheLockManager,
        idgen: G,
        clock: C,
    ) -> Self {
        Self {
            executor,
            cache_locks,
            idgen,
            clock,
            condition: Arc::new(EnvTruthyCondition),
        }
    }

    pub fn with_condition_evaluator(mut self, condition: Arc<dyn ConditionEvaluator>) -> Self {
        self.condition = condition;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        workspace: &Workspace,
        state: &parking_lot::Mutex<StateStore>,
        reporter: &StreamReporter<C>,
        workspace_id: &WorkspaceId,
        job_id: &kiln_core::JobId,
        req: StepRunRequest<'_>,
    ) -> Result<StepOutcome, StepRunError> {
        let span = info_span!("step_run", step = %req.step.id);
        self.run_inner(workspace, state, reporter, workspace_id, job_id, req)
            .instrument(span)
            .await
    }

    /// `state` is locked only for the two brief, synchronous lookups below
    /// (cache check, commit) — never held across the `await` points where
    /// the executor runs, so concurrent steps within a wave never block on
    /// each other over the state store.
    async fn run_inner(
        &self,
        workspace: &Workspace,
        state: &parking_lot::Mutex<StateStore>,
        reporter: &StreamReporter<C>,
        workspace_id: &WorkspaceId,
        job_id: &kiln_core::JobId,
        req: StepRunRequest<'_>,
    ) -> Result<StepOutcome, StepRunError> {
        let step = req.step;
        let env = crate::config::merge_env(req.global_env, &step.env);
        let env = match &step.env_file {
            Some(path) => crate::config::merge_env(&load_env_file(path)?, &env),
            None => env,
        };

        let mut input_run_ids: Vec<RunId> = req.inputs.values().cloned().collect();
        input_run_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mount_refs: Vec<MountRef<'_>> = step
            .mounts
            .iter()
            .map(|m| MountRef {
                container_path: &m.container,
                source: &m.host,
            })
            .collect();

        let fp = fingerprint(FingerprintInput {
            image: &step.image,
            cmd: &step.cmd,
            setup_cmd: step.setup.as_ref().map(|s| s.cmd.as_slice()),
            env: &env,
            input_run_ids: &input_run_ids,
            mounts: &mount_refs,
        })
        .map_err(|e| StepRunError::Condition {
            step: step.id.clone(),
            message: e.to_string(),
        })?;

        // 1. Cache check.
        if !req.force && !req.ephemeral {
            let cached = state.lock().get_step(&step.id).cloned();
            if let Some(cached) = cached {
                if cached.fingerprint == fp {
                    if let Ok(dir) = workspace.committed_run_dir(&cached.run_id) {
                        if dir.is_dir() {
                            let run_id = cached.run_id.clone();
                            workspace.link_run(&step.id, &run_id)?;
                            self.emit(
                                reporter,
                                workspace_id,
                                job_id,
                                EventKind::StepSkipped {
                                    step: step.id.clone(),
                                    run_id: Some(run_id.clone()),
                                    reason: SkipReason::Cached,
                                },
                            );
                            return Ok(StepOutcome::Skipped {
                                run_id: Some(run_id),
                                reason: SkipReason::Cached,
                            });
                        }
                    }
                }
            }
        }

        // 2. Dry-run shortcut.
        if req.dry_run {
            self.emit(
                reporter,
                workspace_id,
                job_id,
                EventKind::StepWouldRun { step: step.id.clone() },
            );
            return Ok(StepOutcome::WouldRun);
        }

        // 3. Condition.
        if let Some(condition) = &step.if_condition {
            if !self.condition.evaluate(condition, &env) {
                self.emit(
                    reporter,
                    workspace_id,
                    job_id,
                    EventKind::StepSkipped {
                        step: step.id.clone(),
                        run_id: None,
                        reason: SkipReason::Condition,
                    },
                );
                return Ok(StepOutcome::Skipped {
                    run_id: None,
                    reason: SkipReason::Condition,
                });
            }
        }

        self.emit(
            reporter,
            workspace_id,
            job_id,
            EventKind::StepStarting { step: step.id.clone() },
        );

        // 4. Prepare.
        let run_id = self.idgen.next_run_id(self.clock.now_ms());
        workspace.prepare_run(&run_id)?;
        workspace.mark_step_running(
            &step.id,
            &RunningMarker {
                started_at: Utc::now(),
                pid: std::process::id(),
                step_name: step.display_name.clone(),
            },
        )?;

        let prepare_result = self.prepare(workspace, step, &run_id, req.inputs);
        if let Err(e) = prepare_result {
            workspace.discard_run(&run_id)?;
            workspace.mark_step_done(&step.id)?;
            return Err(e);
        }

        // 5. Lock setup caches (exclusive ones only), released on first of
        // setup-complete / step exit / error.
        let exclusive_setup_caches: Vec<String> = step
            .setup
            .iter()
            .flat_map(|s| s.caches.iter())
            .filter(|c| c.exclusive)
            .map(|c| c.name.clone())
            .collect();
        let guard = if exclusive_setup_caches.is_empty() {
            None
        } else {
            Some(self.cache_locks.acquire(&exclusive_setup_caches))
        };
        let guard = Arc::new(Mutex::new(guard));

        // 6. Execute with retries.
        let request = self.build_run_request(workspace, req.root, step, &run_id, req.inputs, &env)?;
        let exec_result = self
            .execute_with_retries(workspace, reporter, workspace_id, job_id, step, &run_id, request, &guard)
            .await;
        *guard.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let started_at_ms;
        let finished_at_ms;
        let exit_code = match exec_result {
            Ok(outcome) => {
                started_at_ms = outcome.started_at_ms;
                finished_at_ms = outcome.finished_at_ms;
                outcome.exit_code
            }
            Err(e) => {
                workspace.discard_run(&run_id)?;
                workspace.mark_step_done(&step.id)?;
                return Err(e);
            }
        };

        let duration_ms = finished_at_ms.saturating_sub(started_at_ms);
        let status = if exit_code == 0 {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };

        // 7. Write meta.json.
        let meta = RunMeta {
            run_id: run_id.clone(),
            step_id: step.id.clone(),
            step_name: step.display_name.clone(),
            started_at: epoch_ms_to_datetime(started_at_ms),
            finished_at: epoch_ms_to_datetime(finished_at_ms),
            duration_ms,
            exit_code,
            image: step.image.clone(),
            cmd: step.cmd.clone(),
            env: env.clone(),
            inputs: req
                .inputs
                .iter()
                .map(|(step_id, run_id)| RunMetaInput {
                    step: step_id.clone(),
                    run_id: run_id.clone(),
                    mounted_as: format!("/input/{step_id}"),
                })
                .collect(),
            mounts: step
                .mounts
                .iter()
                .map(|m| RunMetaMount {
                    host: m.host.clone(),
                    container: m.container.clone(),
                })
                .collect(),
            setup: step.setup.as_ref().map(|s| s.cmd.clone()),
            caches: step.caches.iter().map(|c| c.name.clone()).collect(),
            allow_network: step.allow_network,
            fingerprint: fp.as_str().to_string(),
            status,
        };
        kiln_workspace::fs_atomic::write_json_atomic(
            &workspace.staging_run_dir(&run_id)?.join("meta.json"),
            &meta,
        )?;

        if req.ephemeral {
            // 9. On ephemeral: discard unconditionally, regardless of exit code.
            workspace.discard_run(&run_id)?;
            workspace.mark_step_done(&step.id)?;
            self.emit(
                reporter,
                workspace_id,
                job_id,
                EventKind::StepFinished {
                    step: step.id.clone(),
                    run_id: None,
                    duration_ms: Some(duration_ms),
                    artifact_size: None,
                    ephemeral: true,
                },
            );
            return Ok(StepOutcome::Finished {
                run_id: None,
                exit_code,
                artifact_size: 0,
                ephemeral: true,
            });
        }

        // 8. Commit-or-discard.
        if exit_code == 0 || step.allow_failure {
            workspace.commit_run(&run_id)?;
            workspace.link_run(&step.id, &run_id)?;
            let artifact_size =
                dir_size(&workspace.committed_run_dir(&run_id)?.join("artifacts")).unwrap_or(0);
            let recorded_fp = if exit_code == 0 {
                fp.clone()
            } else {
                kiln_core::Fingerprint(String::new())
            };
            state.lock().set_step(
                step.id.clone(),
                StepState {
                    run_id: run_id.clone(),
                    fingerprint: recorded_fp,
                },
            );
            workspace.mark_step_done(&step.id)?;
            self.emit(
                reporter,
                workspace_id,
                job_id,
                EventKind::StepFinished {
                    step: step.id.clone(),
                    run_id: Some(run_id.clone()),
                    duration_ms: Some(duration_ms),
                    artifact_size: Some(artifact_size),
                    ephemeral: false,
                },
            );
            Ok(StepOutcome::Finished {
                run_id: Some(run_id),
                exit_code,
                artifact_size,
                ephemeral: false,
            })
        } else {
            workspace.discard_run(&run_id)?;
            workspace.mark_step_done(&step.id)?;
            self.emit(
                reporter,
                workspace_id,
                job_id,
                EventKind::StepFailed {
                    step: step.id.clone(),
                    exit_code,
                },
            );
            Err(StepRunError::Crashed(ContainerCrashError {
                step_id: step.id.clone(),
                exit_code,
            }))
        }
    }

    fn prepare(
        &self,
        workspace: &Workspace,
        step: &Step,
        run_id: &RunId,
        inputs: &BTreeMap<StepId, RunId>,
    ) -> Result<(), StepRunError> {
        let artifacts_dir = workspace.artifacts_dir(run_id)?;
        for input in step.inputs.iter().filter(|i| i.copy_to_output) {
            let Some(input_run_id) = inputs.get(&input.step) else {
                continue;
            };
            let src = workspace.committed_run_dir(input_run_id)?.join("artifacts");
            if src.is_dir() {
                copy_dir_recursive(&src, &artifacts_dir).map_err(|e| {
                    kiln_workspace::WorkspaceError::io(&artifacts_dir, e)
                })?;
            }
        }
        for cache in step.caches.iter().chain(step.setup.iter().flat_map(|s| s.caches.iter())) {
            workspace.prepare_cache(&cache.name)?;
        }
        Ok(())
    }

    fn build_run_request(
        &self,
        workspace: &Workspace,
        root: &Path,
        step: &Step,
        run_id: &RunId,
        inputs: &BTreeMap<StepId, RunId>,
        env: &BTreeMap<String, String>,
    ) -> Result<RunRequest, StepRunError> {
        let mut input_mounts = Vec::with_capacity(inputs.len());
        for (step_id, input_run_id) in inputs {
            let host_path = workspace.committed_run_dir(input_run_id)?.join("artifacts");
            input_mounts.push(InputMount {
                step_id: step_id.clone(),
                host_path,
                container_path: format!("/input/{step_id}"),
            });
        }

        let mut caches = Vec::new();
        let mut seen_caches = std::collections::BTreeSet::new();
        for cache in step.caches.iter().chain(step.setup.iter().flat_map(|s| s.caches.iter())) {
            if !seen_caches.insert(cache.name.clone()) {
                continue;
            }
            caches.push(CacheMount {
                name: cache.name.clone(),
                host_path: workspace.cache_path(&cache.name)?,
                container_path: cache.path.clone(),
                exclusive: cache.exclusive,
            });
        }

        // `mounts` (bind) and `sources` (writable-layer copies) both reach
        // the executor as plain host-path mounts: a single-use `--rm`
        // container makes the copy-vs-bind distinction unobservable, so the
        // contract only needs one shape for it (see `kiln-executor::cli`).
        let sources: Vec<SourceMount> = step
            .mounts
            .iter()
            .chain(step.sources.iter())
            .map(|m| SourceMount {
                host_path: root.join(&m.host),
                container_path: m.container.clone(),
            })
            .collect();

        Ok(RunRequest {
            workspace_id: workspace.id().clone(),
            step_id: step.id.clone(),
            image: step.image.clone(),
            cmd: step.cmd.clone(),
            setup: step.setup.as_ref().map(|s| SetupRequest {
                cmd: s.cmd.clone(),
                allow_network: s.allow_network,
            }),
            env: env.clone(),
            input_mounts,
            output_mount: OutputMount {
                host_path: workspace.artifacts_dir(run_id)?,
                container_path: step.output_path.clone(),
            },
            caches,
            sources,
            network: if step.allow_network {
                NetworkMode::Bridge
            } else {
                NetworkMode::None
            },
            timeout: step.timeout_sec.map(std::time::Duration::from_secs),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_with_retries(
        &self,
        workspace: &Workspace,
        reporter: &StreamReporter<C>,
        workspace_id: &WorkspaceId,
        job_id: &kiln_core::JobId,
        step: &Step,
        run_id: &RunId,
        request: RunRequest,
        guard: &Arc<Mutex<Option<kiln_workspace::CacheLockGuard>>>,
    ) -> Result<kiln_executor::RunOutcome, StepRunError> {
        let mut attempt: u32 = 0;
        loop {
            let setup_guard = guard.clone();
            let on_setup_complete = if request.setup.is_some() {
                Some(Arc::new(move || {
                    *setup_guard.lock().unwrap_or_else(|e| e.into_inner()) = None;
                }) as Arc<dyn Fn() + Send + Sync>)
            } else {
                None
            };

            let workspace_id_clone = workspace_id.clone();
            let job_id_clone = job_id.clone();
            let step_id_clone = step.id.clone();

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<LogLine>();
            let on_log_line: kiln_executor::LogSink = Arc::new(move |line: LogLine| {
                let _ = tx.send(line);
            });

            let run_fut = self.executor.run(request.clone(), on_log_line, on_setup_complete);
            tokio::pin!(run_fut);

            let mut stdout_lines = Vec::new();
            let mut stderr_lines = Vec::new();
            let result = loop {
                tokio::select! {
                    biased;
                    Some(line) = rx.recv() => {
                        self.emit(
                            reporter,
                            &workspace_id_clone,
                            &job_id_clone,
                            EventKind::StepLog {
                                step: step_id_clone.clone(),
                                stream: match line.stream {
                                    LogStream::Stdout => LogStreamKind::Stdout,
                                    LogStream::Stderr => LogStreamKind::Stderr,
                                },
                                line: line.line.clone(),
                            },
                        );
                        match line.stream {
                            LogStream::Stdout => stdout_lines.push(line.line),
                            LogStream::Stderr => stderr_lines.push(line.line),
                        }
                    }
                    outcome = &mut run_fut => {
                        while let Ok(line) = rx.try_recv() {
                            match line.stream {
                                LogStream::Stdout => stdout_lines.push(line.line),
                                LogStream::Stderr => stderr_lines.push(line.line),
                            }
                        }
                        break outcome;
                    }
                }
            };

            match result {
                Ok(outcome) => {
                    let dir = workspace.staging_run_dir(run_id)?;
                    write_log_file(&dir, "stdout.log", &stdout_lines);
                    write_log_file(&dir, "stderr.log", &stderr_lines);
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < step.retries => {
                    attempt += 1;
                    self.emit(
                        reporter,
                        workspace_id,
                        job_id,
                        EventKind::StepRetrying {
                            step: step.id.clone(),
                            attempt,
                            max_retries: step.retries,
                        },
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(step.retry_delay_ms)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn emit(
        &self,
        reporter: &StreamReporter<C>,
        workspace_id: &WorkspaceId,
        job_id: &kiln_core::JobId,
        kind: EventKind,
    ) {
        reporter.emit(Event::new(workspace_id.clone(), job_id.clone(), kind));
    }
}

fn epoch_ms_to_datetime(epoch_ms: u64) -> chrono::DateTime<Utc> {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64).unwrap_or_else(Utc::now)
}

fn write_log_file(dir: &Path, name: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    let mut content = lines.join("\n");
    content.push('\n');
    let _ = std::fs::write(dir.join(name), content);
}

fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, StepRunError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        StepRunError::Workspace(kiln_workspace::WorkspaceError::io(path, e))
    })?;
    let mut env = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            env.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(env)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    if !path.is_dir() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
#[path = "step_runner_tests.rs"]
mod tests;
