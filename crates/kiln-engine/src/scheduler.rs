// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The pipeline runner: wave-by-wave bounded-concurrency scheduling, skip
//! propagation, and abort semantics. Grounded on `oj-engine::scheduler.rs`'s
//! timer/readiness bookkeeping style, generalized to a
//! `tokio::sync::Semaphore`-gated wave pool since the teacher's scheduler
//! tracks single timers rather than a concurrency-capped worker pool.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_core::{
    build_graph, leaf_nodes, subgraph, topological_levels, Clock, IdGen, JobId, RunId, StepGraph,
    StepId, WorkspaceId,
};
use kiln_executor::ContainerExecutor;
use kiln_pipeline::{Pipeline, Step};
use kiln_workspace::{StateStore, Workspace};
use tokio::sync::{Notify, Semaphore};
use tracing::{info_span, warn, Instrument};

use crate::config::RunOptions;
use crate::error::{ContainerCrashError, SchedulerError};
use crate::event::{Event, EventKind, EventTransport, SkipReason, StreamReporter, StepRef};
use crate::step_runner::{ConditionEvaluator, EnvTruthyCondition, StepOutcome, StepRunRequest, StepRunner};

/// Shared handle a caller can use to request cooperative cancellation of an
/// in-flight `PipelineRunner::run_cancellable` call.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// What finished running the pipeline.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job_id: JobId,
    pub total_artifact_size: u64,
}

#[derive(Debug, Clone)]
enum StepResult {
    Skipped,
    Finished { run_id: Option<RunId> },
    Failed,
}

impl StepResult {
    fn blocks_dependents(&self) -> bool {
        matches!(self, StepResult::Skipped | StepResult::Failed)
    }
}

/// Drives one pipeline run end to end: opens the workspace, computes the
/// active subgraph and its waves, and executes each wave with a bounded
/// worker pool, delegating the per-step state machine to [`StepRunner`].
///
/// Workspace-lock acquisition is deliberately not this type's job: the CLI
/// surface that would normally hold it across a run is out of scope for
/// this crate (`spec.md` §1), and the daemon — which *does* hold it — sets
/// `opts.skip_lock` and is expected to have acquired it before calling
/// [`PipelineRunner::run`].
pub struct PipelineRunner<G: IdGen, C: Clock> {
    executor: Arc<dyn ContainerExecutor>,
    cache_locks: kiln_workspace::CacheLockManager,
    idgen: G,
    clock: C,
    condition: Arc<dyn ConditionEvaluator>,
    transport: Arc<dyn EventTransport>,
    workdir: PathBuf,
}

impl<G: IdGen, C: Clock> PipelineRunner<G, C> {
    pub fn new(
        executor: Arc<dyn ContainerExecutor>,
        idgen: G,
        clock: C,
        transport: Arc<dyn EventTransport>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            executor,
            cache_locks: kiln_workspace::CacheLockManager::new(),
            idgen,
            clock,
            condition: Arc::new(EnvTruthyCondition),
            transport,
            workdir,
        }
    }

    pub fn with_condition_evaluator(mut self, condition: Arc<dyn ConditionEvaluator>) -> Self {
        self.condition = condition;
        self
    }

    pub async fn run(&self, pipeline: &Pipeline, opts: RunOptions) -> Result<RunSummary, SchedulerError> {
        self.run_cancellable(pipeline, opts, CancelHandle::new()).await
    }

    pub async fn run_cancellable(
        &self,
        pipeline: &Pipeline,
        opts: RunOptions,
        cancel: CancelHandle,
    ) -> Result<RunSummary, SchedulerError> {
        let workspace_id = WorkspaceId::new(opts.workspace.clone().unwrap_or_else(|| pipeline.id.clone()));
        let workspace = Workspace::open_or_create(&self.workdir, workspace_id.clone())?;

        // 2. Purge crash debris, check executor availability.
        workspace.cleanup_staging()?;
        workspace.cleanup_running()?;
        self.executor.cleanup_containers(workspace.id()).await?;
        if !opts.dry_run {
            self.executor.check().await?;
        }

        // 3. Load state + optional global env file.
        let state = Arc::new(parking_lot::Mutex::new(StateStore::load(workspace.state_path())?));
        let global_env = match &opts.env_file {
            Some(path) => load_env_file(path)?,
            None => BTreeMap::new(),
        };

        // 4. Build graph; compute the active subgraph and its waves.
        let graph = build_step_graph(pipeline);
        let targets = if opts.target.is_empty() {
            leaf_nodes(&graph)
        } else {
            opts.target.clone()
        };
        let active = subgraph(&graph, &targets);
        let waves: Vec<Vec<StepId>> = topological_levels(&graph)
            .map_err(|e| SchedulerError::Cyclic(cyclic_ids(&e)))?
            .into_iter()
            .map(|wave| wave.into_iter().filter(|id| active.contains(id)).collect())
            .filter(|wave: &Vec<StepId>| !wave.is_empty())
            .collect();

        // 5. Emit PIPELINE_START in the pipeline's own insertion order.
        let job_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| JobId::new(uuid::Uuid::new_v4().to_string()));
        let reporter = Arc::new(StreamReporter::new(self.transport.clone(), self.clock.clone()));
        let step_refs: Vec<StepRef> = pipeline
            .steps
            .iter()
            .filter(|s| active.contains(&s.id))
            .map(|s| StepRef {
                id: s.id.clone(),
                display_name: s.display_name.clone(),
            })
            .collect();
        reporter.emit(Event::new(
            workspace_id.clone(),
            job_id.clone(),
            EventKind::PipelineStart {
                pipeline_name: pipeline.display_name.clone().or_else(|| Some(pipeline.id.clone())),
                steps: step_refs,
            },
        ));

        let runner = Arc::new(
            StepRunner::new(self.executor.clone(), self.cache_locks.clone(), self.idgen.clone(), self.clock.clone())
                .with_condition_evaluator(self.condition.clone()),
        );

        let watcher_executor = self.executor.clone();
        let watcher_cancel = cancel.clone();
        let kill_watcher = tokio::spawn(async move {
            watcher_cancel.cancelled().await;
            let _ = watcher_executor.kill_running_containers().await;
        });

        let mut results: BTreeMap<StepId, StepResult> = BTreeMap::new();
        let mut total_artifact_size: u64 = 0;
        let mut first_failure: Option<StepId> = None;
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));

        'waves: for wave in &waves {
            if cancel.is_cancelled() {
                break 'waves;
            }

            // Once a step has failed, later waves are walked purely to
            // cascade `skipped{reason:dependency}` to blocked descendants
            // (`spec.md` §8's "allowFailure continuation" scenario expects
            // every dependent to carry a terminal status) — nothing new is
            // submitted to the executor past that point.
            let aborting = first_failure.is_some();

            let mut join_set = tokio::task::JoinSet::new();
            for step_id in wave {
                let Some(step) = pipeline.step(step_id.as_str()) else {
                    continue;
                };

                // Skip propagation: any non-optional input already failed or
                // skipped takes this step out without ever starting it.
                let blocked = step
                    .non_optional_inputs()
                    .any(|input| results.get(&input.step).map(StepResult::blocks_dependents).unwrap_or(false));
                if blocked {
                    reporter.emit(Event::new(
                        workspace_id.clone(),
                        job_id.clone(),
                        EventKind::StepSkipped {
                            step: step.id.clone(),
                            run_id: None,
                            reason: SkipReason::Dependency,
                        },
                    ));
                    results.insert(step.id.clone(), StepResult::Skipped);
                    continue;
                }

                if aborting {
                    // Not blocked by a failed ancestor, but the pipeline is
                    // already doomed: leave it untouched (pending) rather
                    // than starting new work after a failure.
                    continue;
                }

                let inputs: BTreeMap<StepId, RunId> = step
                    .inputs
                    .iter()
                    .filter_map(|input| match results.get(&input.step) {
                        Some(StepResult::Finished { run_id: Some(run_id) }) => {
                            Some((input.step.clone(), run_id.clone()))
                        }
                        _ => None,
                    })
                    .collect();

                let step = step.clone();
                let root = pipeline.root.clone();
                let permit = semaphore.clone();
                let workspace = workspace.clone();
                let state = state.clone();
                let reporter = reporter.clone();
                let runner = runner.clone();
                let workspace_id = workspace_id.clone();
                let job_id = job_id.clone();
                let global_env = global_env.clone();
                let force = opts.force.applies_to(&step.id);
                let dry_run = opts.dry_run;

                join_set.spawn(
                    async move {
                        // A closed semaphore isn't a reachable state (nothing
                        // ever calls `close()`); fall through without a
                        // permit rather than unwrap a Result that can't
                        // meaningfully fail here.
                        let _permit = permit.acquire_owned().await.ok();
                        let req = StepRunRequest {
                            step: &step,
                            root: &root,
                            inputs: &inputs,
                            force,
                            dry_run,
                            ephemeral: false,
                            global_env: &global_env,
                        };
                        let outcome = runner
                            .run(&workspace, &state, &reporter, &workspace_id, &job_id, req)
                            .await;
                        (step.id.clone(), outcome)
                    }
                    .instrument(info_span!("wave_step")),
                );
            }

            while let Some(joined) = join_set.join_next().await {
                let (step_id, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(join_err) => {
                        warn!(error = %join_err, "step task panicked or was cancelled");
                        continue;
                    }
                };
                match outcome {
                    Ok(StepOutcome::Skipped { run_id, reason: SkipReason::Cached }) => {
                        results.insert(step_id, StepResult::Finished { run_id });
                    }
                    Ok(StepOutcome::Skipped { reason: SkipReason::Condition | SkipReason::Dependency, .. }) => {
                        results.insert(step_id, StepResult::Skipped);
                    }
                    Ok(StepOutcome::WouldRun) => {
                        results.insert(step_id, StepResult::Finished { run_id: None });
                    }
                    Ok(StepOutcome::Finished {
                        run_id,
                        artifact_size,
                        ..
                    }) => {
                        total_artifact_size += artifact_size;
                        results.insert(step_id, StepResult::Finished { run_id });
                    }
                    Ok(StepOutcome::Failed { .. }) => {
                        first_failure.get_or_insert_with(|| step_id.clone());
                        results.insert(step_id, StepResult::Failed);
                    }
                    Err(crate::error::StepRunError::Crashed(ContainerCrashError { step_id: id, exit_code })) => {
                        first_failure.get_or_insert_with(|| id.clone());
                        results.insert(id.clone(), StepResult::Failed);
                        let _ = exit_code;
                    }
                    Err(other) => {
                        warn!(step = %step_id, error = %other, "step run failed");
                        first_failure.get_or_insert_with(|| step_id.clone());
                        results.insert(step_id, StepResult::Failed);
                    }
                }
            }

            // 7. Persist state after every wave, regardless of outcome. The
            // loop itself keeps advancing through remaining waves even once
            // `first_failure` is set, so every reachable descendant gets a
            // terminal `skipped` status before the run is reported as failed.
            state.lock().save()?;
        }

        kill_watcher.abort();

        if cancel.is_cancelled() {
            reporter.emit(Event::new(workspace_id.clone(), job_id.clone(), EventKind::PipelineFailed));
            return Err(SchedulerError::Cancelled);
        }

        if let Some(failed_step) = first_failure {
            reporter.emit(Event::new(workspace_id, job_id.clone(), EventKind::PipelineFailed));
            return Err(SchedulerError::Crashed(ContainerCrashError {
                step_id: failed_step,
                exit_code: -1,
            }));
        }

        // 8. Full success.
        reporter.emit(Event::new(
            workspace_id,
            job_id.clone(),
            EventKind::PipelineFinished {
                total_artifact_size,
            },
        ));
        Ok(RunSummary {
            job_id,
            total_artifact_size,
        })
    }
}

/// Rebuilds the same graph the resolver validated: every input whose
/// target step exists becomes an edge, optional or not (optional only
/// changes whether a *missing* reference is an error, not whether an
/// *existing* one orders execution).
fn build_step_graph(pipeline: &Pipeline) -> StepGraph {
    let known: std::collections::HashSet<&str> = pipeline.steps.iter().map(|s| s.id.as_str()).collect();
    build_graph(pipeline.steps.iter().map(|s: &Step| {
        let deps = s
            .inputs
            .iter()
            .filter(|i| known.contains(i.step.as_str()))
            .map(|i| i.step.clone());
        (s.id.clone(), deps.collect::<Vec<_>>())
    }))
}

fn cyclic_ids(e: &kiln_core::CyclicDependencyError) -> Vec<StepId> {
    match e {
        kiln_core::CyclicDependencyError::Cycle(ids) => ids.clone(),
    }
}

fn load_env_file(path: &std::path::Path) -> Result<BTreeMap<String, String>, SchedulerError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SchedulerError::Workspace(kiln_workspace::WorkspaceError::io(path, e)))?;
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

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
