// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use kiln_core::{FakeClock, SequentialIdGen};
use kiln_executor::fake::{FakeExecutor, ScriptedOutcome};
use kiln_pipeline::model::Input;
use std::path::PathBuf;
use std::sync::Arc;

fn step(id: &str, inputs: Vec<Input>) -> Step {
    Step {
        id: StepId::new(id),
        display_name: None,
        image: "alpine:3.20".to_string(),
        cmd: vec!["true".to_string()],
        setup: None,
        env: BTreeMap::new(),
        env_file: None,
        inputs,
        output_path: kiln_pipeline::model::DEFAULT_OUTPUT_PATH.to_string(),
        caches: Vec::new(),
        mounts: Vec::new(),
        sources: Vec::new(),
        timeout_sec: None,
        allow_failure: false,
        allow_network: false,
        retries: 0,
        retry_delay_ms: kiln_pipeline::model::DEFAULT_RETRY_DELAY_MS,
        if_condition: None,
    }
}

fn input(step_id: &str) -> Input {
    Input {
        step: StepId::new(step_id),
        copy_to_output: false,
        optional: false,
    }
}

fn pipeline(id: &str, steps: Vec<Step>) -> Pipeline {
    Pipeline {
        id: id.to_string(),
        display_name: None,
        root: PathBuf::from("/pipeline"),
        steps,
    }
}

struct Recorder(parking_lot::Mutex<Vec<crate::event::StreamMessage>>);

impl crate::event::EventTransport for Recorder {
    fn publish(&self, message: crate::event::StreamMessage) {
        self.0.lock().push(message);
    }
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self(parking_lot::Mutex::new(Vec::new())))
    }

    fn events(&self) -> Vec<crate::event::EventKind> {
        self.0.lock().iter().map(|m| m.event().kind.clone()).collect()
    }

    fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|k| k.name()).collect()
    }
}

fn new_runner(
    executor: FakeExecutor,
    transport: Arc<Recorder>,
    workdir: &std::path::Path,
) -> PipelineRunner<SequentialIdGen, FakeClock> {
    PipelineRunner::new(
        Arc::new(executor),
        SequentialIdGen::new(),
        FakeClock::default(),
        transport,
        workdir.to_path_buf(),
    )
}

#[tokio::test]
async fn independent_steps_run_in_the_same_wave_and_pass_inputs_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let recorder = Recorder::new();
    let runner = new_runner(executor.clone(), recorder.clone(), dir.path());

    let pipe = pipeline(
        "pipe",
        vec![step("a", vec![]), step("b", vec![input("a")])],
    );

    let summary = runner.run(&pipe, RunOptions::default()).await.unwrap();
    assert!(!summary.job_id.as_str().is_empty());

    let runs = executor.runs();
    assert_eq!(runs.len(), 2);
    let b_run = runs.iter().find(|r| r.step_id.as_str() == "b").unwrap();
    assert_eq!(b_run.request.input_mounts.len(), 1);
    assert_eq!(b_run.request.input_mounts[0].step_id.as_str(), "a");

    assert!(recorder.names().contains(&"PIPELINE_FINISHED"));
}

#[tokio::test]
async fn a_second_run_of_the_same_pipeline_hits_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let pipe = pipeline("pipe", vec![step("a", vec![])]);

    {
        let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
        runner.run(&pipe, RunOptions::default()).await.unwrap();
    }
    {
        let recorder = Recorder::new();
        let runner = new_runner(executor.clone(), recorder.clone(), dir.path());
        runner.run(&pipe, RunOptions::default()).await.unwrap();
        assert!(recorder.names().contains(&"STEP_SKIPPED"));
    }

    assert_eq!(executor.runs().len(), 1);
}

#[tokio::test]
async fn invalidating_an_upstream_step_cascades_to_its_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let first_pipe = pipeline(
        "pipe",
        vec![step("a", vec![]), step("b", vec![input("a")])],
    );
    {
        let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
        runner.run(&first_pipe, RunOptions::default()).await.unwrap();
    }
    assert_eq!(executor.runs().len(), 2);

    let mut changed_a = step("a", vec![]);
    changed_a.cmd = vec!["false".to_string()];
    let second_pipe = pipeline("pipe", vec![changed_a, step("b", vec![input("a")])]);

    let recorder = Recorder::new();
    let runner = new_runner(executor.clone(), recorder.clone(), dir.path());
    runner.run(&second_pipe, RunOptions::default()).await.unwrap();

    // `a`'s new fingerprint forces a rerun, which changes its run id, which
    // changes `b`'s input_run_ids and therefore `b`'s fingerprint too.
    assert_eq!(executor.runs().len(), 4);
}

#[tokio::test]
async fn force_steps_reruns_only_the_named_step() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let pipe = pipeline(
        "pipe",
        vec![step("a", vec![]), step("b", vec![input("a")])],
    );

    {
        let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
        runner.run(&pipe, RunOptions::default()).await.unwrap();
    }
    assert_eq!(executor.runs().len(), 2);

    let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
    let opts = RunOptions {
        force: Force::Steps(vec![StepId::new("a")]),
        ..RunOptions::default()
    };
    runner.run(&pipe, opts).await.unwrap();

    // `a` reruns (forced); its run id is new, so `b`'s fingerprint changes
    // too and it reruns as a consequence — not because it was forced.
    assert_eq!(executor.runs().len(), 4);
}

#[tokio::test]
async fn allow_failure_lets_the_pipeline_continue_past_a_failed_step() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    executor.script(
        "a",
        ScriptedOutcome {
            exit_code: 1,
            ..Default::default()
        },
    );
    let mut a = step("a", vec![]);
    a.allow_failure = true;
    let pipe = pipeline("pipe", vec![a, step("b", vec![input("a")])]);

    let recorder = Recorder::new();
    let runner = new_runner(executor.clone(), recorder.clone(), dir.path());
    runner.run(&pipe, RunOptions::default()).await.unwrap();

    assert_eq!(executor.runs().len(), 2);
    assert!(!recorder.names().contains(&"STEP_SKIPPED"));
}

#[tokio::test]
async fn a_failed_step_without_allow_failure_skips_its_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    executor.script(
        "a",
        ScriptedOutcome {
            exit_code: 1,
            ..Default::default()
        },
    );
    let pipe = pipeline(
        "pipe",
        vec![step("a", vec![]), step("b", vec![input("a")])],
    );

    let recorder = Recorder::new();
    let runner = new_runner(executor.clone(), recorder.clone(), dir.path());
    let err = runner.run(&pipe, RunOptions::default()).await.unwrap_err();

    assert!(matches!(err, SchedulerError::Crashed(_)));
    // `b` is never handed to the executor at all.
    assert_eq!(executor.runs().len(), 1);
    assert!(recorder.names().contains(&"STEP_SKIPPED"));
    assert!(recorder.names().contains(&"PIPELINE_FAILED"));
}

#[tokio::test]
async fn dry_run_never_invokes_the_executor() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let pipe = pipeline(
        "pipe",
        vec![step("a", vec![]), step("b", vec![input("a")])],
    );

    let recorder = Recorder::new();
    let runner = new_runner(executor.clone(), recorder.clone(), dir.path());
    let opts = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    runner.run(&pipe, opts).await.unwrap();

    assert!(executor.runs().is_empty());
    assert_eq!(
        recorder.names().iter().filter(|n| **n == "STEP_WOULD_RUN").count(),
        2
    );
}

#[tokio::test]
async fn targeting_a_step_builds_only_its_transitive_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let pipe = pipeline(
        "pipe",
        vec![
            step("a", vec![]),
            step("b", vec![input("a")]),
            step("unrelated", vec![]),
        ],
    );

    let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
    let opts = RunOptions {
        target: vec![StepId::new("b")],
        ..RunOptions::default()
    };
    runner.run(&pipe, opts).await.unwrap();

    let ran: std::collections::BTreeSet<String> = executor
        .runs()
        .into_iter()
        .map(|r| r.step_id.as_str().to_string())
        .collect();
    assert_eq!(
        ran,
        std::collections::BTreeSet::from(["a".to_string(), "b".to_string()])
    );
}

#[tokio::test]
async fn a_cyclic_pipeline_is_rejected_before_anything_runs() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let pipe = pipeline(
        "pipe",
        vec![step("a", vec![input("b")]), step("b", vec![input("a")])],
    );

    let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
    let err = runner.run(&pipe, RunOptions::default()).await.unwrap_err();

    assert!(matches!(err, SchedulerError::Cyclic(_)));
    assert!(executor.runs().is_empty());
}

#[tokio::test]
async fn cancelling_before_the_next_wave_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let pipe = pipeline(
        "pipe",
        vec![step("a", vec![]), step("b", vec![input("a")])],
    );

    let runner = new_runner(executor.clone(), Recorder::new(), dir.path());
    let cancel = CancelHandle::new();
    cancel.cancel();

    let err = runner
        .run_cancellable(&pipe, RunOptions::default(), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Cancelled));
    assert!(executor.runs().is_empty());
}
