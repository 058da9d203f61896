// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::event::{LogStreamKind, StepRef};
use kiln_core::FakeClock;

fn envelope(clock: &FakeClock, workspace: &WorkspaceId, job: &JobId, kind: EventKind) -> StreamMessage {
    StreamMessage::Envelope(crate::event::Envelope {
        seq: 0,
        timestamp: format!("{}ms", clock.now_ms()),
        version: 1,
        event_type: kind.name(),
        event: Event::new(workspace.clone(), job.clone(), kind),
    })
}

#[test]
fn pipeline_start_seeds_every_declared_step_as_pending() {
    let mut agg = Aggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let job = JobId::new("job-1");

    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::PipelineStart {
            pipeline_name: Some("build".to_string()),
            steps: vec![
                StepRef { id: StepId::new("a"), display_name: Some("Build A".to_string()) },
                StepRef { id: StepId::new("b"), display_name: None },
            ],
        },
    ));

    let session = agg.session(&job).expect("session exists");
    assert_eq!(session.pipeline_name.as_deref(), Some("build"));
    assert!(matches!(session.status, SessionStatus::Running));
    assert!(session.started_at.is_some());
    assert_eq!(session.steps.len(), 2);
    let a = &session.steps["a"];
    assert!(matches!(a.status, StepStatus::Pending));
    assert_eq!(a.display_name.as_deref(), Some("Build A"));
    let b = &session.steps["b"];
    assert!(matches!(b.status, StepStatus::Pending));
    assert!(b.display_name.is_none());
}

#[test]
fn step_lifecycle_events_update_status_and_fields() {
    let mut agg = Aggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let job = JobId::new("job-1");

    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::PipelineStart {
            pipeline_name: None,
            steps: vec![StepRef { id: StepId::new("a"), display_name: None }],
        },
    ));
    agg.consume(&envelope(&clock, &ws, &job, EventKind::StepStarting { step: StepId::new("a") }));
    assert!(matches!(agg.session(&job).unwrap().steps["a"].status, StepStatus::Running));

    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::StepFinished {
            step: StepId::new("a"),
            run_id: Some(RunId::new("run-1")),
            duration_ms: Some(250),
            artifact_size: Some(1024),
            ephemeral: false,
        },
    ));

    let step = &agg.session(&job).unwrap().steps["a"];
    assert!(matches!(step.status, StepStatus::Finished));
    assert_eq!(step.run_id.as_ref().unwrap().as_str(), "run-1");
    assert_eq!(step.duration_ms, Some(250));
    assert_eq!(step.artifact_size, Some(1024));
}

#[test]
fn step_skipped_and_failed_set_the_expected_fields() {
    let mut agg = Aggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let job = JobId::new("job-1");

    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::PipelineStart {
            pipeline_name: None,
            steps: vec![
                StepRef { id: StepId::new("a"), display_name: None },
                StepRef { id: StepId::new("b"), display_name: None },
            ],
        },
    ));
    agg.consume(&envelope(&clock, &ws, &job, EventKind::StepFailed { step: StepId::new("a"), exit_code: 7 }));
    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::StepSkipped {
            step: StepId::new("b"),
            run_id: None,
            reason: crate::event::SkipReason::Dependency,
        },
    ));

    let session = agg.session(&job).unwrap();
    let a = &session.steps["a"];
    assert!(matches!(a.status, StepStatus::Failed));
    assert_eq!(a.exit_code, Some(7));
    let b = &session.steps["b"];
    assert!(matches!(b.status, StepStatus::Skipped));
    assert!(b.run_id.is_none());
}

#[test]
fn an_event_for_an_unknown_job_lazily_creates_a_session() {
    let mut agg = Aggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let job = JobId::new("job-unseen");

    agg.consume(&envelope(&clock, &ws, &job, EventKind::StepStarting { step: StepId::new("a") }));

    let session = agg.session(&job).expect("session was created on first sight");
    assert!(matches!(session.steps["a"].status, StepStatus::Running));
}

#[test]
fn pipeline_finished_and_failed_set_terminal_status_and_finished_at() {
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");

    let mut agg = Aggregator::new();
    let job = JobId::new("job-ok");
    agg.consume(&envelope(&clock, &ws, &job, EventKind::PipelineFinished { total_artifact_size: 42 }));
    let session = agg.session(&job).unwrap();
    assert!(matches!(session.status, SessionStatus::Completed));
    assert!(session.finished_at.is_some());

    let mut agg = Aggregator::new();
    let job = JobId::new("job-bad");
    agg.consume(&envelope(&clock, &ws, &job, EventKind::PipelineFailed));
    let session = agg.session(&job).unwrap();
    assert!(matches!(session.status, SessionStatus::Failed));
    assert!(session.finished_at.is_some());
}

#[test]
fn log_retrying_and_would_run_events_never_mutate_step_state() {
    let mut agg = Aggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let job = JobId::new("job-1");

    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::PipelineStart {
            pipeline_name: None,
            steps: vec![StepRef { id: StepId::new("a"), display_name: None }],
        },
    ));
    agg.consume(&StreamMessage::Log(Event::new(
        ws.clone(),
        job.clone(),
        EventKind::StepLog {
            step: StepId::new("a"),
            stream: LogStreamKind::Stdout,
            line: "hello".to_string(),
        },
    )));
    agg.consume(&envelope(
        &clock,
        &ws,
        &job,
        EventKind::StepRetrying { step: StepId::new("a"), attempt: 1, max_retries: 3 },
    ));
    agg.consume(&envelope(&clock, &ws, &job, EventKind::StepWouldRun { step: StepId::new("a") }));

    let a = &agg.session(&job).unwrap().steps["a"];
    assert!(matches!(a.status, StepStatus::Pending));
    assert!(a.run_id.is_none());
}

#[test]
fn latest_tracks_the_most_recently_touched_job() {
    let mut agg = Aggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let first = JobId::new("job-1");
    let second = JobId::new("job-2");

    agg.consume(&envelope(&clock, &ws, &first, EventKind::StepStarting { step: StepId::new("a") }));
    assert_eq!(agg.latest().unwrap().job_id.as_str(), "job-1");

    agg.consume(&envelope(&clock, &ws, &second, EventKind::StepStarting { step: StepId::new("a") }));
    assert_eq!(agg.latest().unwrap().job_id.as_str(), "job-2");

    agg.consume(&envelope(&clock, &ws, &first, EventKind::PipelineFinished { total_artifact_size: 0 }));
    assert_eq!(agg.latest().unwrap().job_id.as_str(), "job-1");
}

#[test]
fn shared_aggregator_forwards_published_messages_to_the_inner_aggregator() {
    let shared = SharedAggregator::new();
    let clock = FakeClock::default();
    let ws = WorkspaceId::new("ws");
    let job = JobId::new("job-1");

    shared.publish(envelope(
        &clock,
        &ws,
        &job,
        EventKind::PipelineStart {
            pipeline_name: Some("build".to_string()),
            steps: vec![StepRef { id: StepId::new("a"), display_name: None }],
        },
    ));
    shared.publish(envelope(&clock, &ws, &job, EventKind::StepStarting { step: StepId::new("a") }));

    let session = shared.session(&job).expect("session recorded");
    assert!(matches!(session.steps["a"].status, StepStatus::Running));
    assert_eq!(shared.latest().unwrap().job_id.as_str(), "job-1");
}
