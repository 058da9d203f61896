// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconstructs per-job `SessionState` by folding over the event stream.
//! No direct teacher analogue (the teacher's CLI reads materialized state
//! directly rather than replaying a stream); grounded on this crate's own
//! `Event` shape plus the teacher's `MaterializedState::apply_event`
//! fold-over-events pattern.

use std::sync::Arc;

use indexmap::IndexMap;
use kiln_core::{JobId, RunId, StepId, WorkspaceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventKind, EventTransport, StreamMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Skipped,
    Finished,
    Failed,
}

/// One step's reconstructed view, keyed by step id in the session's `steps` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub id: StepId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
}

impl StepState {
    fn new(id: StepId, display_name: Option<String>) -> Self {
        Self {
            id,
            display_name,
            status: StepStatus::Pending,
            run_id: None,
            exit_code: None,
            duration_ms: None,
            artifact_size: None,
        }
    }
}

/// The aggregator's per-job view, rebuilt entirely from the messages it has
/// consumed. Serialized with `steps` as a plain object keyed by step id
/// (string, not the `StepId` newtype itself — see `kiln-workspace::state`'s
/// identical choice and its rationale) to match the daemon's `state{session}`
/// wire message exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub workspace_id: WorkspaceId,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub steps: IndexMap<String, StepState>,
}

impl SessionState {
    fn new(workspace_id: WorkspaceId, job_id: JobId) -> Self {
        Self {
            workspace_id,
            job_id,
            pipeline_name: None,
            status: SessionStatus::Running,
            started_at: None,
            finished_at: None,
            steps: IndexMap::new(),
        }
    }

    fn step_mut(&mut self, id: &StepId) -> &mut StepState {
        self.steps
            .entry(id.as_str().to_string())
            .or_insert_with(|| StepState::new(id.clone(), None))
    }
}

/// Folds an ordered (or prefix-consistent) stream of messages into a map of
/// `jobId -> SessionState`. Consuming the same messages in any
/// prefix-preserving order yields the same final state, since every rule
/// below is either idempotent (`PIPELINE_START` seeding `pending` steps) or
/// a plain overwrite keyed by the event it last saw.
#[derive(Debug, Default)]
pub struct Aggregator {
    sessions: IndexMap<String, SessionState>,
    last_job_id: Option<String>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&mut self, message: &StreamMessage) {
        match message {
            StreamMessage::Envelope(envelope) => self.apply(&envelope.event, Some(envelope.timestamp.as_str())),
            StreamMessage::Log(event) => self.apply(event, None),
        }
    }

    pub fn session(&self, job_id: &JobId) -> Option<&SessionState> {
        self.sessions.get(job_id.as_str())
    }

    /// The active session, or (if none) the most recently touched one —
    /// matching the daemon's `status` command contract (`spec.md` §4.12).
    pub fn latest(&self) -> Option<&SessionState> {
        self.last_job_id.as_ref().and_then(|id| self.sessions.get(id))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }

    fn apply(&mut self, event: &Event, timestamp: Option<&str>) {
        self.last_job_id = Some(event.job_id.as_str().to_string());
        let session = self
            .sessions
            .entry(event.job_id.as_str().to_string())
            .or_insert_with(|| SessionState::new(event.workspace_id.clone(), event.job_id.clone()));

        match &event.kind {
            EventKind::PipelineStart { pipeline_name, steps } => {
                session.pipeline_name = pipeline_name.clone();
                session.status = SessionStatus::Running;
                session.started_at = timestamp.map(str::to_string);
                for step in steps {
                    session
                        .steps
                        .entry(step.id.as_str().to_string())
                        .or_insert_with(|| StepState::new(step.id.clone(), step.display_name.clone()));
                }
            }
            EventKind::StepStarting { step } => {
                session.step_mut(step).status = StepStatus::Running;
            }
            EventKind::StepSkipped { step, run_id, .. } => {
                let st = session.step_mut(step);
                st.status = StepStatus::Skipped;
                st.run_id = run_id.clone();
            }
            EventKind::StepFinished {
                step,
                run_id,
                duration_ms,
                artifact_size,
                ..
            } => {
                let st = session.step_mut(step);
                st.status = StepStatus::Finished;
                st.run_id = run_id.clone();
                st.duration_ms = *duration_ms;
                st.artifact_size = *artifact_size;
            }
            EventKind::StepFailed { step, exit_code } => {
                let st = session.step_mut(step);
                st.status = StepStatus::Failed;
                st.exit_code = Some(*exit_code);
            }
            EventKind::PipelineFinished { .. } => {
                session.status = SessionStatus::Completed;
                session.finished_at = timestamp.map(str::to_string);
            }
            EventKind::PipelineFailed => {
                session.status = SessionStatus::Failed;
                session.finished_at = timestamp.map(str::to_string);
            }
            // Consumed without mutating step/session state, per spec.md §4.10.
            EventKind::StepLog { .. } | EventKind::StepRetrying { .. } | EventKind::StepWouldRun { .. } => {}
            EventKind::Custom => {}
        }
    }
}

/// Thread-safe handle an `EventTransport` consumer (the daemon, a CLI
/// `status` command) can hand to a reporter alongside its other
/// subscribers.
#[derive(Clone, Default)]
pub struct SharedAggregator(Arc<Mutex<Aggregator>>);

impl SharedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, job_id: &JobId) -> Option<SessionState> {
        self.0.lock().session(job_id).cloned()
    }

    pub fn latest(&self) -> Option<SessionState> {
        self.0.lock().latest().cloned()
    }
}

impl EventTransport for SharedAggregator {
    fn publish(&self, message: StreamMessage) {
        self.0.lock().consume(&message);
    }
}

#[cfg(test)]
#[path = "aggregator_tests.rs"]
mod tests;
