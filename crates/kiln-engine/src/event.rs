// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The event model: a tagged-union `Event`, wrapped in an `Envelope` that
//! carries a monotonic sequence number for the durable stream, and the
//! `StreamReporter` that publishes both through an injected
//! [`EventTransport`]. Grounded on `oj-core::event::Event`
//! (`#[serde(tag = "type")]`, a `name()` method), adapted to this spec's own
//! variant list and its `STEP_LOG` durable-stream exclusion rule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kiln_core::{Clock, JobId, RunId, StepId, WorkspaceId};
use serde::{Deserialize, Serialize};

/// Why a step was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cached,
    Condition,
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRef {
    pub id: StepId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One event in the pipeline's lifecycle. Tagged by `event` (`PIPELINE_START`,
/// `STEP_STARTING`, ...), matching `spec.md` §4.9's variant list verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EventKind {
    #[serde(rename = "PIPELINE_START")]
    PipelineStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        pipeline_name: Option<String>,
        steps: Vec<StepRef>,
    },
    #[serde(rename = "STEP_STARTING")]
    StepStarting { step: StepId },
    #[serde(rename = "STEP_SKIPPED")]
    StepSkipped {
        step: StepId,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
        reason: SkipReason,
    },
    #[serde(rename = "STEP_FINISHED")]
    StepFinished {
        step: StepId,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact_size: Option<u64>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        ephemeral: bool,
    },
    #[serde(rename = "STEP_FAILED")]
    StepFailed { step: StepId, exit_code: i32 },
    #[serde(rename = "STEP_RETRYING")]
    StepRetrying {
        step: StepId,
        attempt: u32,
        max_retries: u32,
    },
    #[serde(rename = "STEP_WOULD_RUN")]
    StepWouldRun { step: StepId },
    #[serde(rename = "STEP_LOG")]
    StepLog {
        step: StepId,
        stream: LogStreamKind,
        line: String,
    },
    #[serde(rename = "PIPELINE_FINISHED")]
    PipelineFinished { total_artifact_size: u64 },
    #[serde(rename = "PIPELINE_FAILED")]
    PipelineFailed,
    /// Forward-compat catch-all: an older runner's stream may carry an
    /// event tag this build doesn't know about yet. Never emitted.
    #[serde(other, skip_serializing)]
    Custom,
}

impl EventKind {
    /// The wire tag, for logging without re-serializing to JSON.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PipelineStart { .. } => "PIPELINE_START",
            EventKind::StepStarting { .. } => "STEP_STARTING",
            EventKind::StepSkipped { .. } => "STEP_SKIPPED",
            EventKind::StepFinished { .. } => "STEP_FINISHED",
            EventKind::StepFailed { .. } => "STEP_FAILED",
            EventKind::StepRetrying { .. } => "STEP_RETRYING",
            EventKind::StepWouldRun { .. } => "STEP_WOULD_RUN",
            EventKind::StepLog { .. } => "STEP_LOG",
            EventKind::PipelineFinished { .. } => "PIPELINE_FINISHED",
            EventKind::PipelineFailed => "PIPELINE_FAILED",
            EventKind::Custom => "CUSTOM",
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, EventKind::StepLog { .. })
    }

    /// One-line summary for `tracing` fields, cheaper than serializing the
    /// whole event just to log that it happened.
    pub fn log_summary(&self) -> String {
        match self {
            EventKind::PipelineStart { steps, .. } => format!("{} step(s) declared", steps.len()),
            EventKind::StepStarting { step } => step.to_string(),
            EventKind::StepSkipped { step, reason, .. } => format!("{step} ({reason:?})"),
            EventKind::StepFinished { step, duration_ms, .. } => {
                format!("{step} in {}ms", duration_ms.unwrap_or_default())
            }
            EventKind::StepFailed { step, exit_code } => format!("{step} exit={exit_code}"),
            EventKind::StepRetrying { step, attempt, max_retries } => {
                format!("{step} attempt {attempt}/{max_retries}")
            }
            EventKind::StepWouldRun { step } => step.to_string(),
            EventKind::StepLog { step, .. } => step.to_string(),
            EventKind::PipelineFinished { total_artifact_size } => {
                format!("{total_artifact_size} byte(s) of artifacts")
            }
            EventKind::PipelineFailed => String::new(),
            EventKind::Custom => String::new(),
        }
    }
}

/// The common header every event carries, plus its variant payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub workspace_id: WorkspaceId,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(workspace_id: WorkspaceId, job_id: JobId, kind: EventKind) -> Self {
        Self {
            workspace_id,
            job_id,
            group_id: None,
            kind,
        }
    }
}

/// A durable-stream record: a sequenced, timestamped `Event`. Never built
/// for `STEP_LOG` (see `spec.md` §4.9 — log lines are excluded from the
/// durable/sequenced stream; the log files on disk are the canonical
/// record for those).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub timestamp: String,
    pub version: u32,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub event: Event,
}

/// What a `StreamReporter` hands to an `EventTransport`: a sequenced
/// envelope for every event except `STEP_LOG`, which is delivered live
/// without a sequence number or durable record.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Envelope(Envelope),
    Log(Event),
}

impl StreamMessage {
    pub fn event(&self) -> &Event {
        match self {
            StreamMessage::Envelope(e) => &e.event,
            StreamMessage::Log(e) => e,
        }
    }
}

/// Anything that can receive published stream messages: a daemon's
/// subscriber fan-out, an in-process channel, or (in tests) a recording
/// sink.
pub trait EventTransport: Send + Sync {
    fn publish(&self, message: StreamMessage);
}

/// Wraps an `EventTransport`, assigning the monotonic per-job sequence
/// number and ISO-8601 timestamp to every non-log event before publishing.
/// All events for one job are emitted from a single runner task, so the
/// sequence it assigns is strictly increasing by construction.
pub struct StreamReporter<C: Clock> {
    transport: Arc<dyn EventTransport>,
    clock: C,
    seq: AtomicU64,
}

impl<C: Clock> StreamReporter<C> {
    pub fn new(transport: Arc<dyn EventTransport>, clock: C) -> Self {
        Self {
            transport,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, event: Event) {
        if event.kind.is_log() {
            self.transport.publish(StreamMessage::Log(event));
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let event_type = event.kind.name();
        let envelope = Envelope {
            seq,
            timestamp: iso8601(self.clock.now_ms()),
            version: 1,
            event_type,
            event,
        };
        self.transport.publish(StreamMessage::Envelope(envelope));
    }
}

/// Minimal ISO-8601 (UTC, millisecond precision) formatting so this crate
/// doesn't need to pull in a datetime crate just for timestamps on events
/// (unlike `kiln-workspace`, which already depends on `chrono` for
/// `RunningMarker`/`RunMeta` and should keep using it there).
fn iso8601(epoch_ms: u64) -> String {
    const DAYS_IN_400_YEARS: i64 = 146_097;
    let total_ms = epoch_ms as i64;
    let (days, mut ms_of_day) = (total_ms.div_euclid(86_400_000), total_ms.rem_euclid(86_400_000));
    let days = days + 719_468; // shift epoch to 0000-03-01

    let era = days.div_euclid(DAYS_IN_400_YEARS);
    let day_of_era = days.rem_euclid(DAYS_IN_400_YEARS);
    let year_of_era = (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146096) / 365;
    let year = year_of_era + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = if month <= 2 { year + 1 } else { year };

    let hour = ms_of_day / 3_600_000;
    ms_of_day -= hour * 3_600_000;
    let minute = ms_of_day / 60_000;
    ms_of_day -= minute * 60_000;
    let second = ms_of_day / 1000;
    let millis = ms_of_day - second * 1000;

    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z"
    )
}
