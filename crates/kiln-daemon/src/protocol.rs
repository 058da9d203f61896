// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NDJSON command/message wire protocol over the workspace's Unix-domain
//! socket. Grounded on the teacher's `daemon::protocol_wire`
//! (`ProtocolError` enum, `encode`/`decode`/`read_message`/`write_message`
//! function shape), but framed by `\n` rather than a 4-byte length prefix —
//! the one place `SPEC_FULL.md` explicitly redesigns the teacher's framing.
//! Malformed lines are skipped rather than failing the stream, per the
//! NDJSON-robustness property in `spec.md` §8.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_core::{JobId, StepId};
use kiln_engine::{Event, Force, RunOptions, SessionState};
use kiln_pipeline::PipelineDef;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// Wire-serializable mirror of [`kiln_engine::Force`] (which has no serde
/// impl of its own, since it only appears on in-process `RunOptions`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForceWire {
    #[default]
    None,
    All,
    Steps(Vec<String>),
}

impl From<ForceWire> for Force {
    fn from(wire: ForceWire) -> Self {
        match wire {
            ForceWire::None => Force::None,
            ForceWire::All => Force::All,
            ForceWire::Steps(ids) => Force::Steps(ids.into_iter().map(StepId::new).collect()),
        }
    }
}

/// Wire-serializable mirror of [`kiln_engine::RunOptions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptionsWire {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub force: ForceWire,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub env_file: Option<PathBuf>,
}

impl RunOptionsWire {
    /// Into in-process [`RunOptions`], with `skipLock: true` and `jobId`
    /// forced by the server — the daemon already holds the workspace lock
    /// and must ack a caller-visible job id before `PIPELINE_START` fires.
    pub fn into_run_options(self, job_id: JobId) -> RunOptions {
        let mut opts = RunOptions {
            workspace: self.workspace,
            force: self.force.into(),
            dry_run: self.dry_run,
            target: self.target.into_iter().map(StepId::new).collect(),
            skip_lock: true,
            job_id: Some(job_id),
            ..RunOptions::default()
        };
        if let Some(concurrency) = self.concurrency {
            opts.concurrency = concurrency;
        }
        opts
    }
}

/// A command sent client → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Run {
        pipeline: PipelineDef,
        root: PathBuf,
        #[serde(default)]
        options: RunOptionsWire,
    },
    Status,
    Subscribe {
        #[serde(default)]
        logs: bool,
    },
    Cancel,
}

/// A message sent server → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Ack { job_id: JobId },
    State { session: SessionState },
    Event { event: Event },
    Done { success: bool },
    Error { code: String, message: String },
}

impl Message {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Error codes carried by `error{code, message}`, matching `spec.md` §7/§4.12.
pub mod error_code {
    pub const ALREADY_RUNNING: &str = "ALREADY_RUNNING";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const NOT_RUNNING: &str = "NOT_RUNNING";
    pub const RESOLVE_FAILED: &str = "RESOLVE_FAILED";
    pub const RUN_FAILED: &str = "RUN_FAILED";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for the daemon")]
    Timeout,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// A line-buffering NDJSON reader. Partial lines are reassembled by
/// `tokio::io::Lines`; a line that fails to parse as `T` is skipped rather
/// than returned as an error, so one malformed frame never kills the
/// connection.
pub struct NdjsonReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> NdjsonReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Read the next well-formed `T`, skipping malformed lines and blank
    /// lines. Returns `Ok(None)` when the connection closes cleanly.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => {
                    tracing::warn!(error = %err, line = %line, "skipping malformed NDJSON line");
                    continue;
                }
            }
        }
    }
}

pub async fn write_line<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), ProtocolError> {
    let bytes = encode(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub type CommandReader<R> = NdjsonReader<R>;
pub type MessageReader<R> = NdjsonReader<R>;

/// Load dotenv-style `KEY=value` lines from a file (blank lines and `#`
/// comments ignored), matching `spec.md` §6's per-step/pipeline dotenv
/// support. Shared here since both `Command::Run`'s `envFile` and the
/// pipeline-level one go through the same parser.
pub fn load_dotenv(path: &std::path::Path) -> Result<BTreeMap<String, String>, std::io::Error> {
    let contents = std::fs::read_to_string(path)?;
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
#[path = "protocol_tests.rs"]
mod tests;
