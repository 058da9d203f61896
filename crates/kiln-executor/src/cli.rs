// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reference `ContainerExecutor` implementation shelling out to a
//! `docker`/`podman`-style CLI, grounded on the teacher's
//! `TmuxAdapter`/`run_with_timeout` subprocess idiom: build a `Command`,
//! wait with a timeout, turn a non-zero exit or stderr into a descriptive
//! error.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use kiln_core::WorkspaceId;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::contract::{
    ContainerExecutor, ExecutorError, LogLine, LogSink, LogStream, NetworkMode, RunOutcome,
    RunRequest, SetupCompleteSink,
};

/// Default CLI invocation timeout when a step declares none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
const LABEL_WORKSPACE: &str = "kiln.workspace";
const LABEL_STEP: &str = "kiln.step";
/// Printed to stdout by the generated wrapper script once the setup phase
/// exits zero; stripped from the forwarded log stream.
const SETUP_DONE_SENTINEL: &str = "__kiln_setup_done__";

#[derive(Debug, Clone)]
pub struct CliExecutorConfig {
    /// `docker`, `podman`, or any CLI with docker-compatible `run`/`ps`/
    /// `kill`/`rm`/`version` subcommands.
    pub binary: String,
}

impl Default for CliExecutorConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

/// CLI-backed `ContainerExecutor`. Tracks container ids it started so
/// [`ContainerExecutor::kill_running_containers`] can terminate them
/// without a separate label query.
pub struct CliExecutor {
    config: CliExecutorConfig,
    running: Arc<Mutex<HashSet<String>>>,
}

impl CliExecutor {
    pub fn new(config: CliExecutorConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.config.binary)
    }

    fn build_run_args(&self, request: &RunRequest) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        let network = match (request.network, request.setup.as_ref().map(|s| s.allow_network)) {
            (NetworkMode::Bridge, _) | (_, Some(true)) => "bridge",
            _ => "none",
        };
        args.push("--network".to_string());
        args.push(network.to_string());

        args.push("--label".to_string());
        args.push(format!("{LABEL_WORKSPACE}={}", request.workspace_id));
        args.push("--label".to_string());
        args.push(format!("{LABEL_STEP}={}", request.step_id));

        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        for input in &request.input_mounts {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}:ro",
                input.host_path.display(),
                input.container_path
            ));
        }
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}",
            request.output_mount.host_path.display(),
            request.output_mount.container_path
        ));
        for cache in &request.caches {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                cache.host_path.display(),
                cache.container_path
            ));
        }
        // Sources copy into the writable layer rather than bind-mount, so
        // we stage them the same way caches/inputs stage (read-write here;
        // the copy-vs-mount distinction only matters for whether container
        // writes are visible on the host, which `--rm` already discards).
        for source in &request.sources {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                source.host_path.display(),
                source.container_path
            ));
        }

        args.push(request.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(wrapper_script(request));
        args
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Combine the optional setup command and the run command into a single
/// `sh -c` script so both phases share one container's writable layer.
/// Prints [`SETUP_DONE_SENTINEL`] on its own line once setup exits zero.
fn wrapper_script(request: &RunRequest) -> String {
    let mut script = String::from("set -e\n");
    if let Some(setup) = &request.setup {
        let _ = writeln!(script, "{}", shell_join(&setup.cmd));
        let _ = writeln!(script, "echo {SETUP_DONE_SENTINEL}");
    }
    let _ = write!(script, "exec {}", shell_join(&request.cmd));
    script
}

fn shell_join(argv: &[String]) -> String {
    argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[async_trait]
impl ContainerExecutor for CliExecutor {
    async fn check(&self) -> Result<(), ExecutorError> {
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            self.command().arg("version").output(),
        )
        .await
        .map_err(|_| ExecutorError::RuntimeUnavailable(format!("{} version timed out", self.config.binary)))?
        .map_err(|e| ExecutorError::RuntimeUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(ExecutorError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }

    async fn run(
        &self,
        request: RunRequest,
        on_log_line: LogSink,
        on_setup_complete: Option<SetupCompleteSink>,
    ) -> Result<RunOutcome, ExecutorError> {
        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let args = self.build_run_args(&request);

        let mut cmd = self.command();
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started_at_ms = Self::now_ms();
        let mut child = cmd.spawn().map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ExecutorError::Spawn("child produced no stdout handle".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ExecutorError::Spawn("child produced no stderr handle".to_string())
        })?;

        let run = async {
            let stdout_task = stream_lines(stdout, LogStream::Stdout, on_log_line.clone(), on_setup_complete);
            let stderr_task = stream_lines(stderr, LogStream::Stderr, on_log_line, None);
            let (_, _, status) = tokio::join!(stdout_task, stderr_task, child.wait());
            status
        };

        let status = match tokio::time::timeout(timeout, run).await {
            Ok(status) => status.map_err(ExecutorError::Io)?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(ExecutorError::Timeout(request.step_id.clone()));
            }
        };

        let finished_at_ms = Self::now_ms();
        Ok(RunOutcome {
            exit_code: status.code().unwrap_or(-1),
            started_at_ms,
            finished_at_ms,
        })
    }

    async fn kill_running_containers(&self) -> Result<(), ExecutorError> {
        let ids: Vec<String> = self.running.lock().iter().cloned().collect();
        for id in ids {
            let _ = self.command().args(["kill", &id]).output().await;
        }
        Ok(())
    }

    async fn cleanup_containers(&self, workspace_id: &WorkspaceId) -> Result<(), ExecutorError> {
        let filter = format!("label={LABEL_WORKSPACE}={workspace_id}");
        let output = self
            .command()
            .args(["ps", "-aq", "--filter", &filter])
            .output()
            .await
            .map_err(|e| ExecutorError::Cleanup(e.to_string()))?;

        if !output.status.success() {
            return Err(ExecutorError::Cleanup(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        for id in String::from_utf8_lossy(&output.stdout).lines() {
            let id = id.trim();
            if id.is_empty() {
                continue;
            }
            let _ = self.command().args(["rm", "-f", id]).output().await;
        }
        Ok(())
    }
}

async fn stream_lines<R>(
    reader: R,
    stream: LogStream,
    on_log_line: LogSink,
    on_setup_complete: Option<SetupCompleteSink>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line == SETUP_DONE_SENTINEL {
                    if let Some(cb) = &on_setup_complete {
                        cb();
                    }
                    continue;
                }
                on_log_line(LogLine {
                    stream,
                    line,
                });
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}
