// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Unix-socket daemon: one pipeline running at a time, NDJSON
//! command/message framing, subscriber fan-out, and an idle auto-shutdown
//! timer. Grounded on the teacher's `daemon::listener`
//! (accept-loop-spawns-per-connection-task shape) and `daemon::event_bus`
//! (fan-out), simplified to a `tokio::sync::broadcast` channel rather than
//! a WAL-backed bus — the durable record here is a run's `meta.json`/log
//! files on disk, not the event stream itself (`spec.md` §4.9).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{JobId, SystemClock, UuidIdGen, WorkspaceId};
use kiln_engine::{
    CancelHandle, Event, EventKind, EventTransport, PipelineRunner, SchedulerError,
    SharedAggregator, StreamMessage,
};
use kiln_executor::ContainerExecutor;
use kiln_pipeline::{resolve, KitAliases, KitRegistry, PipelineDef};
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{info, warn};

use crate::protocol::{self, error_code, Command, Message, NdjsonReader, RunOptionsWire};

/// Default idle-subscriber auto-shutdown window (`spec.md` §4.12/§5).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

type Runner = PipelineRunner<UuidIdGen, SystemClock>;

/// Fanned out to every subscribed connection: either a pipeline event or
/// the daemon-level `done{success}` that isn't part of the event stream.
#[derive(Clone)]
enum Fanout {
    Stream(Arc<StreamMessage>),
    Done(bool),
}

struct BroadcastTransport {
    aggregator: SharedAggregator,
    sender: broadcast::Sender<Fanout>,
}

impl EventTransport for BroadcastTransport {
    fn publish(&self, message: StreamMessage) {
        self.aggregator.publish(message.clone());
        let _ = self.sender.send(Fanout::Stream(Arc::new(message)));
    }
}

#[derive(Clone)]
struct RunningJob {
    job_id: JobId,
    cancel: CancelHandle,
}

struct ServerState {
    running: Option<RunningJob>,
    subscribers: usize,
}

/// The daemon itself. `Arc`-shared between the accept loop, per-connection
/// tasks, and the idle-shutdown watcher.
pub struct DaemonServer {
    root: PathBuf,
    socket_path: PathBuf,
    runner: Arc<Runner>,
    aggregator: SharedAggregator,
    broadcast: broadcast::Sender<Fanout>,
    state: Mutex<ServerState>,
    activity: Notify,
    shutdown: Notify,
    idle_timeout: Duration,
}

impl DaemonServer {
    pub fn new(workdir: PathBuf, workspace_id: WorkspaceId, executor: Arc<dyn ContainerExecutor>) -> Arc<Self> {
        Self::with_idle_timeout(workdir, workspace_id, executor, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        workdir: PathBuf,
        workspace_id: WorkspaceId,
        executor: Arc<dyn ContainerExecutor>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let root = workdir.join(workspace_id.as_str());
        let socket_path = root.join("kiln.sock");
        let aggregator = SharedAggregator::new();
        let (tx, _rx) = broadcast::channel(1024);
        let transport: Arc<dyn EventTransport> = Arc::new(BroadcastTransport {
            aggregator: aggregator.clone(),
            sender: tx.clone(),
        });
        let runner = Arc::new(PipelineRunner::new(
            executor,
            UuidIdGen,
            SystemClock,
            transport,
            workdir,
        ));

        Arc::new(Self {
            root,
            socket_path,
            runner,
            aggregator,
            broadcast: tx,
            state: Mutex::new(ServerState {
                running: None,
                subscribers: 0,
            }),
            activity: Notify::new(),
            shutdown: Notify::new(),
            idle_timeout,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the listener, removing a stale socket file left behind by a
    /// crashed prior daemon.
    pub fn bind(&self) -> std::io::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        UnixListener::bind(&self.socket_path)
    }

    /// Accept connections and watch the idle timer until a shutdown is
    /// requested (by the idle timer, or by the caller dropping `self`).
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        let idle_server = self.clone();
        let idle_watcher = tokio::spawn(async move { idle_server.watch_idle().await });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move { server.handle_connection(stream).await });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("daemon shutting down");
                    break;
                }
            }
        }

        idle_watcher.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.subscribers == 0 && state.running.is_none()
    }

    async fn watch_idle(&self) {
        loop {
            tokio::select! {
                _ = self.activity.notified() => continue,
                _ = tokio::time::sleep(self.idle_timeout) => {
                    if self.is_idle() {
                        self.shutdown.notify_one();
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = NdjsonReader::new(read_half);
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();

        let mut write_half = write_half;
        let writer_task = tokio::spawn(async move {
            while let Some(message) = msg_rx.recv().await {
                if protocol::write_line(&mut write_half, &message).await.is_err() {
                    break;
                }
            }
        });

        let mut subscribed = false;
        let mut forward_task: Option<tokio::task::JoinHandle<()>> = None;

        loop {
            let value = match reader.read::<serde_json::Value>().await {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(_) => break,
            };
            self.activity.notify_one();

            let command: Command = match serde_json::from_value(value) {
                Ok(command) => command,
                Err(err) => {
                    let _ = msg_tx.send(Message::error(error_code::UNKNOWN_COMMAND, err.to_string()));
                    continue;
                }
            };

            match command {
                Command::Subscribe { logs } => {
                    if !subscribed {
                        subscribed = true;
                        self.state.lock().subscribers += 1;
                        forward_task = Some(self.spawn_forwarder(msg_tx.clone(), logs));
                    }
                    if let Some(session) = self.aggregator.latest() {
                        let _ = msg_tx.send(Message::State { session });
                    }
                }
                Command::Status => match self.aggregator.latest() {
                    Some(session) => {
                        let _ = msg_tx.send(Message::State { session });
                    }
                    None => {
                        let _ = msg_tx.send(Message::error(error_code::NOT_RUNNING, "no pipeline has run yet"));
                    }
                },
                Command::Cancel => {
                    let running = self.state.lock().running.clone();
                    match running {
                        Some(job) => job.cancel.cancel(),
                        None => {
                            let _ = msg_tx.send(Message::error(error_code::NOT_RUNNING, "no pipeline is running"));
                        }
                    }
                }
                Command::Run { pipeline, root, options } => {
                    if !subscribed {
                        subscribed = true;
                        self.state.lock().subscribers += 1;
                        forward_task = Some(self.spawn_forwarder(msg_tx.clone(), true));
                    }
                    self.clone().handle_run(pipeline, root, options, msg_tx.clone());
                }
            }
        }

        if subscribed {
            self.state.lock().subscribers -= 1;
            self.activity.notify_one();
        }
        if let Some(task) = forward_task {
            task.abort();
        }
        drop(msg_tx);
        let _ = writer_task.await;
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        msg_tx: mpsc::UnboundedSender<Message>,
        include_logs: bool,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = self.broadcast.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Fanout::Done(success)) => {
                        if msg_tx.send(Message::Done { success }).is_err() {
                            return;
                        }
                    }
                    Ok(Fanout::Stream(message)) => {
                        let event: &Event = message.event();
                        if matches!(event.kind, EventKind::StepLog { .. }) && !include_logs {
                            continue;
                        }
                        if msg_tx.send(Message::Event { event: event.clone() }).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Handle `run`: ack the job id immediately (before `PIPELINE_START`
    /// fires), then drive the pipeline in a detached task.
    fn handle_run(
        self: Arc<Self>,
        pipeline: PipelineDef,
        root: PathBuf,
        options: RunOptionsWire,
        msg_tx: mpsc::UnboundedSender<Message>,
    ) {
        let mut state = self.state.lock();
        if state.running.is_some() {
            drop(state);
            let _ = msg_tx.send(Message::error(error_code::ALREADY_RUNNING, "a pipeline is already running"));
            return;
        }
        let job_id = JobId::new(uuid::Uuid::new_v4().to_string());
        let cancel = CancelHandle::new();
        state.running = Some(RunningJob {
            job_id: job_id.clone(),
            cancel: cancel.clone(),
        });
        drop(state);
        self.activity.notify_one();

        let _ = msg_tx.send(Message::Ack { job_id: job_id.clone() });

        tokio::spawn(async move {
            let result = self.run_pipeline(pipeline, &root, options, job_id.clone(), cancel).await;
            self.state.lock().running = None;
            self.activity.notify_one();
            let success = result.is_ok();
            if let Err(err) = result {
                warn!(job = %job_id, error = %err, "pipeline run ended in error");
            }
            let _ = self.broadcast.send(Fanout::Done(success));
        });
    }

    async fn run_pipeline(
        &self,
        def: PipelineDef,
        root: &Path,
        options: RunOptionsWire,
        job_id: JobId,
        cancel: CancelHandle,
    ) -> Result<(), SchedulerError> {
        let kits = KitRegistry::new(KitAliases::default(), None);
        let pipeline = resolve(&def, root, root, &kits).map_err(|err| {
            SchedulerError::Workspace(kiln_workspace::WorkspaceError::Io {
                path: root.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()),
            })
        })?;
        let opts = options.into_run_options(job_id);
        self.runner.run_cancellable(&pipeline, opts, cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
