// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! kilnd: the per-workspace daemon binary.
//!
//! Holds the workspace lock, listens on `<workspace>/kiln.sock`, and
//! dispatches `run`/`status`/`subscribe`/`cancel` commands over NDJSON.
//! Typically spawned by a CLI the first time it needs the workspace and
//! left running until the idle-shutdown timer (`spec.md` §4.12/§5) retires
//! it; not meant to be invoked interactively.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;

use kiln_core::WorkspaceId;
use kiln_daemon::{acquire, DaemonServer};
use kiln_executor::{CliExecutor, CliExecutorConfig, ContainerExecutor};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

struct Args {
    workdir: PathBuf,
    workspace_id: WorkspaceId,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--version" | "-V" | "-v") => {
            println!("kilnd {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some("--help" | "-h" | "help") => {
            println!("kilnd {}", env!("CARGO_PKG_VERSION"));
            println!("Per-workspace pipeline daemon.");
            println!();
            println!("USAGE:");
            println!("    kilnd <workdir> <workspace-id>");
            println!();
            println!("The daemon is normally started on demand by a CLI and should not");
            println!("be invoked directly. It listens on a Unix socket under the");
            println!("workspace directory for run/status/subscribe/cancel commands.");
            std::process::exit(0);
        }
        Some(workdir) => {
            let workspace_id = args
                .next()
                .ok_or_else(|| "missing <workspace-id> argument".to_string())?;
            Ok(Args {
                workdir: PathBuf::from(workdir),
                workspace_id: WorkspaceId::new(workspace_id),
            })
        }
        None => Err("usage: kilnd <workdir> <workspace-id>".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("Usage: kilnd <workdir> <workspace-id> [--help | --version]");
            std::process::exit(1);
        }
    };

    let root = args.workdir.join(args.workspace_id.as_str());
    let _log_guard = setup_logging(&root)?;

    info!(workspace = %args.workspace_id.as_str(), "starting kilnd");

    let lock = match acquire(&root, None) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("kilnd: workspace is already locked: {err}");
            std::process::exit(1);
        }
    };

    let executor: Arc<dyn ContainerExecutor> = Arc::new(CliExecutor::new(CliExecutorConfig::default()));
    let server = DaemonServer::new(args.workdir.clone(), args.workspace_id.clone(), executor);
    let listener = server.bind()?;

    info!(socket = %server.socket_path().display(), "kilnd ready, listening");
    println!("READY");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        () = server.clone().serve(listener) => {
            info!("daemon loop exited (idle shutdown)");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
        }
    }

    drop(lock);
    info!("kilnd stopped");
    Ok(())
}

fn setup_logging(
    root: &std::path::Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, std::io::Error> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(root)?;
    let file_appender = tracing_appender::rolling::never(root, "daemon.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
