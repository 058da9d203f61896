// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-daemon: the single-writer-per-workspace lock (`daemon.json`), the
//! NDJSON command/message wire protocol, and the Unix-socket server and
//! client built on top of them.

pub mod client;
pub mod lock;
pub mod protocol;
pub mod server;

pub use client::{ClientError, DaemonClient, DEFAULT_TIMEOUT};
pub use lock::{acquire, check, LockError, LockInfo, WorkspaceLockGuard};
pub use protocol::{
    encode, error_code, load_dotenv, write_line, Command, CommandReader, ForceWire, Message,
    MessageReader, NdjsonReader, ProtocolError, RunOptionsWire,
};
pub use server::{DaemonServer, DEFAULT_IDLE_TIMEOUT};
