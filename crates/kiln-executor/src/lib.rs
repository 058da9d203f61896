// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-executor: the `ContainerExecutor` contract the scheduler calls
//! through, a CLI-backed reference implementation, and (behind
//! `test-support`) a scripted fake for other crates' tests.
//!
//! The container runtime itself is explicitly out of scope for this system
//! (see `spec.md` §1) — only the contract is specified here. [`CliExecutor`]
//! is one possible collaborator, shelling out to a `docker`/`podman`-style
//! CLI, not a mandated implementation.

pub mod cli;
pub mod contract;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use contract::{
    CacheMount, ContainerExecutor, ExecutorError, InputMount, LogLine, LogStream, NetworkMode,
    OutputMount, RunOutcome, RunRequest, SetupRequest, SourceMount,
};
pub use cli::{CliExecutor, CliExecutorConfig};

#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeExecutor, RecordedRun};
