// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin NDJSON client over the workspace socket. Grounded on the teacher's
//! `cli::client::DaemonClient` (connect / timeout-wrapped send / decode
//! pattern), simplified since a kiln workspace has exactly one daemon and
//! no version-skew auto-restart concern.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::protocol::{self, Command, Message, NdjsonReader, ProtocolError};

/// How long a single request/response round trip may take before the
/// client gives up (`spec.md` §6 leaves this to the client; the teacher's
/// default IPC timeout is 5s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon is not running at {0:?}")]
    NotRunning(PathBuf),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("daemon returned an error ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

/// A connected client session, reader and writer split so a caller can
/// drive the write half (send commands) while a separate task drains the
/// read half (the event stream), exactly as the daemon expects a single
/// long-lived connection to be used.
pub struct DaemonClient {
    socket_path: PathBuf,
    reader: NdjsonReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    /// Connect to an already-running daemon. Returns [`ClientError::NotRunning`]
    /// if the socket file doesn't exist yet — callers are responsible for
    /// starting the daemon themselves (`spec.md` doesn't specify an
    /// auto-start contract for the client).
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        if !socket_path.exists() {
            return Err(ClientError::NotRunning(socket_path.to_path_buf()));
        }
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ProtocolError::Io)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            reader: NdjsonReader::new(read_half),
            writer,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a command. Does not wait for a reply — use [`DaemonClient::recv`]
    /// to read whatever the daemon sends back (an `ack`, zero or more
    /// `event`s, and eventually `done`).
    pub async fn send(&mut self, command: &Command) -> Result<(), ClientError> {
        protocol::write_line(&mut self.writer, command)
            .await
            .map_err(Into::into)
    }

    /// Read the next message, with a bounded wait.
    pub async fn recv(&mut self) -> Result<Option<Message>, ClientError> {
        match tokio::time::timeout(DEFAULT_TIMEOUT, self.reader.read::<Message>()).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ClientError::Protocol(ProtocolError::Timeout)),
        }
    }

    /// Convenience for request/response-shaped commands (`status`,
    /// `cancel`): send, then read back the first message, rejecting on
    /// `error{}`.
    pub async fn request(&mut self, command: &Command) -> Result<Message, ClientError> {
        self.send(command).await?;
        match self.recv().await? {
            Some(Message::Error { code, message }) => Err(ClientError::Rejected { code, message }),
            Some(message) => Ok(message),
            None => Err(ClientError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
