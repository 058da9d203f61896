// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use kiln_core::JobId;
use tokio::net::UnixListener;

#[tokio::test]
async fn connect_fails_when_socket_is_absent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("kiln.sock");

    let err = DaemonClient::connect(&socket_path).await.expect_err("should fail");
    assert!(matches!(err, ClientError::NotRunning(path) if path == socket_path));
}

#[tokio::test]
async fn send_then_recv_round_trips_an_ack() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("kiln.sock");
    let listener = UnixListener::bind(&socket_path).expect("bind");

    let server = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = NdjsonReader::new(read_half);
        let command: Command = reader.read().await.expect("read").expect("present");
        assert!(matches!(command, Command::Status));
        protocol::write_line(
            &mut write_half,
            &Message::Ack {
                job_id: JobId::new("job-1"),
            },
        )
        .await
        .expect("write ack");
    });

    let mut client = DaemonClient::connect(&socket_path).await.expect("connect");
    client.send(&Command::Status).await.expect("send");
    let message = client.recv().await.expect("recv").expect("present");
    assert!(matches!(message, Message::Ack { job_id } if job_id == JobId::new("job-1")));

    server.await.expect("server task");
}

#[tokio::test]
async fn request_turns_an_error_message_into_a_rejected_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("kiln.sock");
    let listener = UnixListener::bind(&socket_path).expect("bind");

    let server = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = NdjsonReader::new(read_half);
        let _command: Command = reader.read().await.expect("read").expect("present");
        protocol::write_line(
            &mut write_half,
            &Message::error(crate::protocol::error_code::NOT_RUNNING, "no pipeline is running"),
        )
        .await
        .expect("write error");
    });

    let mut client = DaemonClient::connect(&socket_path).await.expect("connect");
    let err = client.request(&Command::Cancel).await.expect_err("rejected");
    assert!(matches!(err, ClientError::Rejected { code, .. } if code == "NOT_RUNNING"));

    server.await.expect("server task");
}
