//! Startup, shutdown and malformed input.

use std::time::Duration;

use bytes::BytesMut;
use crc_node::{NodeSnapshot, Server};
use crc_protocol::{ClientChat, Message, MessageCodec, Registration};
use tokio_util::codec::Encoder;

use crate::harness::{TestClient, TestServerBuilder, QUIET, WAIT};

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();
    let addr = s1.addr;

    let (mut server, snapshot) = s1.shutdown().await;
    assert_eq!(server.registered_sockets(), 0);
    assert_eq!(snapshot.connections, 0);
    assert!(snapshot.knows(10));

    // Idempotent
    server.shutdown();
    assert_eq!(server.registered_sockets(), 0);

    c10.expect_closed(WAIT).await.unwrap();
    assert!(TestClient::connect(addr, 11).await.is_err());
}

/// Idle poll ticks publish nothing.
#[tokio::test]
async fn test_idle_node_publishes_nothing() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let _c10 = TestClient::register(s1.addr, 10).await.unwrap();
    s1.wait_knows(10, WAIT).await.unwrap();

    let mut rx = s1.subscribe();
    let _ = rx.borrow_and_update();
    tokio::time::sleep(QUIET).await;
    assert!(!rx.has_changed().unwrap());

    s1.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_before_run() {
    let mut server = Server::bind(TestServerBuilder::new(1).config()).await.unwrap();
    assert_eq!(server.registered_sockets(), 1);
    server.shutdown();
    assert_eq!(server.registered_sockets(), 0);
    server.shutdown();
    assert_eq!(server.registered_sockets(), 0);
}

/// An unknown message type closes that connection only.
#[tokio::test]
async fn test_framing_error_closes_connection() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();
    let mut c20 = TestClient::register(s1.addr, 20).await.unwrap();
    c20.recv(WAIT).await.unwrap();

    c10.send_raw(&[0x55, 0, 0, 0, 1]).await.unwrap();
    c10.expect_closed(WAIT).await.unwrap();
    s1.wait_forgets(10, WAIT).await.unwrap();

    // The rest of the node is unaffected
    c20.send(&Message::ClientChat(ClientChat::new(20, 1, "still here")))
        .await
        .unwrap();
    let snap = s1
        .wait_until("chat", WAIT, |s| !s.chat_log.is_empty())
        .await
        .unwrap();
    assert_eq!(snap.adjacent_clients, vec![20]);
    assert_eq!(snap.connections, 1);

    s1.shutdown().await;
}

/// Oversized length fields are rejected before anything is allocated.
#[tokio::test]
async fn test_oversized_field_closes_connection() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();

    // ClientChat header declaring ~4 GiB of content
    let mut frame = vec![0x81];
    frame.extend_from_slice(&10u32.to_be_bytes());
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(&u32::MAX.to_be_bytes());
    c10.send_raw(&frame).await.unwrap();

    c10.expect_closed(WAIT).await.unwrap();
    s1.wait_forgets(10, WAIT).await.unwrap();

    s1.shutdown().await;
}

/// A message split across writes is reassembled.
#[tokio::test]
async fn test_partial_writes_reassembled() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut client = TestClient::connect(s1.addr, 10).await.unwrap();

    let mut bytes = BytesMut::new();
    MessageCodec
        .encode(
            &Message::ClientRegistration(Registration::new(10, 0, "slow", "typist")),
            &mut bytes,
        )
        .unwrap();
    for chunk in bytes.chunks(3) {
        client.send_raw(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let snap = s1.wait_knows(10, WAIT).await.unwrap();
    assert_eq!(snap.hosts[&10].name, "slow");
    assert!(matches!(client.recv(WAIT).await.unwrap(), Message::StatusUpdate(_)));
    client.expect_silence(QUIET).await.unwrap();

    s1.shutdown().await;
}

#[tokio::test]
async fn test_dial_failure_is_fatal() {
    // Grab a free port, then close it so nothing is listening there
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let result = TestServerBuilder::new(2).connect_to(addr).build().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let cfg = TestServerBuilder::new(0).config();
    assert!(Server::bind(cfg).await.is_err());
}

#[tokio::test]
async fn test_snapshot_written_on_exit() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let _c10 = TestClient::register(s1.addr, 10).await.unwrap();
    s1.wait_knows(10, WAIT).await.unwrap();
    let (_, snapshot) = s1.shutdown().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    snapshot.write_to(&path).unwrap();
    let loaded = NodeSnapshot::read_from(&path).unwrap();
    assert_eq!(loaded, snapshot);
    assert_eq!(loaded.hosts[&10].name, "client10");
}
