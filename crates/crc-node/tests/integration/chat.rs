//! Client sessions: welcome and roster, chat routing, status delivery.

use crc_protocol::{ClientChat, Message, Registration, StatusCode, StatusUpdate};

use crate::harness::{TestClient, TestMesh, TestServerBuilder, QUIET, WAIT};

fn is_chat(message: &Message) -> bool {
    matches!(message, Message::ClientChat(_))
}

#[tokio::test]
async fn test_welcome_and_roster() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();

    let mut c20 = TestClient::connect(s1.addr, 20).await.unwrap();
    c20.send(&Message::ClientRegistration(Registration::new(20, 0, "bob", "")))
        .await
        .unwrap();

    assert_eq!(
        c20.recv(WAIT).await.unwrap(),
        Message::StatusUpdate(StatusUpdate::new(
            1,
            20,
            StatusCode::WELCOME,
            "Welcome to the Clemson Relay Chat network bob",
        ))
    );
    assert_eq!(
        c20.recv(WAIT).await.unwrap(),
        Message::ClientRegistration(Registration::new(10, 1, "client10", "test client"))
    );
    c20.expect_silence(QUIET).await.unwrap();

    // Client registrations are flooded to servers only
    c10.expect_silence(QUIET).await.unwrap();

    let snap = s1.snapshot();
    assert_eq!(snap.adjacent_clients, vec![10, 20]);

    s1.shutdown().await;
}

#[tokio::test]
async fn test_chat_between_local_clients() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();
    let mut c20 = TestClient::register(s1.addr, 20).await.unwrap();
    // Drop c10's roster entry from c20's queue
    c20.recv(WAIT).await.unwrap();

    let chat = Message::ClientChat(ClientChat::new(10, 20, "hello twenty"));
    c10.send(&chat).await.unwrap();

    assert_eq!(c20.recv(WAIT).await.unwrap(), chat);
    c10.expect_silence(QUIET).await.unwrap();

    s1.shutdown().await;
}

/// Chat crosses the mesh unmodified, and nothing comes back to the sender.
#[tokio::test]
async fn test_chat_across_mesh() {
    let mesh = TestMesh::line(3).await.unwrap();
    mesh.wait_converged(WAIT).await.unwrap();

    let mut c10 = TestClient::register(mesh.servers[0].addr, 10).await.unwrap();
    let mut c30 = TestClient::register(mesh.servers[2].addr, 30).await.unwrap();
    mesh.wait_all_know(10, WAIT).await.unwrap();
    mesh.wait_all_know(30, WAIT).await.unwrap();

    let chat = Message::ClientChat(ClientChat::new(10, 30, "from one end to the other"));
    c10.send(&chat).await.unwrap();
    // c30's roster may list c10 ahead of the chat
    assert_eq!(c30.recv_matching(WAIT, is_chat).await.unwrap(), chat);

    let reply = Message::ClientChat(ClientChat::new(30, 10, "got it"));
    c30.send(&reply).await.unwrap();
    assert_eq!(c10.recv(WAIT).await.unwrap(), reply);

    c10.expect_silence(QUIET).await.unwrap();
    c30.expect_silence(QUIET).await.unwrap();

    mesh.shutdown_all().await;
}

/// Exactly one unknown-ID status comes back for an unknown destination.
#[tokio::test]
async fn test_chat_to_unknown_id() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();

    c10.send(&Message::ClientChat(ClientChat::new(10, 999, "anyone there?")))
        .await
        .unwrap();

    assert_eq!(
        c10.recv(WAIT).await.unwrap(),
        Message::StatusUpdate(StatusUpdate::new(
            1,
            10,
            StatusCode::UNKNOWN_ID,
            "Unknown ID 999",
        ))
    );
    c10.expect_silence(QUIET).await.unwrap();

    s1.shutdown().await;
}

/// In a mesh the sender's own server answers, since no server knows the ID.
#[tokio::test]
async fn test_unknown_id_reply_routed_back() {
    let mesh = TestMesh::line(2).await.unwrap();
    mesh.wait_converged(WAIT).await.unwrap();

    let mut c10 = TestClient::register(mesh.servers[0].addr, 10).await.unwrap();
    mesh.wait_all_know(10, WAIT).await.unwrap();

    c10.send(&Message::ClientChat(ClientChat::new(10, 4242, "lost")))
        .await
        .unwrap();
    match c10.recv(WAIT).await.unwrap() {
        Message::StatusUpdate(status) => {
            assert_eq!(status.code, StatusCode::UNKNOWN_ID);
            assert_eq!(status.destination_id, 10);
            assert_eq!(status.content, "Unknown ID 4242");
        }
        other => panic!("expected unknown-ID status, got {other:?}"),
    }
    c10.expect_silence(QUIET).await.unwrap();

    mesh.shutdown_all().await;
}

#[tokio::test]
async fn test_chat_and_status_for_server_are_logged() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();

    c10.send(&Message::ClientChat(ClientChat::new(10, 1, "hi server")))
        .await
        .unwrap();
    c10.send(&Message::StatusUpdate(StatusUpdate::new(
        10,
        0,
        StatusCode(0x10),
        "status for anyone",
    )))
    .await
    .unwrap();

    let snap = s1
        .wait_until("logs", WAIT, |s| !s.chat_log.is_empty() && !s.status_log.is_empty())
        .await
        .unwrap();
    assert_eq!(snap.chat_log, vec!["hi server".to_string()]);
    assert_eq!(snap.status_log, vec!["status for anyone".to_string()]);
    c10.expect_silence(QUIET).await.unwrap();

    s1.shutdown().await;
}

/// A status for an unknown host is dropped without an answer.
#[tokio::test]
async fn test_status_for_unknown_host_dropped() {
    let s1 = TestServerBuilder::new(1).build().await.unwrap();
    let mut c10 = TestClient::register(s1.addr, 10).await.unwrap();

    c10.send(&Message::StatusUpdate(StatusUpdate::new(
        10,
        77,
        StatusCode(0x10),
        "nobody home",
    )))
    .await
    .unwrap();

    c10.expect_silence(QUIET).await.unwrap();
    assert!(s1.snapshot().status_log.is_empty());

    s1.shutdown().await;
}
