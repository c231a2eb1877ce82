//! Integration tests for sessions over a real WebSocket relay.
//!
//! These tests start a relay on a free port and connect real peers,
//! verifying the full signal pipeline.

use std::sync::Arc;

use futures_util::SinkExt;
use scriptorium_collab::protocol::{MessagePayload, SynMessage, WorkspaceMessage};
use scriptorium_collab::relay::client::ConnectionState;
use scriptorium_collab::relay::RelayFrame;
use scriptorium_collab::{
    commit_changes, CommitOutcome, CrdtEngine, MemoryLedger, RelayConfig, RelayTransport, Replica, Role,
    SessionConfig, SessionManager, SignalRelay, Transport, WorkspaceStore, YrsEngine,
};
use scriptorium_core::{Hash, PeerId, Workspace, WorkspaceHash};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::decoder::Decode;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

/// Start a relay on a free port, return it and its URL.
async fn start_test_relay() -> (Arc<SignalRelay>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(SignalRelay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        peer_buffer: 64,
    }));
    let serving = relay.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (relay, format!("ws://127.0.0.1:{port}"))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn seeded_ledger() -> (Arc<MemoryLedger>, WorkspaceHash) {
    let ledger = Arc::new(MemoryLedger::new());
    let seed = WorkspaceStore::new(ledger.clone(), PeerId([0xEE; 32]));
    let (root, _) = seed
        .create_root_commit(YrsEngine::new().init_state().save_snapshot(), None)
        .await
        .unwrap();
    let ws = seed.create_workspace(Workspace::new("relayed"), root).await.unwrap();
    (ledger, ws)
}

async fn relayed_peer(url: &str, ledger: &Arc<MemoryLedger>, byte: u8) -> SessionManager {
    let me = PeerId([byte; 32]);
    let (transport, inbox) = RelayTransport::connect(url, me, 64).await.unwrap();
    let manager = SessionManager::new(
        me,
        Arc::new(WorkspaceStore::new(ledger.clone(), me)),
        ledger.clone(),
        Arc::new(transport),
        Arc::new(YrsEngine::new()),
        SessionConfig::default(),
    );
    manager.spawn_inbound(inbox);
    manager
}

fn append(doc: &yrs::Doc, s: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.len(&txn);
        text.insert(&mut txn, len, s);
    }
    doc.transact().encode_diff_v1(&before)
}

fn text_of(snapshot: &[u8]) -> String {
    let doc = yrs::Doc::new();
    let mut txn = doc.transact_mut();
    txn.apply_update(yrs::Update::decode_v1(snapshot).unwrap()).unwrap();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (relay, url) = start_test_relay().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
    settle().await;
    assert_eq!(relay.stats().total_connections, 1);
}

#[tokio::test]
async fn test_signal_is_delivered_with_provenance() {
    let (relay, url) = start_test_relay().await;
    let alice = PeerId([1; 32]);
    let bob = PeerId([2; 32]);
    let (a, _a_inbox) = RelayTransport::connect(&url, alice, 8).await.unwrap();
    let (_b, mut b_inbox) = RelayTransport::connect(&url, bob, 8).await.unwrap();
    settle().await;
    assert_eq!(relay.peer_count().await, 2);

    let ws = Hash::of(b"ws");
    a.send_signal(SynMessage::new(vec![bob], ws, MessagePayload::JoinWorkspace))
        .await
        .unwrap();

    let signal = timeout(Duration::from_secs(2), b_inbox.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(signal.provenance, alice);
    assert_eq!(signal.message.workspace_hash, ws);
    assert_eq!(signal.message.payload, MessagePayload::JoinWorkspace);
}

#[tokio::test]
async fn test_connection_keeps_its_first_identity() {
    let (relay, url) = start_test_relay().await;
    let first = PeerId([1; 32]);
    let bob = PeerId([2; 32]);
    let (_b, mut b_inbox) = RelayTransport::connect(&url, bob, 8).await.unwrap();
    settle().await;

    let (mut raw, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    for id in [first, PeerId([3; 32])] {
        let hello = RelayFrame::Hello { peer: id }.encode().unwrap();
        raw.send(Message::Binary(hello.into())).await.unwrap();
    }
    let message = WorkspaceMessage::new(Hash::of(b"ws"), MessagePayload::JoinWorkspace)
        .encode()
        .unwrap();
    let signal = RelayFrame::Signal { recipients: vec![bob], message }.encode().unwrap();
    raw.send(Message::Binary(signal.into())).await.unwrap();

    let delivered = timeout(Duration::from_secs(2), b_inbox.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(delivered.provenance, first);
    assert_eq!(relay.peer_count().await, 2);
}

#[tokio::test]
async fn test_signal_to_absent_peer_is_dropped() {
    let (relay, url) = start_test_relay().await;
    let (a, _inbox) = RelayTransport::connect(&url, PeerId([1; 32]), 8).await.unwrap();
    settle().await;

    a.send_signal(SynMessage::new(vec![PeerId([9; 32])], Hash::of(b"ws"), MessagePayload::JoinWorkspace))
        .await
        .unwrap();
    settle().await;
    assert_eq!(relay.stats().dropped, 1);
    assert_eq!(relay.stats().routed, 0);
}

#[tokio::test]
async fn test_sessions_converge_over_relay() {
    let (_relay, url) = start_test_relay().await;
    let (ledger, ws) = seeded_ledger().await;
    let a = relayed_peer(&url, &ledger, 0xA).await;
    let b = relayed_peer(&url, &ledger, 0xB).await;
    settle().await;

    assert_eq!(a.join_session(ws).await.unwrap(), Role::Scribe);
    assert_eq!(b.join_session(ws).await.unwrap(), Role::Folk);
    settle().await;
    assert_eq!(a.folks().await, vec![b.me()]);

    b.apply_local_change(append(&yrs::Doc::with_client_id(7), "over the wire")).await.unwrap();
    settle().await;
    assert_eq!(text_of(&a.snapshot().await.unwrap()), "over the wire");

    let CommitOutcome::Committed { .. } = commit_changes(&a).await.unwrap() else {
        panic!("scribe should commit");
    };

    b.leave_session().await.unwrap();
    settle().await;
    assert!(a.folks().await.is_empty());
}

#[tokio::test]
async fn test_send_after_relay_closes_connection() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // Accept one connection, complete the handshake, then hang up
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);
    });

    let (transport, _inbox) = RelayTransport::connect(&format!("ws://127.0.0.1:{port}"), PeerId([1; 32]), 8)
        .await
        .unwrap();
    settle().await;
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
    let result = transport
        .send_signal(SynMessage::new(vec![PeerId([2; 32])], Hash::of(b"ws"), MessagePayload::JoinWorkspace))
        .await;
    assert!(result.is_err());
}
