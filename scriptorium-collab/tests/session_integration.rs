//! Session integration tests over the loopback network.
//!
//! Verifies:
//! - Scribe election and folk admission through the ledger directory
//! - Heartbeats keep a folk in session; silence gets it declared gone
//! - A folk named gone while still connected answers and is readmitted
//! - Document changes converge through the scribe
//! - Only the scribe writes commits

use std::sync::Arc;
use std::time::Duration;

use scriptorium_collab::presence::PresenceConfig;
use scriptorium_collab::{
    commit_changes, CommitOutcome, CrdtEngine, Ledger, LoopbackNetwork, MemoryLedger, Replica, Role,
    SessionConfig, SessionEvent, SessionManager, WorkspaceStore, YrsEngine,
};
use scriptorium_core::{PeerId, Workspace, WorkspaceHash};
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn fast_presence() -> SessionConfig {
    SessionConfig {
        presence: PresenceConfig {
            scan_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            outstanding_timeout: Duration::from_secs(8),
        },
        ..SessionConfig::default()
    }
}

async fn seeded_ledger() -> (Arc<MemoryLedger>, WorkspaceHash) {
    let ledger = Arc::new(MemoryLedger::new());
    let seed = WorkspaceStore::new(ledger.clone(), PeerId([0xEE; 32]));
    let (root, _) = seed
        .create_root_commit(YrsEngine::new().init_state().save_snapshot(), None)
        .await
        .unwrap();
    let ws = seed.create_workspace(Workspace::new("manuscript"), root).await.unwrap();
    (ledger, ws)
}

async fn peer(
    ledger: &Arc<MemoryLedger>,
    net: &LoopbackNetwork,
    byte: u8,
    config: SessionConfig,
) -> SessionManager {
    let me = PeerId([byte; 32]);
    let (transport, inbox) = net.connect(me).await;
    let manager = SessionManager::new(
        me,
        Arc::new(WorkspaceStore::new(ledger.clone(), me)),
        ledger.clone(),
        Arc::new(transport),
        Arc::new(YrsEngine::new()),
        config,
    );
    manager.spawn_inbound(inbox);
    manager
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
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

async fn next_folks_gone(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<PeerId> {
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::FolksGone(gone) => return gone,
            _ => continue,
        }
    }
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_folk_in_session_until_silence() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, fast_presence()).await;
    let b = peer(&ledger, &net, 0xB, fast_presence()).await;

    assert_eq!(a.join_session(ws).await.unwrap(), Role::Scribe);
    assert_eq!(b.join_session(ws).await.unwrap(), Role::Folk);
    settle().await;
    assert_eq!(a.folks().await, vec![b.me()]);

    // Several scan cycles pass; heartbeats every 3s keep B fresh
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(a.folks().await, vec![b.me()]);

    // B drops off the network without leaving
    let mut events = a.subscribe();
    net.disconnect(&b.me()).await;
    let gone = tokio::time::timeout(Duration::from_secs(30), next_folks_gone(&mut events))
        .await
        .expect("scan should declare B gone");
    assert_eq!(gone, vec![b.me()]);
    assert!(a.folks().await.is_empty());
    assert_eq!(a.role().await, Role::Scribe);
}

#[tokio::test(start_paused = true)]
async fn test_gone_folk_is_readmitted_by_next_message() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, fast_presence()).await;
    let b = peer(&ledger, &net, 0xB, fast_presence()).await;
    a.join_session(ws).await.unwrap();
    b.join_session(ws).await.unwrap();
    settle().await;

    let mut events = a.subscribe();
    net.disconnect(&b.me()).await;
    next_folks_gone(&mut events).await;
    assert!(a.folks().await.is_empty());

    // Reattach B's identity with a fresh inbox; its next heartbeat readmits it
    let (_transport, _inbox) = net.connect(b.me()).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(a.folks().await, vec![b.me()]);
}

#[tokio::test(start_paused = true)]
async fn test_gone_list_names_each_silent_folk_once() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, fast_presence()).await;
    let b = peer(&ledger, &net, 0xB, fast_presence()).await;
    let c = peer(&ledger, &net, 0xC, fast_presence()).await;
    let d = peer(&ledger, &net, 0xD, fast_presence()).await;
    a.join_session(ws).await.unwrap();
    for folk in [&b, &c, &d] {
        folk.join_session(ws).await.unwrap();
    }
    settle().await;
    assert_eq!(a.folks().await.len(), 3);

    let mut events = a.subscribe();
    net.disconnect(&b.me()).await;
    net.disconnect(&c.me()).await;
    let gone = next_folks_gone(&mut events).await;
    assert_eq!(gone, vec![b.me(), c.me()]);

    // Later scans don't repeat them
    tokio::time::sleep(Duration::from_secs(25)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::FolksGone(_)), "unexpected {event:?}");
    }
    assert_eq!(a.folks().await, vec![d.me()]);
    assert_eq!(d.role().await, Role::Folk);
}

#[tokio::test(start_paused = true)]
async fn test_live_folk_stays_in_session_with_default_timing() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, SessionConfig::default()).await;
    let b = peer(&ledger, &net, 0xB, SessionConfig::default()).await;

    a.join_session(ws).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(b.join_session(ws).await.unwrap(), Role::Folk);

    // Scans outpace the 30s heartbeat and name B gone; B answers and stays
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(b.role().await, Role::Folk);
    assert_eq!(b.session_info().await.unwrap().scribe, a.me());
    assert_eq!(a.folks().await, vec![b.me()]);

    b.apply_local_change(append(&yrs::Doc::with_client_id(31), "still here")).await.unwrap();
    settle().await;
    assert_eq!(text_of(&a.snapshot().await.unwrap()), "still here");
}

// ─── Editing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_peers_converge_and_scribe_commits() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, SessionConfig::default()).await;
    let b = peer(&ledger, &net, 0xB, SessionConfig::default()).await;
    let c = peer(&ledger, &net, 0xC, SessionConfig::default()).await;
    a.join_session(ws).await.unwrap();
    b.join_session(ws).await.unwrap();
    c.join_session(ws).await.unwrap();
    settle().await;

    let b_doc = yrs::Doc::with_client_id(11);
    let c_doc = yrs::Doc::with_client_id(12);
    b.apply_local_change(append(&b_doc, "from b; ")).await.unwrap();
    c.apply_local_change(append(&c_doc, "from c; ")).await.unwrap();
    settle().await;

    let scribe_text = text_of(&a.snapshot().await.unwrap());
    assert!(scribe_text.contains("from b; "));
    assert!(scribe_text.contains("from c; "));
    assert_eq!(text_of(&b.snapshot().await.unwrap()), scribe_text);
    assert_eq!(text_of(&c.snapshot().await.unwrap()), scribe_text);

    let CommitOutcome::Committed { hash } = commit_changes(&a).await.unwrap() else {
        panic!("scribe should commit");
    };
    assert_eq!(ledger.get_workspace_tip(ws).await.unwrap(), hash);

    let store = WorkspaceStore::new(ledger.clone(), PeerId([0xF0; 32]));
    let commit = store.fetch_all_commits().await.unwrap().remove(&hash).unwrap();
    assert_eq!(commit.authors, vec![b.me(), c.me()]);
    assert_eq!(commit.witnesses, vec![b.me(), c.me()]);
    assert_eq!(text_of(&commit.state), scribe_text);
}

#[tokio::test]
async fn test_folk_commit_never_touches_ledger() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, SessionConfig::default()).await;
    let b = peer(&ledger, &net, 0xB, SessionConfig::default()).await;
    a.join_session(ws).await.unwrap();
    b.join_session(ws).await.unwrap();
    b.apply_local_change(append(&yrs::Doc::new(), "draft")).await.unwrap();
    settle().await;

    let writes = ledger.write_count();
    for _ in 0..3 {
        assert_eq!(commit_changes(&b).await.unwrap(), CommitOutcome::RoleMismatch);
    }
    assert_eq!(ledger.write_count(), writes);
}

#[tokio::test]
async fn test_new_session_after_scribe_leaves() {
    let (ledger, ws) = seeded_ledger().await;
    let net = LoopbackNetwork::new(64);
    let a = peer(&ledger, &net, 0xA, SessionConfig::default()).await;
    let b = peer(&ledger, &net, 0xB, SessionConfig::default()).await;
    a.join_session(ws).await.unwrap();
    b.join_session(ws).await.unwrap();
    a.apply_local_change(append(&yrs::Doc::with_client_id(21), "kept")).await.unwrap();
    commit_changes(&a).await.unwrap();
    settle().await;

    a.leave_session().await.unwrap();
    settle().await;
    assert_eq!(b.role().await, Role::NoSession);
    assert!(ledger.get_sessions(ws).await.unwrap().is_empty());

    // B starts the next session from the committed tip
    assert_eq!(b.join_session(ws).await.unwrap(), Role::Scribe);
    assert_eq!(text_of(&b.snapshot().await.unwrap()), "kept");
}
