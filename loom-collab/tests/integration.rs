//! Integration tests for the channel client against a real server.
//!
//! Each test binds a server on an ephemeral port and connects real
//! clients over WebSocket.

use loom_collab::channel::{ChannelCallbacks, ChannelClient, ChannelConfig, ConnectionState, RemoteChange};
use loom_collab::protocol::{MetadataUpdate, PushOp};
use loom_collab::server::{ServerConfig, SyncServer};
use loom_core::{DocumentPayload, NodeKind, SharedDocument};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(3);

async fn start_server_on(listener: TcpListener, config: ServerConfig) -> Arc<SyncServer> {
    let server = Arc::new(SyncServer::new(config).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    server
}

/// Start an in-memory server on a free port; returns it with its URL.
async fn start_server() -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (start_server_on(listener, ServerConfig::default()).await, url)
}

async fn connected_client(url: &str) -> ChannelClient {
    let client = ChannelClient::new(ChannelConfig::for_testing(url));
    assert!(client.connect().await, "client should connect to {url}");
    client
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connected,
    Disconnected,
    Update(RemoteChange),
    PeerJoined(u32),
    PeerLeft(u32),
    Deleted,
    SaveRequested,
}

/// Route every channel callback into a queue.
fn record(client: &ChannelClient) -> mpsc::UnboundedReceiver<Seen> {
    let (tx, rx) = mpsc::unbounded_channel();
    let t = |tx: &mpsc::UnboundedSender<Seen>| tx.clone();
    client.set_callbacks(
        ChannelCallbacks::default()
            .with_connect({
                let tx = t(&tx);
                move || {
                    let _ = tx.send(Seen::Connected);
                }
            })
            .with_disconnect({
                let tx = t(&tx);
                move || {
                    let _ = tx.send(Seen::Disconnected);
                }
            })
            .with_update({
                let tx = t(&tx);
                move |change| {
                    let _ = tx.send(Seen::Update(change));
                }
            })
            .with_peer_joined({
                let tx = t(&tx);
                move |n| {
                    let _ = tx.send(Seen::PeerJoined(n));
                }
            })
            .with_peer_left({
                let tx = t(&tx);
                move |n| {
                    let _ = tx.send(Seen::PeerLeft(n));
                }
            })
            .with_document_deleted({
                let tx = t(&tx);
                move || {
                    let _ = tx.send(Seen::Deleted);
                }
            })
            .with_save_requested({
                let tx = t(&tx);
                move || {
                    let _ = tx.send(Seen::SaveRequested);
                }
            }),
    );
    rx
}

/// Wait for the first event matching `pred`, skipping others.
async fn expect(rx: &mut mpsc::UnboundedReceiver<Seen>, pred: impl Fn(&Seen) -> bool) -> Seen {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(seen) if pred(&seen) => return seen,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

fn payload_json(kinds: &[NodeKind]) -> Vec<u8> {
    let mut payload = DocumentPayload::new();
    for kind in kinds {
        payload.add_node(*kind, None, None);
    }
    serde_json::to_vec(&payload).unwrap()
}

// ─── Connection & subscription ───────────────────────────────────────────────

#[tokio::test]
async fn test_connect_and_join() {
    let (server, url) = start_server().await;
    let client = connected_client(&url).await;

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(client.join_document("doc-a").await);
    assert_eq!(client.active_document().as_deref(), Some("doc-a"));
    assert_eq!(server.peer_count("doc-a").await, 1);

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test]
async fn test_switching_documents_leaves_previous() {
    let (server, url) = start_server().await;
    let client = connected_client(&url).await;

    assert!(client.join_document("first").await);
    assert!(client.join_document("second").await);

    assert!(eventually(|| client.active_document().as_deref() == Some("second")).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(server.peer_count("first").await, 0);
    assert_eq!(server.peer_count("second").await, 1);
}

#[tokio::test]
async fn test_leave_document_releases_room() {
    let (server, url) = start_server().await;
    let client = connected_client(&url).await;

    assert!(client.join_document("doc").await);
    client.leave_document().await;
    assert_eq!(client.active_document(), None);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.peer_count("doc").await, 0);
    assert!(!client.send_change(payload_json(&[NodeKind::Note])).await);
}

#[tokio::test]
async fn test_room_full_rejects_join() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    };
    let server = start_server_on(listener, config).await;

    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    assert!(a.join_document("tiny").await);
    assert!(!b.join_document("tiny").await);
    assert_eq!(b.active_document(), None);
    assert_eq!(server.peer_count("tiny").await, 1);
    assert_eq!(server.stats().await.rejected_requests, 1);
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_change_reaches_other_peer_only() {
    let (_server, url) = start_server().await;
    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    let mut a_seen = record(&a);
    let mut b_seen = record(&b);

    assert!(a.join_document("shared").await);
    assert!(b.join_document("shared").await);

    let change = payload_json(&[NodeKind::Agent, NodeKind::Tool]);
    assert!(a.send_change(change.clone()).await);

    let Seen::Update(remote) = expect(&mut b_seen, |s| matches!(s, Seen::Update(_))).await else {
        unreachable!()
    };
    assert_eq!(remote.doc_id, "shared");
    assert_eq!(remote.peer_id, a.peer_id());
    assert_eq!(remote.change, change);

    sleep(Duration::from_millis(100)).await;
    while let Ok(seen) = a_seen.try_recv() {
        assert!(!matches!(seen, Seen::Update(_)), "originator received its own change");
    }
}

#[tokio::test]
async fn test_change_stays_in_its_document() {
    let (_server, url) = start_server().await;
    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    let mut b_seen = record(&b);

    assert!(a.join_document("one").await);
    assert!(b.join_document("two").await);
    assert!(a.send_change(payload_json(&[NodeKind::Memory])).await);

    sleep(Duration::from_millis(150)).await;
    while let Ok(seen) = b_seen.try_recv() {
        assert!(!matches!(seen, Seen::Update(_)), "change leaked across documents");
    }
}

#[tokio::test]
async fn test_peer_counts_follow_joins_and_leaves() {
    let (_server, url) = start_server().await;
    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    let mut a_seen = record(&a);

    assert!(a.join_document("room").await);
    assert!(b.join_document("room").await);
    assert_eq!(expect(&mut a_seen, |s| matches!(s, Seen::PeerJoined(_))).await, Seen::PeerJoined(2));

    b.leave_document().await;
    assert_eq!(expect(&mut a_seen, |s| matches!(s, Seen::PeerLeft(_))).await, Seen::PeerLeft(1));
}

#[tokio::test]
async fn test_disconnecting_peer_counts_as_leave() {
    let (server, url) = start_server().await;
    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    let mut a_seen = record(&a);

    assert!(a.join_document("room").await);
    assert!(b.join_document("room").await);
    b.disconnect();

    assert_eq!(expect(&mut a_seen, |s| matches!(s, Seen::PeerLeft(_))).await, Seen::PeerLeft(1));
    assert_eq!(server.peer_count("room").await, 1);
}

// ─── Acknowledged requests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_push_operations_roundtrip() {
    let (server, url) = start_server().await;
    let client = connected_client(&url).await;

    let created = client
        .request(
            "graph",
            PushOp::Create {
                title: "Pipeline".into(),
                description: Some("demo".into()),
            },
        )
        .await
        .unwrap()
        .unwrap();
    let created: SharedDocument = serde_json::from_slice(&created).unwrap();
    assert_eq!(created.title, "Pipeline");
    assert_eq!(created.description, "demo");

    let mut payload = DocumentPayload::new();
    payload.add_node(NodeKind::Trigger, None, None);
    let nodes = serde_json::to_vec(&payload.nodes).unwrap();
    client.request("graph", PushOp::UpdateNodes(nodes)).await.unwrap();

    client
        .request(
            "graph",
            PushOp::UpdateMetadata(MetadataUpdate {
                title: Some("Renamed".into()),
                description: None,
            }),
        )
        .await
        .unwrap();

    let state = client.request("graph", PushOp::Get).await.unwrap().unwrap();
    let state: SharedDocument = serde_json::from_slice(&state).unwrap();
    assert_eq!(state.title, "Renamed");
    assert_eq!(state.description, "demo");
    assert_eq!(state.payload.nodes.len(), 1);

    assert_eq!(server.document("graph").await.unwrap().payload.nodes.len(), 1);
}

#[tokio::test]
async fn test_get_unknown_document_is_rejected() {
    let (_server, url) = start_server().await;
    let client = connected_client(&url).await;

    let err = client.request("nope", PushOp::Get).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_load_fans_out_to_subscribers() {
    let (_server, url) = start_server().await;
    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    let mut b_seen = record(&b);

    assert!(a.join_document("doc").await);
    assert!(b.join_document("doc").await);

    let json = payload_json(&[NodeKind::Input, NodeKind::Output]);
    a.request("doc", PushOp::Load(json)).await.unwrap();

    let Seen::Update(remote) = expect(&mut b_seen, |s| matches!(s, Seen::Update(_))).await else {
        unreachable!()
    };
    let payload: DocumentPayload = serde_json::from_slice(&remote.change).unwrap();
    assert_eq!(payload.nodes.len(), 2);
}

#[tokio::test]
async fn test_notify_deleted_reaches_subscribers() {
    let (server, url) = start_server().await;
    let a = connected_client(&url).await;
    let b = connected_client(&url).await;
    let mut b_seen = record(&b);

    assert!(a.join_document("doomed").await);
    assert!(b.join_document("doomed").await);
    assert!(a.send_change(payload_json(&[NodeKind::Agent])).await);
    assert!(server.document("doomed").await.is_some());

    assert!(a.notify_deleted("doomed").await);
    expect(&mut b_seen, |s| *s == Seen::Deleted).await;
    assert!(server.document("doomed").await.is_none());
}

#[tokio::test]
async fn test_server_save_request_reaches_members() {
    let (server, url) = start_server().await;
    let client = connected_client(&url).await;
    let mut seen = record(&client);

    assert!(client.join_document("doc").await);
    assert!(server.request_save("doc").await >= 1);
    expect(&mut seen, |s| *s == Seen::SaveRequested).await;

    assert_eq!(server.request_save("elsewhere").await, 0);
}

// ─── Reconnection ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_restores_subscription() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let first = start_server_on(listener, ServerConfig::default()).await;

    let client = connected_client(&url).await;
    let mut seen = record(&client);
    assert!(client.join_document("sticky").await);

    first.shutdown();
    expect(&mut seen, |s| *s == Seen::Disconnected).await;
    assert_eq!(client.active_document().as_deref(), Some("sticky"));

    sleep(Duration::from_millis(50)).await;
    let listener = TcpListener::bind(addr).await.unwrap();
    let second = start_server_on(listener, ServerConfig::default()).await;

    expect(&mut seen, |s| *s == Seen::Connected).await;
    assert!(client.is_connected());
    assert_eq!(client.reconnect_attempts(), 0);

    let mut rejoined = false;
    for _ in 0..100 {
        if second.peer_count("sticky").await == 1 {
            rejoined = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(rejoined, "subscription not restored after reconnect");
}

#[tokio::test]
async fn test_manual_disconnect_does_not_reconnect() {
    let (_server, url) = start_server().await;
    let client = connected_client(&url).await;
    assert!(client.join_document("doc").await);

    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_retry_delay(), None);

    assert!(client.connect().await);
    assert!(eventually(|| client.active_document().as_deref() == Some("doc")).await);
}

#[tokio::test]
async fn test_gives_up_on_dead_server() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ChannelConfig {
        max_attempts: 2,
        ..ChannelConfig::for_testing(format!("ws://127.0.0.1:{port}"))
    };
    let client = ChannelClient::new(config);

    assert!(!client.connect().await);
    assert_eq!(client.connection_state(), ConnectionState::Reconnecting);
    assert_eq!(client.pending_retry_delay(), Some(Duration::from_millis(50)));

    assert!(
        eventually(|| client.reconnect_attempts() == 2 && client.pending_retry_delay().is_none())
            .await
    );
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!client.join_document("doc").await);
}
