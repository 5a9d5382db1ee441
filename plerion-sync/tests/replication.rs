//! Integration tests for room replication.
//!
//! The first group drives a `Room` and `ClientMirror`s in memory; the
//! second starts a real server on a loopback port and connects real
//! clients, verifying the full sync pipeline.

use std::sync::Arc;

use plerion_state::{filters, Key, KeyKind, Schema, Scope, Snapshot, StateResult, StateTree, Value};
use plerion_sync::{
    ClientMirror, ConnectionId, HookFactory, LifecycleState, PeerInfo, Room, RoomHook,
    SchemaFactory, ServerConfig, SyncClient, SyncEvent, SyncMessage, SyncServer,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn board_schema() -> Schema {
    let card = Schema::composite()
        .field("title", Schema::text())
        .field("position", Schema::vector())
        .build();
    Schema::composite()
        .field("cards", Schema::dictionary(KeyKind::Text, card))
        .field("card_count", Schema::int())
        .on_initialize(|tree, root| {
            let cards = tree.child(root, "cards")?;
            let count = tree.child(root, "card_count")?;
            tree.register_derived(count, Scope::SelfOnly, &[cards], move |t| {
                Ok(Value::Int(t.len(cards)? as i64))
            })?;
            Ok(())
        })
        .build()
}

fn noop() -> impl RoomHook {
    |_: &mut StateTree| -> StateResult<()> { Ok(()) }
}

fn doc(tree: &StateTree) -> serde_json::Value {
    tree.to_json(tree.root(), &filters::all).unwrap()
}

fn titled(title: &str) -> Snapshot {
    Snapshot::Composite(vec![(0, Snapshot::Value(Value::from(title)))])
}

/// Deliver one tick's output to the mirrors by connection.
fn deliver(out: &[plerion_sync::Outgoing], mirrors: &mut [(ConnectionId, &mut ClientMirror)]) {
    for msg in out {
        let decoded = SyncMessage::decode(&msg.bytes).unwrap();
        for (conn, mirror) in mirrors.iter_mut() {
            if *conn == msg.connection {
                mirror.handle(&decoded).unwrap();
            }
        }
    }
}

#[test]
fn test_room_replicates_client_edits_to_all_mirrors() {
    let mut room = Room::new("board", board_schema()).unwrap();
    let (a, b) = (ConnectionId(1), ConnectionId(2));
    let mut alice = ClientMirror::new(board_schema()).unwrap();
    let mut bob = ClientMirror::new(board_schema()).unwrap();
    room.attach(a, PeerInfo::new("Alice"));
    room.attach(b, PeerInfo::new("Bob"));

    let (out, _) = room.tick(&mut noop()).unwrap();
    deliver(&out, &mut [(a, &mut alice), (b, &mut bob)]);
    assert!(alice.is_synced() && bob.is_synced());

    // Alice edits locally and ships her delta.
    let cards = alice.tree().descend(alice.tree().root(), "cards").unwrap();
    alice.tree_mut().add_entry_with(cards, "todo", &titled("Write tests")).unwrap();
    let local = alice.take_local_delta().unwrap().unwrap();
    room.enqueue_client_delta(a, local.encode().unwrap());

    let (out, report) = room.tick(&mut noop()).unwrap();
    assert_eq!(report.inbound.applied, 1);
    assert_eq!(report.deltas, 2);
    deliver(&out, &mut [(a, &mut alice), (b, &mut bob)]);

    assert_eq!(doc(bob.tree()), doc(room.tree()));
    assert_eq!(doc(alice.tree()), doc(room.tree()));
    let count = bob.tree().descend(bob.tree().root(), "card_count").unwrap();
    assert_eq!(bob.tree().value(count).unwrap(), &Value::Int(1));
}

#[test]
fn test_late_joiner_gets_full_state_including_current_tick() {
    let mut room = Room::new("board", board_schema()).unwrap();
    let (a, b) = (ConnectionId(1), ConnectionId(2));
    let mut alice = ClientMirror::new(board_schema()).unwrap();
    room.attach(a, PeerInfo::new("Alice"));
    let (out, _) = room.tick(&mut noop()).unwrap();
    deliver(&out, &mut [(a, &mut alice)]);

    let cards = room.tree().descend(room.tree().root(), "cards").unwrap();
    room.tree_mut().add_entry_with(cards, "x", &titled("server side")).unwrap();
    let mut bob = ClientMirror::new(board_schema()).unwrap();
    room.attach(b, PeerInfo::new("Bob"));

    let (out, report) = room.tick(&mut noop()).unwrap();
    assert_eq!((report.full_states, report.deltas), (1, 1));
    deliver(&out, &mut [(a, &mut alice), (b, &mut bob)]);
    assert_eq!(doc(alice.tree()), doc(bob.tree()));
    assert_eq!(doc(bob.tree()), doc(room.tree()));
}

#[test]
fn test_reconnect_resyncs_from_full_state() {
    let mut room = Room::new("board", board_schema()).unwrap();
    let a = ConnectionId(1);
    let mut alice = ClientMirror::new(board_schema()).unwrap();
    room.attach(a, PeerInfo::new("Alice"));
    let (out, _) = room.tick(&mut noop()).unwrap();
    deliver(&out, &mut [(a, &mut alice)]);

    // Alice drops; the next delta is lost.
    alice.mark_disconnected();
    let cards = room.tree().descend(room.tree().root(), "cards").unwrap();
    room.tree_mut().add_entry(cards, "lost").unwrap();
    let (out, _) = room.tick(&mut noop()).unwrap();
    deliver(&out, &mut [(a, &mut alice)]);
    let mirror_cards = alice.tree().descend(alice.tree().root(), "cards").unwrap();
    assert!(!alice.tree().contains_key(mirror_cards, &Key::from("lost")).unwrap());

    // Edits made while offline are superseded by the snapshot.
    alice.tree_mut().add_entry(mirror_cards, "offline").unwrap();

    room.request_full(a);
    let (out, _) = room.tick(&mut noop()).unwrap();
    deliver(&out, &mut [(a, &mut alice)]);
    assert_eq!(doc(alice.tree()), doc(room.tree()));
    assert!(alice.take_local_delta().unwrap().is_none());
}

#[test]
fn test_hook_output_is_replicated() {
    let mut room = Room::new("board", board_schema()).unwrap();
    let a = ConnectionId(1);
    let mut alice = ClientMirror::new(board_schema()).unwrap();
    room.attach(a, PeerInfo::new("Alice"));

    // Authoritative rule: every card title is trimmed.
    let mut trim = |tree: &mut StateTree| -> StateResult<()> {
        let cards = tree.descend(tree.root(), "cards")?;
        for (_, card) in tree.entries(cards)? {
            let title = tree.child(card, "title")?;
            let trimmed = tree.value(title)?.as_text().unwrap_or("").trim().to_string();
            tree.set(title, trimmed)?;
        }
        Ok(())
    };
    let (out, _) = room.tick(&mut trim).unwrap();
    deliver(&out, &mut [(a, &mut alice)]);

    let cards = alice.tree().descend(alice.tree().root(), "cards").unwrap();
    alice.tree_mut().add_entry_with(cards, "c", &titled("  padded  ")).unwrap();
    let local = alice.take_local_delta().unwrap().unwrap();
    room.enqueue_client_delta(a, local.encode().unwrap());
    let (out, _) = room.tick(&mut trim).unwrap();
    deliver(&out, &mut [(a, &mut alice)]);

    let card = alice.tree().entry(cards, &Key::from("c")).unwrap();
    let title = alice.tree().child(card, "title").unwrap();
    assert_eq!(alice.tree().value(title).unwrap(), &Value::from("padded"));
}

// ── End to end over WebSocket ────────────────────────────────

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server(max_peers_per_room: usize) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        tick_interval_ms: 10,
        max_peers_per_room,
        ..ServerConfig::default()
    };
    let schema: SchemaFactory = Arc::new(|_| board_schema());
    let hooks: HookFactory = Arc::new(|_| Box::new(noop()) as Box<dyn RoomHook>);
    let server = SyncServer::new(config, schema, hooks);
    let listener = tokio::net::TcpListener::bind(server.bind_addr()).await.unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    port
}

/// Apply events to `mirror` until `done` holds or nothing arrives in time.
async fn pump_until(
    events: &mut mpsc::Receiver<SyncEvent>,
    mirror: &mut ClientMirror,
    done: impl Fn(&ClientMirror) -> bool,
) -> bool {
    while !done(mirror) {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::FullState { tick, snapshot })) => {
                mirror.apply_full(&snapshot, tick).unwrap()
            }
            Ok(Some(SyncEvent::Delta { tick, delta })) => {
                mirror.apply_delta(&delta, tick).unwrap();
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return false,
        }
    }
    true
}

fn has_card(mirror: &ClientMirror, key: &str) -> bool {
    let tree = mirror.tree();
    let cards = tree.descend(tree.root(), "cards").unwrap();
    tree.contains_key(cards, &Key::from(key)).unwrap()
}

#[tokio::test]
async fn test_edit_reaches_other_client() {
    let port = start_test_server(10).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = SyncClient::new(PeerInfo::new("Alice"), "board", &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    let mut alice_mirror = ClientMirror::new(board_schema()).unwrap();
    alice.connect().await.unwrap();
    assert_eq!(alice.connection_state(), LifecycleState::Running);
    assert!(pump_until(&mut alice_events, &mut alice_mirror, ClientMirror::is_synced).await);

    let mut bob = SyncClient::new(PeerInfo::new("Bob"), "board", &url);
    let mut bob_events = bob.take_event_rx().unwrap();
    let mut bob_mirror = ClientMirror::new(board_schema()).unwrap();
    bob.connect().await.unwrap();
    assert!(pump_until(&mut bob_events, &mut bob_mirror, ClientMirror::is_synced).await);

    let cards = alice_mirror.tree().descend(alice_mirror.tree().root(), "cards").unwrap();
    alice_mirror
        .tree_mut()
        .add_entry_with(cards, "hello", &titled("from Alice"))
        .unwrap();
    let local = alice_mirror.take_local_delta().unwrap().unwrap();
    assert!(alice.send_delta(&local).await.unwrap());

    assert!(
        pump_until(&mut bob_events, &mut bob_mirror, |m| has_card(m, "hello")).await,
        "Bob should receive Alice's card"
    );
    assert!(pump_until(&mut alice_events, &mut alice_mirror, |m| has_card(m, "hello")).await);
    assert_eq!(doc(alice_mirror.tree()), doc(bob_mirror.tree()));
}

#[tokio::test]
async fn test_peer_join_and_leave_notifications() {
    let port = start_test_server(10).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = SyncClient::new(PeerInfo::new("Alice"), "board", &url);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();

    let bob_info = PeerInfo::new("Bob");
    let bob = SyncClient::new(bob_info.clone(), "board", &url);
    bob.connect().await.unwrap();

    let mut joined = false;
    let mut left = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !(joined && left) && tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Some(SyncEvent::PeerJoined(info))) if info.peer_id == bob_info.peer_id => {
                joined = true;
                bob.disconnect().await.unwrap();
                assert_eq!(bob.connection_state(), LifecycleState::Idle);
            }
            Ok(Some(SyncEvent::PeerLeft(id))) if id == bob_info.peer_id => left = true,
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => break,
        }
    }
    assert!(joined, "Alice should see Bob join");
    assert!(left, "Alice should see Bob leave");
}

#[tokio::test]
async fn test_full_room_refuses_join() {
    let port = start_test_server(1).await;
    let url = format!("ws://127.0.0.1:{port}");

    let first = SyncClient::new(PeerInfo::new("first"), "tiny", &url);
    first.connect().await.unwrap();
    // Let the first join land before the second arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = SyncClient::new(PeerInfo::new("second"), "tiny", &url);
    let mut events = second.take_event_rx().unwrap();
    second.connect().await.unwrap();

    let mut refused = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), events.recv()).await {
        if let SyncEvent::Error(reason) = event {
            assert!(reason.contains("full"), "unexpected reason {reason}");
            refused = true;
            break;
        }
    }
    assert!(refused, "second client should be refused");
}

#[tokio::test]
async fn test_reconnect_gets_fresh_full_state() {
    let port = start_test_server(10).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::new(PeerInfo::new("Alice"), "board", &url);
    let mut events = client.take_event_rx().unwrap();
    let mut mirror = ClientMirror::new(board_schema()).unwrap();
    client.connect().await.unwrap();
    assert!(pump_until(&mut events, &mut mirror, ClientMirror::is_synced).await);

    // Reconnecting without an explicit disconnect closes the old
    // connection first, reported before the new one comes up.
    mirror.mark_disconnected();
    client.connect().await.unwrap();
    let mut order = Vec::new();
    while !mirror.is_synced() {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
            SyncEvent::Disconnected => order.push("disconnected"),
            SyncEvent::Connected => order.push("connected"),
            SyncEvent::FullState { tick, snapshot } => {
                mirror.apply_full(&snapshot, tick).unwrap();
                order.push("full");
            }
            _ => {}
        }
    }
    assert_eq!(order, vec!["disconnected", "connected", "full"]);
    assert_eq!(client.connection_state(), LifecycleState::Running);
}
