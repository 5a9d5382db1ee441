//! WebSocket sync server with room-based state replication.
//!
//! Architecture:
//! ```text
//! Client A ──┐  Delta / RequestFull          ┌── tick task (interval)
//!             ├──► Room (room_id) inbound ───►│   Room::tick(hook)
//! Client B ──┘                                └──┬────────────────
//!                                                │ Outgoing{conn, bytes}
//!                          ┌─────────────────────┼──────────┐
//!                          ▼                     ▼          ▼
//!                   outbound[A] (mpsc)    outbound[B]   outbound[C]
//!                          │                     │          │
//!                       Client A             Client B    Client C
//! ```
//!
//! Each room maintains:
//! - An authoritative `StateTree` built from the schema factory
//! - A hook from the hook factory, run on every tick
//! - A tick task that fans its output into per-connection channels
//!
//! A connection whose channel is full when a tick's message is due is
//! marked as needing a full snapshot; it catches up on a later tick
//! instead of stalling the room. Empty rooms are removed by their tick task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncResult;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{ConnectionId, RoomHook};
use crate::rooms::{RoomManager, SchemaFactory, SharedRoom};

/// Builds the authoritative update hook of a new room from its id.
pub type HookFactory = Arc<dyn Fn(&str) -> Box<dyn RoomHook> + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Room tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Messages buffered per connection before it is resynced
    pub outbound_capacity: usize,
    /// Full snapshots at least this large are LZ4-compressed
    pub snapshot_compression_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            tick_interval_ms: 50,
            max_peers_per_room: 100,
            outbound_capacity: 256,
            snapshot_compression_threshold: 16 * 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub ticks: u64,
    pub full_states_sent: u64,
    pub deltas_sent: u64,
    pub resyncs: u64,
}

struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    hooks: HookFactory,
    outbound: RwLock<HashMap<ConnectionId, mpsc::Sender<Arc<Vec<u8>>>>>,
    stats: RwLock<ServerStats>,
    next_connection: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig, schema: SchemaFactory, hooks: HookFactory) -> Self {
        let rooms = RoomManager::new(
            schema,
            config.max_peers_per_room,
            config.snapshot_compression_threshold,
        );
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                hooks,
                outbound: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> SyncResult<()> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }
}

/// Per-connection state once the peer has joined a room.
struct Joined {
    room_id: String,
    room: SharedRoom,
    peer: PeerInfo,
}

/// Handle a single WebSocket connection.
async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> SyncResult<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection = ConnectionId(shared.next_connection.fetch_add(1, Ordering::Relaxed));
    let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(shared.config.outbound_capacity.max(1));
    shared.outbound.write().await.insert(connection, tx);
    log::info!("WebSocket connection established from {addr} as {connection}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut joined: Option<Joined> = None;
    let result: SyncResult<()> = loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        match handle_message(&shared, connection, &mut joined, sync_msg).await {
                            Ok(Some(reply)) => {
                                if let Err(e) = ws_sender.send(Message::Binary(reply.into())).await {
                                    break Err(e.into());
                                }
                            }
                            Ok(None) => {}
                            Err(Leave) => break Ok(()),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Err(e.into());
                    }
                    _ => {}
                }
            }

            // Outgoing room traffic
            data = rx.recv() => {
                let Some(data) = data else { break Ok(()) };
                if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                    break Err(e.into());
                }
            }
        }
    };

    // Cleanup: leave the room, drop the outbound channel
    if let Some(joined) = joined.take() {
        leave_room(&shared, connection, joined).await;
    }
    shared.outbound.write().await.remove(&connection);
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    let _ = ws_sender.close().await;
    result
}

/// Marker for a client that asked to leave.
struct Leave;

/// Returns an immediate reply for the sender, if any.
async fn handle_message(
    shared: &Arc<Shared>,
    connection: ConnectionId,
    joined: &mut Option<Joined>,
    msg: SyncMessage,
) -> Result<Option<Vec<u8>>, Leave> {
    match msg.msg_type {
        MessageType::Join => {
            let request = match msg.join_request() {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Bad join from {connection}: {e}");
                    return Ok(encoded(SyncMessage::error(&msg.room_id, "malformed join")));
                }
            };
            if let Some(current) = joined.as_ref() {
                if current.room_id == msg.room_id {
                    // Same room again: treat as a resync request
                    current.room.lock().await.request_full(connection);
                    return Ok(None);
                }
            }
            if let Some(previous) = joined.take() {
                leave_room(shared, connection, previous).await;
            }

            let peer = PeerInfo::with_id(msg.peer_id, request.name);
            match shared
                .rooms
                .join(&msg.room_id, connection, peer.clone(), request.full)
                .await
            {
                Ok((room, created)) => {
                    if created {
                        spawn_tick(shared.clone(), msg.room_id.clone(), room.clone());
                    }
                    if let Ok(notice) = SyncMessage::peer_joined(&msg.room_id, &peer) {
                        notify_room(shared, &room, connection, notice).await;
                    }
                    log::info!("Peer {} ({}) joined room {}", peer.name, peer.peer_id, msg.room_id);
                    *joined = Some(Joined {
                        room_id: msg.room_id,
                        room,
                        peer,
                    });
                    Ok(None)
                }
                Err(e) => {
                    log::warn!("Join of {connection} to room {} refused: {e}", msg.room_id);
                    Ok(encoded(SyncMessage::error(&msg.room_id, &e.to_string())))
                }
            }
        }

        MessageType::Delta => {
            if let Some(current) = joined.as_ref() {
                current
                    .room
                    .lock()
                    .await
                    .enqueue_client_delta(connection, msg.payload);
            } else {
                log::debug!("Delta from {connection} before join, dropped");
            }
            Ok(None)
        }

        MessageType::RequestFull => {
            if let Some(current) = joined.as_ref() {
                current.room.lock().await.request_full(connection);
            }
            Ok(None)
        }

        MessageType::Leave => Err(Leave),

        MessageType::Ping => Ok(encoded(SyncMessage::pong(msg.peer_id))),

        _ => {
            log::debug!("Unhandled message type: {:?}", msg.msg_type);
            Ok(None)
        }
    }
}

fn encoded(msg: SyncMessage) -> Option<Vec<u8>> {
    match msg.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::error!("Failed to encode {:?}: {e}", msg.msg_type);
            None
        }
    }
}

async fn leave_room(shared: &Arc<Shared>, connection: ConnectionId, joined: Joined) {
    joined.room.lock().await.detach(connection);
    let notice = SyncMessage::peer_left(joined.peer.peer_id, &joined.room_id);
    notify_room(shared, &joined.room, connection, notice).await;
    log::info!("Peer {} left room {}", joined.peer.peer_id, joined.room_id);
}

/// Send a control message to every connection in `room` except `except`.
async fn notify_room(shared: &Arc<Shared>, room: &SharedRoom, except: ConnectionId, msg: SyncMessage) {
    let Some(bytes) = encoded(msg) else { return };
    let bytes = Arc::new(bytes);
    let targets = room.lock().await.connections();
    let outbound = shared.outbound.read().await;
    for target in targets.into_iter().filter(|c| *c != except) {
        if let Some(tx) = outbound.get(&target) {
            let _ = tx.try_send(bytes.clone());
        }
    }
}

/// Run a room's ticks until the room is empty and removed.
fn spawn_tick(shared: Arc<Shared>, room_id: String, room: SharedRoom) {
    let mut hook = (shared.hooks)(&room_id);
    tokio::spawn(async move {
        let period = Duration::from_millis(shared.config.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::debug!("tick task for room {room_id} started ({period:?})");

        loop {
            interval.tick().await;

            let outbound = shared.outbound.read().await;
            let mut guard = room.lock().await;
            if guard.is_empty() {
                drop(guard);
                drop(outbound);
                if shared.rooms.remove_if_empty(&room_id).await {
                    break;
                }
                continue;
            }

            let (messages, report) = match guard.tick(hook.as_mut()) {
                Ok(result) => result,
                Err(e) => {
                    log::error!("tick failed in room {room_id}: {e}");
                    continue;
                }
            };
            let mut resyncs = 0;
            for msg in messages {
                let Some(tx) = outbound.get(&msg.connection) else { continue };
                match tx.try_send(msg.bytes) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!("{} is lagging in room {room_id}, resyncing", msg.connection);
                        guard.request_full(msg.connection);
                        resyncs += 1;
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            drop(guard);
            drop(outbound);

            let mut s = shared.stats.write().await;
            s.ticks += 1;
            s.full_states_sent += report.full_states as u64;
            s.deltas_sent += report.deltas as u64;
            s.resyncs += resyncs;
        }
        log::debug!("tick task for room {room_id} stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use plerion_state::{KeyKind, Schema, StateResult, StateTree};

    fn factories() -> (SchemaFactory, HookFactory) {
        let schema: SchemaFactory = Arc::new(|_| {
            Schema::composite()
                .field("names", Schema::set(KeyKind::Text))
                .build()
        });
        let hooks: HookFactory = Arc::new(|_| {
            Box::new(|_: &mut StateTree| -> StateResult<()> { Ok(()) }) as Box<dyn RoomHook>
        });
        (schema, hooks)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.snapshot_compression_threshold, 16 * 1024);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let (schema, hooks) = factories();
        let server = SyncServer::new(ServerConfig::default(), schema, hooks);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.ticks, 0);
    }

    #[tokio::test]
    async fn test_tick_task_removes_empty_room() {
        let (schema, hooks) = factories();
        let config = ServerConfig {
            tick_interval_ms: 5,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, schema, hooks);
        let (room, created) = server.rooms().get_or_create("lobby").await.unwrap();
        assert!(created);
        spawn_tick(server.shared.clone(), "lobby".into(), room);

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.rooms().room_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
