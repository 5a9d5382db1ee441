//! WebSocket sync client for joining a replicated room.
//!
//! Provides:
//! - [`ClientMirror`]: the local tree, fed by full snapshots and deltas
//! - [`SyncClient`]: connection lifecycle (connect, disconnect, reconnect)
//!   sequenced through an [`AsyncLifecycleGuard`]
//!
//! Every connect sends `Join{full: true}`. A mirror that lost its
//! connection ignores deltas until the next full snapshot arrives, and
//! local deltas produced while disconnected are dropped rather than
//! queued: the snapshot served on reconnect supersedes them.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use plerion_state::{
    filters, ApplyReport, Delta, DeltaOrigin, Schema, Snapshot, StateResult, StateTree,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{AsyncLifecycleGuard, CancelToken, GuardError, LifecycleState};
use crate::protocol::{JoinRequest, MessageType, PeerInfo, SyncMessage};

/// Local replica of a room's tree.
#[derive(Debug)]
pub struct ClientMirror {
    tree: StateTree,
    synced: bool,
    last_tick: u64,
}

impl ClientMirror {
    pub fn new(schema: Schema) -> StateResult<Self> {
        Ok(Self {
            tree: StateTree::initialize(schema)?,
            synced: false,
            last_tick: 0,
        })
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Local edits go through here and are picked up by
    /// [`take_local_delta`](Self::take_local_delta).
    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// True until a full snapshot has been applied since the last
    /// disconnect.
    pub fn needs_full(&self) -> bool {
        !self.synced
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    /// Replace local state with the room's. Unsent local edits are
    /// discarded.
    pub fn apply_full(&mut self, snapshot: &Snapshot, tick: u64) -> StateResult<()> {
        let root = self.tree.root();
        self.tree.apply_snapshot(root, snapshot)?;
        self.tree.clear_delta(root)?;
        self.synced = true;
        self.last_tick = tick;
        log::debug!("mirror synced from full state at tick {tick}");
        Ok(())
    }

    /// Apply an authoritative delta. Ignored while not synced.
    pub fn apply_delta(&mut self, delta: &Delta, tick: u64) -> StateResult<ApplyReport> {
        if !self.synced {
            log::debug!("ignoring delta for tick {tick}: waiting for full state");
            return Ok(ApplyReport::default());
        }
        let root = self.tree.root();
        let report = self.tree.apply_delta(root, delta, DeltaOrigin::Authority)?;
        self.last_tick = tick;
        Ok(report)
    }

    /// Local edits since the last call, without derived values. Returns
    /// `None` when nothing changed.
    pub fn take_local_delta(&mut self) -> StateResult<Option<Delta>> {
        let root = self.tree.root();
        let delta = self.tree.serialize_delta(root, &filters::exclude_derived)?;
        self.tree.clear_delta(root)?;
        Ok((!delta.is_empty()).then_some(delta))
    }

    /// Forget sync state; the next full snapshot resets the tree.
    pub fn mark_disconnected(&mut self) {
        self.synced = false;
    }

    /// Apply a room message addressed to this mirror. Returns `true` if it
    /// changed state.
    pub fn handle(&mut self, msg: &SyncMessage) -> SyncResult<bool> {
        match msg.msg_type {
            MessageType::FullState => {
                self.apply_full(&msg.snapshot()?, msg.tick)?;
                Ok(true)
            }
            MessageType::Delta => {
                let delta = Delta::decode(&msg.payload)?;
                Ok(self.apply_delta(&delta, msg.tick)?.applied > 0)
            }
            _ => Ok(false),
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and join sent
    Connected,
    /// Full room state; apply with [`ClientMirror::apply_full`]
    FullState { tick: u64, snapshot: Snapshot },
    /// Authoritative delta; apply with [`ClientMirror::apply_delta`]
    Delta { tick: u64, delta: Delta },
    /// A peer joined the room
    PeerJoined(PeerInfo),
    /// A peer left the room
    PeerLeft(Uuid),
    /// The server refused a request
    Error(String),
    /// Connection lost or closed by the server
    Disconnected,
}

type Outgoing = Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>;
type Writer = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Wait for the writer of a cancelled connection to send its leave and
/// close, then report the disconnect.
async fn close_connection(outgoing: Outgoing, writer: Writer, event_tx: mpsc::Sender<SyncEvent>) {
    let handle = writer.lock().await.take();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            log::warn!("Writer task failed: {e}");
        }
    }
    outgoing.write().await.take();
    let _ = event_tx.send(SyncEvent::Disconnected).await;
}

/// The sync client.
///
/// Manages one WebSocket connection to the sync server for one room.
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,
    room_id: String,
    server_url: String,
    guard: AsyncLifecycleGuard,
    /// Channel to the WebSocket writer task of the current connection
    outgoing: Outgoing,
    /// Writer task of the current connection
    writer: Writer,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(peer_info: PeerInfo, room_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room_id: room_id.into(),
            server_url: server_url.into(),
            guard: AsyncLifecycleGuard::new(),
            outgoing: Arc::new(RwLock::new(None)),
            writer: Arc::new(Mutex::new(None)),
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the room.
    ///
    /// Connecting while connected closes the old connection first, the
    /// same way [`disconnect`](Self::disconnect) does. Spawns background
    /// tasks for reading and writing WebSocket messages.
    pub async fn connect(&self) -> SyncResult<()> {
        let url = self.server_url.clone();
        let room_id = self.room_id.clone();
        let peer = self.peer_info.clone();
        let outgoing = self.outgoing.clone();
        let writer = self.writer.clone();
        let event_tx = self.event_tx.clone();
        let on_stop = {
            let (outgoing, writer, event_tx) = (outgoing.clone(), writer.clone(), event_tx.clone());
            move || close_connection(outgoing, writer, event_tx)
        };

        self.guard
            .start_with_stop(&CancelToken::never(), |token| async move {
                let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
                let (mut ws_writer, mut ws_reader) = ws_stream.split();

                let join = SyncMessage::join(
                    peer.peer_id,
                    &room_id,
                    &JoinRequest {
                        name: peer.name.clone(),
                        full: true,
                    },
                )?
                .encode()?;
                ws_writer.send(Message::Binary(join.into())).await?;

                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                *outgoing.write().await = Some(out_tx);

                // Writer task: forward outgoing channel to WebSocket
                let writer_token = token.clone();
                let leave = SyncMessage::leave(peer.peer_id, &room_id).encode()?;
                *writer.lock().await = Some(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = writer_token.cancelled() => {
                                let _ = ws_writer.send(Message::Binary(leave.clone().into())).await;
                                let _ = ws_writer.close().await;
                                break;
                            }
                            data = out_rx.recv() => {
                                let Some(data) = data else { break };
                                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }));

                // Reader task: turn room messages into events
                let reader_events = event_tx.clone();
                let own_id = peer.peer_id;
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            msg = ws_reader.next() => {
                                match msg {
                                    Some(Ok(Message::Binary(data))) => {
                                        let bytes: Vec<u8> = data.into();
                                        match SyncMessage::decode(&bytes) {
                                            Ok(sync_msg) => {
                                                if let Some(event) = to_event(sync_msg, own_id) {
                                                    let _ = reader_events.send(event).await;
                                                }
                                            }
                                            Err(e) => log::warn!("Undecodable message from server: {e}"),
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                        let _ = reader_events.send(SyncEvent::Disconnected).await;
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                });

                let _ = event_tx.send(SyncEvent::Connected).await;
                log::info!("Connected to {url} as {} in room {room_id}", peer.peer_id);
                Ok::<(), SyncError>(())
            }, on_stop)
            .await
            .map_err(flatten)
    }

    /// Leave the room and close the connection.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let outgoing = self.outgoing.clone();
        let writer = self.writer.clone();
        let event_tx = self.event_tx.clone();
        self.guard
            .stop(|| async move {
                close_connection(outgoing, writer, event_tx).await;
                Ok::<(), SyncError>(())
            })
            .await
            .map_err(flatten)
    }

    /// Send a local delta. Returns `false` if it was dropped because the
    /// client is not connected.
    pub async fn send_delta(&self, delta: &Delta) -> SyncResult<bool> {
        let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room_id, 0, delta.encode()?);
        self.send(msg).await
    }

    /// Ask for a full snapshot on the next room tick.
    pub async fn request_full(&self) -> SyncResult<bool> {
        self.send(SyncMessage::request_full(self.peer_info.peer_id, &self.room_id))
            .await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> SyncResult<bool> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    async fn send(&self, msg: SyncMessage) -> SyncResult<bool> {
        if !self.guard.is_running() {
            log::debug!("not connected, dropping {:?}", msg.msg_type);
            return Ok(false);
        }
        let encoded = msg.encode()?;
        let Some(tx) = self.outgoing.read().await.clone() else {
            return Ok(false);
        };
        Ok(tx.send(encoded).await.is_ok())
    }

    /// Get the current connection state.
    pub fn connection_state(&self) -> LifecycleState {
        self.guard.state()
    }

    /// Get our peer info.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn flatten(e: GuardError<SyncError>) -> SyncError {
    match e {
        GuardError::Cancelled => SyncError::Cancelled,
        GuardError::Failed(e) => e,
    }
}

fn to_event(msg: SyncMessage, own_id: Uuid) -> Option<SyncEvent> {
    match msg.msg_type {
        MessageType::FullState => match msg.snapshot() {
            Ok(snapshot) => Some(SyncEvent::FullState {
                tick: msg.tick,
                snapshot,
            }),
            Err(e) => {
                log::warn!("Bad full state: {e}");
                None
            }
        },
        MessageType::Delta => match Delta::decode(&msg.payload) {
            Ok(delta) => Some(SyncEvent::Delta {
                tick: msg.tick,
                delta,
            }),
            Err(e) => {
                log::warn!("Bad delta: {e}");
                None
            }
        },
        MessageType::PeerJoined if msg.peer_id != own_id => msg.peer_info().ok().map(SyncEvent::PeerJoined),
        MessageType::PeerLeft if msg.peer_id != own_id => Some(SyncEvent::PeerLeft(msg.peer_id)),
        MessageType::Error => Some(SyncEvent::Error(msg.reason().unwrap_or_default())),
        _ => None,
    }
}
