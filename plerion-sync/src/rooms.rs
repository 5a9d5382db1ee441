//! Room manager: maps room ids to live rooms.
//!
//! Each room gets its own tree and tick task so that state is isolated
//! between rooms. Joining and pruning both happen under the manager's write
//! lock, so a connection can never attach to a room that is being removed.

use std::collections::HashMap;
use std::sync::Arc;

use plerion_state::Schema;
use tokio::sync::{Mutex, RwLock};

use crate::error::{SyncError, SyncResult};
use crate::protocol::PeerInfo;
use crate::room::{ConnectionId, Room};

/// Builds the schema of a new room from its id.
pub type SchemaFactory = Arc<dyn Fn(&str) -> Schema + Send + Sync>;

pub type SharedRoom = Arc<Mutex<Room>>;

pub struct RoomManager {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    schema: SchemaFactory,
    max_peers_per_room: usize,
    compression_threshold: usize,
}

impl RoomManager {
    pub fn new(schema: SchemaFactory, max_peers_per_room: usize, compression_threshold: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            schema,
            max_peers_per_room,
            compression_threshold,
        }
    }

    /// Get or create a room.
    /// Returns the room and whether it was created by this call.
    pub async fn get_or_create(&self, room_id: &str) -> SyncResult<(SharedRoom, bool)> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Ok((room.clone(), false));
            }
        }

        let mut rooms = self.rooms.write().await;
        self.get_or_create_locked(&mut rooms, room_id)
    }

    fn get_or_create_locked(
        &self,
        rooms: &mut HashMap<String, SharedRoom>,
        room_id: &str,
    ) -> SyncResult<(SharedRoom, bool)> {
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return Ok((room.clone(), false));
        }
        let room = Room::new(room_id, (self.schema)(room_id))?
            .with_compression_threshold(self.compression_threshold);
        let room = Arc::new(Mutex::new(room));
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("Room {room_id} created");
        Ok((room, true))
    }

    /// Attach a connection to a room, creating the room if needed.
    /// Returns the room and whether it was created by this call.
    pub async fn join(
        &self,
        room_id: &str,
        connection: ConnectionId,
        peer: PeerInfo,
        full: bool,
    ) -> SyncResult<(SharedRoom, bool)> {
        let mut rooms = self.rooms.write().await;
        let (room, created) = self.get_or_create_locked(&mut rooms, room_id)?;
        {
            let mut guard = room.lock().await;
            if guard.client_count() >= self.max_peers_per_room {
                return Err(SyncError::RoomFull(room_id.to_string()));
            }
            if full {
                guard.attach(connection, peer);
            } else {
                guard.attach_synced(connection, peer);
            }
        }
        Ok((room, created))
    }

    pub async fn get(&self, room_id: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Remove a room with no connections.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.lock().await.is_empty() {
                rooms.remove(room_id);
                log::info!("Room {room_id} removed (empty)");
                return true;
            }
        }
        false
    }

    /// Get the number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Get all active room ids.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
