//! Binary protocol for room replication.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id   │ tick     │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf8│ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Server-originated messages carry the nil peer id. A `FullState` payload
//! is framed with one flag byte so large snapshots can travel LZ4-compressed:
//!
//! ```text
//! ┌──────┬─────────────────────────────────────────────┐
//! │ 0x00 │ bincode Snapshot                            │
//! │ 0x01 │ lz4 (size-prepended) of bincode Snapshot    │
//! └──────┴─────────────────────────────────────────────┘
//! ```
//!
//! Performance target: envelope encode < 500ns for a typical delta.

use plerion_state::Snapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const FRAME_RAW: u8 = 0;
const FRAME_LZ4: u8 = 1;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client enters a room; payload is a [`JoinRequest`]
    Join = 1,
    /// Full snapshot of the room tree (flag-framed)
    FullState = 2,
    /// Encoded `Delta`, client input or authoritative fan-out
    Delta = 3,
    /// Client leaves its room
    Leave = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
    /// Server-side refusal; payload is a UTF-8 reason
    Error = 7,
    /// Peer joined notification; payload is a [`PeerInfo`]
    PeerJoined = 8,
    /// Peer left notification
    PeerLeft = 9,
    /// Client asks for a fresh full snapshot on the next tick
    RequestFull = 10,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Payload of a `Join` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub name: String,
    /// Ask for a full snapshot before any delta. A client that has no
    /// state of its own (every fresh connect or reconnect) must set this.
    pub full: bool,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: String,
    /// Room tick the payload was produced on (0 for control messages)
    pub tick: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn control(msg_type: MessageType, peer_id: Uuid, room_id: &str) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.to_string(),
            tick: 0,
            payload: Vec::new(),
        }
    }

    /// Create a join request.
    pub fn join(peer_id: Uuid, room_id: &str, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(request)?,
            ..Self::control(MessageType::Join, peer_id, room_id)
        })
    }

    /// Create a full-state message from an already framed payload
    /// (see [`encode_full_state`]).
    pub fn full_state(room_id: &str, tick: u64, framed: Vec<u8>) -> Self {
        Self {
            tick,
            payload: framed,
            ..Self::control(MessageType::FullState, Uuid::nil(), room_id)
        }
    }

    /// Create a delta message carrying an encoded `Delta`.
    pub fn delta(peer_id: Uuid, room_id: &str, tick: u64, delta: Vec<u8>) -> Self {
        Self {
            tick,
            payload: delta,
            ..Self::control(MessageType::Delta, peer_id, room_id)
        }
    }

    pub fn leave(peer_id: Uuid, room_id: &str) -> Self {
        Self::control(MessageType::Leave, peer_id, room_id)
    }

    pub fn request_full(peer_id: Uuid, room_id: &str) -> Self {
        Self::control(MessageType::RequestFull, peer_id, room_id)
    }

    /// Create a refusal with a human-readable reason.
    pub fn error(room_id: &str, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::control(MessageType::Error, Uuid::nil(), room_id)
        }
    }

    /// Create a peer joined notification.
    pub fn peer_joined(room_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(info)?,
            ..Self::control(MessageType::PeerJoined, info.peer_id, room_id)
        })
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, room_id: &str) -> Self {
        Self::control(MessageType::PeerLeft, peer_id, room_id)
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::control(MessageType::Ping, peer_id, "")
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::control(MessageType::Pong, peer_id, "")
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse full-state payload.
    pub fn snapshot(&self) -> Result<Snapshot, ProtocolError> {
        if self.msg_type != MessageType::FullState {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_full_state(&self.payload)
    }

    /// Parse error payload.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Frame a snapshot for a `FullState` payload, compressing it when the
/// encoded form is at least `threshold` bytes.
pub fn encode_full_state(snapshot: &Snapshot, threshold: usize) -> Result<Vec<u8>, ProtocolError> {
    let raw = snapshot
        .encode()
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    let mut framed = Vec::with_capacity(raw.len().min(threshold) + 1);
    if raw.len() >= threshold {
        framed.push(FRAME_LZ4);
        framed.extend_from_slice(&lz4_flex::compress_prepend_size(&raw));
    } else {
        framed.push(FRAME_RAW);
        framed.extend_from_slice(&raw);
    }
    Ok(framed)
}

pub fn decode_full_state(framed: &[u8]) -> Result<Snapshot, ProtocolError> {
    let Some((&flag, body)) = framed.split_first() else {
        return Err(ProtocolError::DeserializationError("empty full-state payload".into()));
    };
    let decode = |bytes: &[u8]| {
        Snapshot::decode(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    };
    match flag {
        FRAME_RAW => decode(body),
        FRAME_LZ4 => {
            let raw = lz4_flex::decompress_size_prepended(body)
                .map_err(|e| ProtocolError::Compression(e.to_string()))?;
            decode(&raw)
        }
        other => Err(ProtocolError::DeserializationError(format!(
            "unknown full-state frame {other:#04x}"
        ))),
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    Compression(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use plerion_state::Value;

    fn sample_snapshot(entries: usize) -> Snapshot {
        Snapshot::Composite(vec![(
            0,
            Snapshot::List((0..entries).map(|i| Value::from(format!("entry {i}"))).collect()),
        )])
    }

    #[test]
    fn test_delta_message_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::delta(peer, "lobby", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.room_id, "lobby");
        assert_eq!(decoded.tick, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_request_roundtrip() {
        let peer = Uuid::new_v4();
        let request = JoinRequest {
            name: "Alice".into(),
            full: true,
        };
        let msg = SyncMessage::join(peer, "lobby", &request).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.join_request().unwrap(), request);
    }

    #[test]
    fn test_peer_joined_roundtrip() {
        let info = PeerInfo::new("Bob");
        let msg = SyncMessage::peer_joined("lobby", &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_small_full_state_is_not_compressed() {
        let snapshot = sample_snapshot(2);
        let framed = encode_full_state(&snapshot, 1024).unwrap();
        assert_eq!(framed[0], FRAME_RAW);
        assert_eq!(decode_full_state(&framed).unwrap(), snapshot);
    }

    #[test]
    fn test_large_full_state_is_compressed() {
        let snapshot = sample_snapshot(2000);
        let raw_len = snapshot.encode().unwrap().len();
        let framed = encode_full_state(&snapshot, 1024).unwrap();
        assert_eq!(framed[0], FRAME_LZ4);
        assert!(framed.len() < raw_len, "{} >= {raw_len}", framed.len());

        let msg = SyncMessage::full_state("lobby", 7, framed);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_id, Uuid::nil());
        assert_eq!(decoded.snapshot().unwrap(), snapshot);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(msg.join_request(), Err(ProtocolError::InvalidMessageType));
        assert!(msg.peer_info().is_err());
        assert!(msg.snapshot().is_err());
        assert!(msg.reason().is_err());
    }

    #[test]
    fn test_error_reason() {
        let msg = SyncMessage::error("lobby", "room is full");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.reason().unwrap(), "room is full");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(decode_full_state(&[]).is_err());
        assert!(decode_full_state(&[9, 1, 2]).is_err());
        assert!(matches!(
            decode_full_state(&[FRAME_LZ4, 10, 0, 0, 0, 0xFF]),
            Err(ProtocolError::Compression(_))
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::FullState as u8, 2);
        assert_eq!(MessageType::Delta as u8, 3);
        assert_eq!(MessageType::Leave as u8, 4);
        assert_eq!(MessageType::Ping as u8, 5);
        assert_eq!(MessageType::Pong as u8, 6);
        assert_eq!(MessageType::Error as u8, 7);
        assert_eq!(MessageType::PeerJoined as u8, 8);
        assert_eq!(MessageType::PeerLeft as u8, 9);
        assert_eq!(MessageType::RequestFull as u8, 10);
    }

    #[test]
    fn test_delta_size_efficient() {
        let msg = SyncMessage::delta(Uuid::new_v4(), "room-1", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 100,
            "Encoded size {} too large for 50-byte delta",
            encoded.len()
        );
    }
}
