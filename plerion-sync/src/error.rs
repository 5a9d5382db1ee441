use plerion_state::StateError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced by rooms, the server and the client.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("not connected")]
    NotConnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}
