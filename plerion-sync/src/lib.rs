//! # plerion-sync — Room replication for Plerion
//!
//! Replicates a room's authoritative [`plerion_state::StateTree`] to client
//! mirrors over WebSocket, one shared delta per tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ClientMirror │                     │ Room        │
//! │ (local tree)│                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ tick: inbound → hook →
//!                                    ┌───────┴───────┐  shared delta → clear
//!                                    │ per-connection│
//!                                    │ outbound      │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`room`] — Authoritative room tree and its tick
//! - [`rooms`] — Room id routing, creation and pruning
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client and local mirror
//! - [`lifecycle`] — Single-flight async start/stop guard
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Envelope encode | <500ns |
//! | Tick, 100 connections, 1K ops | <2ms |
//! | Full state 10K nodes (lz4) | <10ms |

pub mod client;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod room;
pub mod rooms;
pub mod server;

// Re-exports for convenience
pub use client::{ClientMirror, SyncClient, SyncEvent};
pub use error::{SyncError, SyncResult};
pub use lifecycle::{AsyncLifecycleGuard, CancelSource, CancelToken, GuardError, LifecycleState};
pub use protocol::{
    JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage, decode_full_state,
    encode_full_state,
};
pub use room::{ConnectionId, Outgoing, Room, RoomHook, TickReport};
pub use rooms::{RoomManager, SchemaFactory, SharedRoom};
pub use server::{HookFactory, ServerConfig, ServerStats, SyncServer};
