//! # plerion-state — Observable state tree for Plerion
//!
//! A reactive tree of typed nodes shared by every Plerion app: it drives UI
//! refresh, backs undo and settings persistence, and replicates between a
//! room's authoritative tree and its client mirrors.
//!
//! ## Architecture
//!
//! ```text
//!  UI / network input
//!        │
//!        ▼
//! ┌─────────────┐   queued from    ┌──────────────┐
//! │ Action      │ ◄─────────────── │ ActionSender │  (any thread)
//! │ pipeline    │   drain_actions  └──────────────┘
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐   record()       ┌──────────────┐
//! │ StateTree   │ ───────────────► │ Observers    │ direct, then derived
//! │ (arena)     │                  │ (flush/pass) │ by height
//! └──────┬──────┘                  └──────────────┘
//!        │ pending ops per node
//!        ▼
//! ┌─────────────┐   encode/decode  ┌──────────────┐
//! │ Delta /     │ ◄──────────────► │ bincode wire │
//! │ Snapshot    │   to/from_json   │ JSON files   │
//! └─────────────┘                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tree`] — arena, navigation, mutation path
//! - [`observe`] — observer registry and flush ordering
//! - [`derived`] — derived values and dependency rewiring
//! - [`action`] — command objects and the apply queue
//! - [`undo`] — snapshot checkpoints
//! - [`delta`] — per-node op queues, delta wire form and apply
//! - [`snapshot`] — full snapshots and JSON documents
//! - [`persist`] — settings file mirroring
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Set + notify (1 observer) | <1µs |
//! | Serialize delta, 1K ops | <1ms |
//! | Snapshot 10K nodes | <10ms |

pub mod action;
pub mod derived;
pub mod delta;
pub mod error;
pub mod node;
pub mod observe;
pub mod persist;
pub mod schema;
pub mod snapshot;
pub mod tree;
pub mod undo;
pub mod value;

// Re-exports for convenience
pub use action::{
    Action, ActionFn, ActionSender, AddEntry, AddOrUpdateEntry, AddToSet, ApplySnapshot,
    LoadJson, RemoveEntry, RemoveFromSet, SetArrayValues, SetPrimitiveValue, SetSetValues,
    action_fn,
};
pub use delta::{
    ApplyReport, Delta, DeltaKind, DeltaOp, DeltaOrigin, NodeInfo, SerializeFilter, filters,
};
pub use error::{StateError, StateResult};
pub use node::{Lifecycle, NodeId, NodeKind, NodePath, PathSegment};
pub use observe::{
    ChangeType, NodeChange, NodeChangeEventArgs, ObserverCallback, ObserverId, ObserverOptions,
    Scope,
};
pub use persist::SettingsStore;
pub use schema::{CompositeBuilder, CompositeSchema, FieldSchema, Hook, Schema};
pub use snapshot::Snapshot;
pub use tree::StateTree;
pub use undo::{Checkpoint, UndoManager};
pub use value::{Key, KeyKind, Value, ValueKind};
