use thiserror::Error;

use crate::node::{NodeId, NodeKind};
use crate::observe::ObserverId;
use crate::value::{Key, KeyKind, ValueKind};

/// Errors surfaced by state-tree operations.
///
/// Most variants are programmer errors (touching a disposed node, writing a
/// derived value from outside its computation). The collection variants name
/// the offending key so callers can tell which insert or removal raced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("node {0} has been disposed")]
    Disposed(NodeId),
    #[error("node {node} has no field `{field}`")]
    UnknownField { node: NodeId, field: String },
    #[error("key {0} is already present")]
    DuplicateKey(Key),
    #[error("key {0} is not present")]
    MissingKey(Key),
    #[error("index {index} is out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("expected a {expected:?} value, found {found:?}")]
    TypeMismatch { expected: ValueKind, found: ValueKind },
    #[error("expected a {expected:?} key, found {found:?}")]
    KeyMismatch { expected: KeyKind, found: KeyKind },
    #[error("expected a {expected:?} node, found {found:?}")]
    KindMismatch { expected: NodeKind, found: NodeKind },
    #[error("node {0} is a composite field and is disposed with its owner")]
    FixedField(NodeId),
    #[error("node {0} is derived and can only be written by its computation")]
    DerivedNode(NodeId),
    #[error("node {0} already has a derived computation")]
    AlreadyDerived(NodeId),
    #[error("observer {0} is not registered")]
    UnknownObserver(ObserverId),
    #[error("path {0} does not resolve to a node")]
    PathNotFound(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("json: {0}")]
    Json(String),
    #[error("io: {0}")]
    Io(String),
    #[error("action failed: {0}")]
    Action(String),
}

pub type StateResult<T> = Result<T, StateError>;

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Json(e.to_string())
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e.to_string())
    }
}
