//! Node identity, lifecycle and storage.
//!
//! Nodes live in a generational arena owned by [`crate::StateTree`]. A
//! [`NodeId`] is an index plus the generation of the slot at allocation
//! time; once a node is disposed its slot generation moves on, so a stale id
//! can never alias a later node.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::delta::DeltaKind;
use crate::schema::Schema;
use crate::value::{Key, Value};

/// Handle to a node in a [`crate::StateTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Node lifecycle. Transitions only move forward; a disposed node never
/// comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Uninitialized,
    /// Children wired, not yet observable. Writes are allowed and untracked.
    Initializing,
    Active,
    Disposing,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Primitive,
    Composite,
    Dictionary,
    Set,
    List,
    Array,
}

/// One step from a node to one of its children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Composite field, by declaration index.
    Field(u16),
    /// Dictionary entry, by key.
    Entry(Key),
}

/// Location of a node relative to some ancestor (usually the root).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePath(pub Vec<PathSegment>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn field(mut self, index: u16) -> Self {
        self.0.push(PathSegment::Field(index));
        self
    }

    pub fn entry(mut self, key: impl Into<Key>) -> Self {
        self.0.push(PathSegment::Entry(key.into()));
        self
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.0 {
            match segment {
                PathSegment::Field(i) => write!(f, "/{i}")?,
                PathSegment::Entry(k) => write!(f, "/[{k}]")?,
            }
        }
        Ok(())
    }
}

/// How a node is addressed by its parent. Assigned once at instantiation.
#[derive(Debug, Clone)]
pub(crate) enum Identity {
    Root,
    Field { index: u16, name: Arc<str> },
    Entry(Key),
}

#[derive(Debug)]
pub(crate) enum NodeData {
    Primitive(Value),
    Composite(Vec<NodeId>),
    Dictionary(BTreeMap<Key, NodeId>),
    Set(BTreeSet<Key>),
    List(Vec<Value>),
    Array(Vec<Value>),
}

impl NodeData {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            NodeData::Primitive(_) => NodeKind::Primitive,
            NodeData::Composite(_) => NodeKind::Composite,
            NodeData::Dictionary(_) => NodeKind::Dictionary,
            NodeData::Set(_) => NodeKind::Set,
            NodeData::List(_) => NodeKind::List,
            NodeData::Array(_) => NodeKind::Array,
        }
    }

    /// Direct child nodes in serialization order.
    pub(crate) fn children(&self) -> Vec<NodeId> {
        match self {
            NodeData::Composite(fields) => fields.clone(),
            NodeData::Dictionary(entries) => entries.values().copied().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) identity: Identity,
    pub(crate) parent: Option<NodeId>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) derived: bool,
    pub(crate) schema: Schema,
    pub(crate) data: NodeData,
    /// Delta ops recorded since the last clear.
    pub(crate) pending: Vec<DeltaKind>,
}

#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) node: Option<Node>,
}

/// Generational arena backing a tree.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// Free the slot and bump its generation. Returns the removed node.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(node)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;

    fn leaf() -> Node {
        Node {
            identity: Identity::Root,
            parent: None,
            lifecycle: Lifecycle::Active,
            derived: false,
            schema: Schema::primitive(ValueKind::Int),
            data: NodeData::Primitive(Value::Int(0)),
            pending: Vec::new(),
        }
    }

    #[test]
    fn test_arena_generation_detects_stale_ids() {
        let mut arena = Arena::default();
        let a = arena.insert(leaf());
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());

        let b = arena.insert(leaf());
        assert_eq!(a.index, b.index);
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn test_path_display() {
        let path = NodePath::root().field(1).entry("a").field(0);
        assert_eq!(path.to_string(), "/1/[\"a\"]/0");
        assert_eq!(NodePath::root().to_string(), "/");
    }
}
