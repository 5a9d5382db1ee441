//! Delta tracking: the minimal set of operations since the last flush.
//!
//! Every Active node keeps a queue of ops appended by the same mutation path
//! that notifies observers. Serializing a subtree walks it depth-first (a
//! node's own ops, then its children) and tags each op with its path from
//! the serialization root.
//!
//! ```text
//!   dict{A: {name: "x"}}
//!     add_entry(B, name = "y")   → dict.pending   = [Add(B, init)]
//!     set(A.name, "z")           → A.name.pending = [Set("z")]
//!
//!   serialize_delta(dict) = [ /           Add(B, {name: "y"}),
//!                             /[A]/0      Set("z") ]
//! ```
//!
//! Queues are cleared once per flush by whoever consumed them (the room
//! tick, the client's outgoing sender). With N receivers the delta is
//! serialized once and shared, then cleared once.
//!
//! Wire form: bincode (standard config) over serde.
//!
//! Performance targets:
//! - serialize 1k pending ops: < 1ms
//! - apply 1k ops: < 2ms

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::node::{Identity, NodeData, NodeId, NodeKind, NodePath};
use crate::snapshot::Snapshot;
use crate::tree::StateTree;
use crate::value::{Key, Value};

/// One recorded mutation on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaKind {
    /// Primitive value. Only the latest is kept.
    Set(Value),
    /// Dictionary entry added with its initial state.
    Add { key: Key, init: Snapshot },
    Remove { key: Key },
    SetInsert(Key),
    SetRemove(Key),
    ListInsert { index: u32, value: Value },
    ListRemove { index: u32 },
    ListSet { index: u32, value: Value },
    ListReplace(Vec<Value>),
    /// Whole array contents. Only the latest is kept.
    ArraySet(Vec<Value>),
}

/// Append `op` to a node's queue, collapsing ops that supersede earlier ones.
pub(crate) fn enqueue(pending: &mut Vec<DeltaKind>, op: DeltaKind) {
    match &op {
        DeltaKind::Set(_) | DeltaKind::ArraySet(_) | DeltaKind::ListReplace(_) => pending.clear(),
        _ => {}
    }
    pending.push(op);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaOp {
    pub path: NodePath,
    pub kind: DeltaKind,
}

/// Ordered ops for one subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn encode(&self) -> StateResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StateError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> StateResult<Self> {
        let (delta, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| StateError::Decode(e.to_string()))?;
        Ok(delta)
    }
}

/// Where an inbound delta comes from, which decides how strictly it is
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOrigin {
    /// Client input arriving at the authority. Derived targets are skipped,
    /// failing ops are skipped, applied ops are tracked for fan-out.
    Remote,
    /// Authoritative state arriving at a mirror. Not tracked (no echo),
    /// tolerant of adds/removes that already happened, writes derived nodes.
    Authority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

/// What a serialize filter gets to see about a node.
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo<'a> {
    pub id: NodeId,
    pub name: Option<&'a str>,
    pub key: Option<&'a Key>,
    pub derived: bool,
    pub kind: NodeKind,
}

/// Returns `false` to leave a node (and its subtree) out.
pub type SerializeFilter<'f> = &'f dyn Fn(&NodeInfo<'_>) -> bool;

pub mod filters {
    use super::NodeInfo;

    pub fn all(_: &NodeInfo<'_>) -> bool {
        true
    }

    pub fn exclude_derived(info: &NodeInfo<'_>) -> bool {
        !info.derived
    }
}

impl StateTree {
    pub(crate) fn node_info(&self, id: NodeId) -> StateResult<NodeInfo<'_>> {
        let node = self.node(id)?;
        let (name, key) = match &node.identity {
            Identity::Root => (None, None),
            Identity::Field { name, .. } => (Some(&**name), None),
            Identity::Entry(key) => (None, Some(key)),
        };
        Ok(NodeInfo {
            id,
            name,
            key,
            derived: node.derived,
            kind: node.data.kind(),
        })
    }

    /// Collect pending ops under `node`, depth-first.
    pub fn serialize_delta(&self, node: NodeId, filter: SerializeFilter<'_>) -> StateResult<Delta> {
        let mut delta = Delta::default();
        let mut path = NodePath::root();
        self.collect_delta(node, &mut path, filter, &mut delta.ops)?;
        Ok(delta)
    }

    fn collect_delta(
        &self,
        id: NodeId,
        path: &mut NodePath,
        filter: SerializeFilter<'_>,
        out: &mut Vec<DeltaOp>,
    ) -> StateResult<()> {
        if !filter(&self.node_info(id)?) {
            return Ok(());
        }
        let node = self.node(id)?;
        out.extend(node.pending.iter().map(|kind| DeltaOp {
            path: path.clone(),
            kind: kind.clone(),
        }));
        match &node.data {
            NodeData::Composite(fields) => {
                for (index, child) in fields.iter().enumerate() {
                    path.0.push(crate::node::PathSegment::Field(index as u16));
                    self.collect_delta(*child, path, filter, out)?;
                    path.0.pop();
                }
            }
            NodeData::Dictionary(entries) => {
                for (key, child) in entries {
                    path.0.push(crate::node::PathSegment::Entry(key.clone()));
                    self.collect_delta(*child, path, filter, out)?;
                    path.0.pop();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Empty every queue under `node`.
    pub fn clear_delta(&mut self, node: NodeId) -> StateResult<()> {
        for id in self.post_order(node)? {
            if let Some(n) = self.arena.get_mut(id) {
                n.pending.clear();
            }
        }
        Ok(())
    }

    pub fn has_delta(&self, node: NodeId) -> StateResult<bool> {
        Ok(self
            .post_order(node)?
            .into_iter()
            .any(|id| self.arena.get(id).is_some_and(|n| !n.pending.is_empty())))
    }

    /// Apply `delta` to the subtree at `node`, as one pass.
    pub fn apply_delta(&mut self, node: NodeId, delta: &Delta, origin: DeltaOrigin) -> StateResult<ApplyReport> {
        self.batch(|tree| {
            let mut report = ApplyReport::default();
            if origin == DeltaOrigin::Authority {
                tree.pass.suppress_tracking += 1;
                tree.pass.derived_writers += 1;
            }
            for op in &delta.ops {
                match tree.apply_op(node, op, origin) {
                    Ok(true) => report.applied += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        log::warn!("skipping delta op at {}: {e}", op.path);
                        report.skipped += 1;
                    }
                }
            }
            if origin == DeltaOrigin::Authority {
                tree.pass.suppress_tracking -= 1;
                tree.pass.derived_writers -= 1;
            }
            Ok(report)
        })
    }

    /// `Ok(false)` means the op was deliberately not applied.
    fn apply_op(&mut self, base: NodeId, op: &DeltaOp, origin: DeltaOrigin) -> StateResult<bool> {
        let target = self.resolve_from(base, &op.path)?;
        let authority = origin == DeltaOrigin::Authority;
        if !authority && self.is_derived(target)? {
            return Ok(false);
        }
        match &op.kind {
            DeltaKind::Set(value) => self.set(target, value.clone())?,
            DeltaKind::Add { key, init } => match self.try_entry(target, key)? {
                Some(entry) if authority => self.apply_snapshot(entry, init)?,
                Some(_) => return Err(StateError::DuplicateKey(key.clone())),
                None => {
                    self.add_entry_with(target, key.clone(), init)?;
                }
            },
            DeltaKind::Remove { key } => {
                if authority && !self.contains_key(target, key)? {
                    return Ok(false);
                }
                self.remove_entry(target, key)?;
            }
            DeltaKind::SetInsert(key) => {
                self.set_insert(target, key.clone())?;
            }
            DeltaKind::SetRemove(key) => {
                self.set_remove(target, key)?;
            }
            DeltaKind::ListInsert { index, value } => {
                self.list_insert(target, *index as usize, value.clone())?
            }
            DeltaKind::ListRemove { index } => {
                self.list_remove(target, *index as usize)?;
            }
            DeltaKind::ListSet { index, value } => self.list_set(target, *index as usize, value.clone())?,
            DeltaKind::ListReplace(values) => self.list_replace(target, values.clone())?,
            DeltaKind::ArraySet(values) => self.array_set(target, values.clone())?,
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::Scope;
    use crate::schema::Schema;
    use crate::value::{KeyKind, ValueKind};

    fn schema() -> Schema {
        let entry = Schema::composite()
            .field("name", Schema::text())
            .field("upper", Schema::text())
            .on_initialize(|tree, node| {
                let name = tree.child(node, "name")?;
                let upper = tree.child(node, "upper")?;
                tree.register_derived(upper, Scope::SelfOnly, &[name], move |t| {
                    Ok(Value::from(t.value(name)?.as_text().unwrap_or("").to_uppercase()))
                })?;
                Ok(())
            })
            .build();
        Schema::composite()
            .field("items", Schema::dictionary(KeyKind::Text, entry))
            .field("tags", Schema::set(KeyKind::Int))
            .field("path", Schema::list(ValueKind::Vector))
            .build()
    }

    #[test]
    fn test_primitive_keeps_latest_set() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        tree.clear_delta(items).unwrap();
        let name = tree.child(a, "name").unwrap();
        tree.set(name, "one").unwrap();
        tree.set(name, "two").unwrap();
        let delta = tree.serialize_delta(name, &filters::all).unwrap();
        assert_eq!(delta.ops.len(), 1);
        assert_eq!(delta.ops[0].kind, DeltaKind::Set(Value::from("two")));
    }

    #[test]
    fn test_initial_entry_state_rides_in_add() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let init = Snapshot::Composite(vec![(0, Snapshot::Value(Value::from("hi")))]);
        tree.add_entry_with(items, "a", &init).unwrap();
        let delta = tree.serialize_delta(items, &filters::all).unwrap();
        assert_eq!(delta.len(), 1);
        match &delta.ops[0].kind {
            DeltaKind::Add { key, init } => {
                assert_eq!(key, &Key::from("a"));
                // Derived fields were computed before the snapshot was taken.
                assert_eq!(
                    init,
                    &Snapshot::Composite(vec![
                        (0, Snapshot::Value(Value::from("hi"))),
                        (1, Snapshot::Value(Value::from("HI"))),
                    ])
                );
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_exclude_derived_filter() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        tree.clear_delta(items).unwrap();
        let name = tree.child(a, "name").unwrap();
        tree.set(name, "x").unwrap();
        assert_eq!(tree.serialize_delta(items, &filters::all).unwrap().len(), 2);
        let local = tree.serialize_delta(items, &filters::exclude_derived).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local.ops[0].path, NodePath::root().entry("a").field(0));
    }

    #[test]
    fn test_remote_apply_skips_derived_and_failures() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        tree.add_entry(items, "a").unwrap();
        tree.clear_delta(items).unwrap();
        let delta = Delta {
            ops: vec![
                DeltaOp {
                    path: NodePath::root().entry("a").field(1),
                    kind: DeltaKind::Set(Value::from("forged")),
                },
                DeltaOp {
                    path: NodePath::root(),
                    kind: DeltaKind::Remove { key: Key::from("ghost") },
                },
                DeltaOp {
                    path: NodePath::root().entry("a").field(0),
                    kind: DeltaKind::Set(Value::from("ok")),
                },
            ],
        };
        let report = tree.apply_delta(items, &delta, DeltaOrigin::Remote).unwrap();
        assert_eq!(report, ApplyReport { applied: 1, skipped: 2 });
        let a = tree.entry(items, &Key::from("a")).unwrap();
        let upper = tree.child(a, "upper").unwrap();
        assert_eq!(tree.value(upper).unwrap(), &Value::from("OK"));
        // Remote input is tracked so it can fan out.
        assert!(tree.has_delta(items).unwrap());
    }

    #[test]
    fn test_authority_apply_is_untracked_and_tolerant() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let root = tree.root();
        let items = tree.child(root, "items").unwrap();
        let tags = tree.child(root, "tags").unwrap();
        tree.add_entry(items, "a").unwrap();
        tree.clear_delta(root).unwrap();
        let init = Snapshot::Composite(vec![(0, Snapshot::Value(Value::from("new")))]);
        let delta = Delta {
            ops: vec![
                DeltaOp {
                    path: NodePath::root().field(0),
                    kind: DeltaKind::Add { key: Key::from("a"), init },
                },
                DeltaOp {
                    path: NodePath::root().field(0),
                    kind: DeltaKind::Remove { key: Key::from("zz") },
                },
                DeltaOp {
                    path: NodePath::root().field(1),
                    kind: DeltaKind::SetInsert(Key::Int(4)),
                },
            ],
        };
        let report = tree.apply_delta(root, &delta, DeltaOrigin::Authority).unwrap();
        assert_eq!(report, ApplyReport { applied: 2, skipped: 1 });
        let a = tree.entry(items, &Key::from("a")).unwrap();
        assert_eq!(tree.value(tree.child(a, "name").unwrap()).unwrap(), &Value::from("new"));
        assert!(tree.set_contains(tags, &Key::Int(4)).unwrap());
        let local = tree.serialize_delta(root, &filters::exclude_derived).unwrap();
        assert!(local.is_empty());
    }

    #[test]
    fn test_list_ops_replay() {
        let mut source = StateTree::initialize(schema()).unwrap();
        let mut mirror = StateTree::initialize(schema()).unwrap();
        let path = source.descend(source.root(), "path").unwrap();
        source.list_push(path, [0.0, 0.0]).unwrap();
        source.list_push(path, [1.0, 1.0]).unwrap();
        source.list_insert(path, 1, [0.5, 0.5]).unwrap();
        source.list_remove(path, 0).unwrap();
        source.list_set(path, 1, [2.0, 2.0]).unwrap();

        let delta = source.serialize_delta(source.root(), &filters::all).unwrap();
        let bytes = delta.encode().unwrap();
        let decoded = Delta::decode(&bytes).unwrap();
        let root = mirror.root();
        mirror.apply_delta(root, &decoded, DeltaOrigin::Authority).unwrap();
        let mirror_path = mirror.descend(root, "path").unwrap();
        assert_eq!(mirror.items(mirror_path).unwrap(), source.items(path).unwrap());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Delta::decode(&[0xff, 0xff, 0xff]), Err(StateError::Decode(_))));
    }
}
