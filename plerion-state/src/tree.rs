//! The state tree: node arena, navigation and the mutation path.
//!
//! Architecture:
//! ```text
//!   write (set / add_entry / remove_entry / ...)
//!        │
//!        ▼
//!   check_writable ── Disposed? derived outside its computation?
//!        │
//!        ▼
//!   mutate NodeData ──► record()
//!                         ├── pending delta op (if Active and tracking)
//!                         └── route NodeChange to observers (source + ancestors)
//!        │
//!        ▼
//!   end of outermost pass ──► flush(): direct observers, then derived by height
//! ```
//!
//! Every public write opens a pass; nested writes (inside an action, an
//! observer or a hook) join the enclosing pass. Notifications are delivered
//! once, when the outermost pass closes.
//!
//! All mutation happens on one logical apply thread. The tree is `Send` so it
//! can move between tasks, but it is never shared: cross-thread writers go
//! through [`crate::ActionSender`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use uuid::Uuid;

use crate::action::ActionQueue;
use crate::delta::{filters, DeltaKind};
use crate::error::{StateError, StateResult};
use crate::node::{Arena, Identity, Lifecycle, Node, NodeData, NodeId, NodeKind, NodePath, PathSegment};
use crate::observe::{ChangeType, NodeChange, Observers};
use crate::schema::Schema;
use crate::snapshot::Snapshot;
use crate::value::{Key, KeyKind, Value, ValueKind};

#[derive(Debug, Default)]
pub(crate) struct PassState {
    pub(crate) depth: u32,
    pub(crate) flushing: bool,
    /// Non-zero while applying authoritative state; writes are not tracked.
    pub(crate) suppress_tracking: u32,
    /// Non-zero while a derived computation (or derived observer) runs.
    pub(crate) derived_writers: u32,
}

/// A tree of observable nodes with a single root.
pub struct StateTree {
    id: Uuid,
    pub(crate) arena: Arena,
    root: NodeId,
    pub(crate) observers: Observers,
    pub(crate) pass: PassState,
    pub(crate) queue: ActionQueue,
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("nodes", &self.arena.live_count())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl StateTree {
    /// Build a tree from `schema`: instantiate the root and its composite
    /// children, activate them, and run post-initialize hooks bottom-up.
    pub fn initialize(schema: Schema) -> StateResult<Self> {
        let mut tree = Self {
            id: Uuid::new_v4(),
            arena: Arena::default(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            observers: Observers::default(),
            pass: PassState::default(),
            queue: ActionQueue::new(),
        };
        let root = tree.instantiate(&schema, Identity::Root, None);
        tree.root = root;
        tree.batch(|t| t.activate(root))?;
        // Initial state is not a delta.
        tree.clear_delta(root)?;
        log::debug!(
            "state tree {} initialized with {} nodes",
            tree.id,
            tree.arena.live_count()
        );
        Ok(tree)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.arena.live_count()
    }

    // ── Passes ───────────────────────────────────────────────

    /// Run `f` as one logical mutation. Observers are notified once the
    /// outermost batch closes, even if `f` failed part way.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> StateResult<R>) -> StateResult<R> {
        self.pass.depth += 1;
        let result = f(self);
        self.pass.depth -= 1;
        if self.pass.depth == 0 && !self.pass.flushing {
            let flushed = self.flush();
            let value = result?;
            flushed?;
            return Ok(value);
        }
        result
    }

    // ── Arena access ─────────────────────────────────────────

    pub(crate) fn node(&self, id: NodeId) -> StateResult<&Node> {
        self.arena.get(id).ok_or(StateError::Disposed(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> StateResult<&mut Node> {
        self.arena.get_mut(id).ok_or(StateError::Disposed(id))
    }

    pub(crate) fn schema_of(&self, id: NodeId) -> StateResult<&Schema> {
        Ok(&self.node(id)?.schema)
    }

    fn instantiate(&mut self, schema: &Schema, identity: Identity, parent: Option<NodeId>) -> NodeId {
        let data = match schema {
            Schema::Primitive { default, .. } => NodeData::Primitive(default.clone()),
            Schema::Composite(_) => NodeData::Composite(Vec::new()),
            Schema::Dictionary { .. } => NodeData::Dictionary(BTreeMap::new()),
            Schema::Set { .. } => NodeData::Set(BTreeSet::new()),
            Schema::List { .. } => NodeData::List(Vec::new()),
            Schema::Array { .. } => NodeData::Array(Vec::new()),
        };
        let id = self.arena.insert(Node {
            identity,
            parent,
            lifecycle: Lifecycle::Uninitialized,
            derived: false,
            schema: schema.clone(),
            data,
            pending: Vec::new(),
        });
        if let Schema::Composite(composite) = schema {
            let fields = composite
                .fields
                .iter()
                .enumerate()
                .map(|(index, field)| {
                    let identity = Identity::Field {
                        index: index as u16,
                        name: field.name.clone(),
                    };
                    self.instantiate(&field.schema, identity, Some(id))
                })
                .collect();
            if let Some(node) = self.arena.get_mut(id) {
                node.data = NodeData::Composite(fields);
            }
        }
        if let Some(node) = self.arena.get_mut(id) {
            node.lifecycle = Lifecycle::Initializing;
        }
        id
    }

    /// Mark a subtree Active top-down, then run composite hooks bottom-up.
    fn activate(&mut self, id: NodeId) -> StateResult<()> {
        let order = self.post_order(id)?;
        for node in order.iter().rev() {
            if let Some(n) = self.arena.get_mut(*node) {
                n.lifecycle = Lifecycle::Active;
            }
        }
        for node in order {
            let hook = match self.arena.get(node) {
                Some(n) if n.lifecycle == Lifecycle::Active => {
                    n.schema.as_composite().and_then(|c| c.hook.clone())
                }
                _ => None,
            };
            if let Some(hook) = hook {
                hook(self, node)?;
            }
        }
        Ok(())
    }

    pub(crate) fn post_order(&self, id: NodeId) -> StateResult<Vec<NodeId>> {
        fn walk(tree: &StateTree, id: NodeId, out: &mut Vec<NodeId>) -> StateResult<()> {
            for child in tree.node(id)?.data.children() {
                walk(tree, child, out)?;
            }
            out.push(id);
            Ok(())
        }
        let mut out = Vec::new();
        walk(self, id, &mut out)?;
        Ok(out)
    }

    /// `id` followed by each of its ancestors up to the root.
    pub(crate) fn ancestry(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = vec![id];
        let mut cursor = self.arena.get(id).and_then(|n| n.parent);
        while let Some(parent) = cursor {
            chain.push(parent);
            cursor = self.arena.get(parent).and_then(|n| n.parent);
        }
        chain
    }

    // ── Navigation ───────────────────────────────────────────

    pub fn parent(&self, id: NodeId) -> StateResult<Option<NodeId>> {
        Ok(self.node(id)?.parent)
    }

    pub fn kind(&self, id: NodeId) -> StateResult<NodeKind> {
        Ok(self.node(id)?.data.kind())
    }

    /// Lifecycle of `id`. Ids of removed nodes report `Disposed`.
    pub fn lifecycle(&self, id: NodeId) -> Lifecycle {
        self.arena
            .get(id)
            .map_or(Lifecycle::Disposed, |n| n.lifecycle)
    }

    pub fn is_derived(&self, id: NodeId) -> StateResult<bool> {
        Ok(self.node(id)?.derived)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.arena.get(id).is_some()
    }

    /// Composite field by name.
    pub fn child(&self, id: NodeId, field: &str) -> StateResult<NodeId> {
        let node = self.node(id)?;
        let NodeData::Composite(fields) = &node.data else {
            return Err(kind_mismatch(NodeKind::Composite, node));
        };
        node.schema
            .as_composite()
            .and_then(|c| c.field_index(field))
            .and_then(|i| fields.get(i as usize).copied())
            .ok_or_else(|| StateError::UnknownField {
                node: id,
                field: field.to_string(),
            })
    }

    /// Follow a `/`-separated chain of composite field names.
    pub fn descend(&self, id: NodeId, path: &str) -> StateResult<NodeId> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(id, |node, name| self.child(node, name))
    }

    pub(crate) fn field_at(&self, id: NodeId, index: u16) -> StateResult<Option<NodeId>> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Composite(fields) => Ok(fields.get(index as usize).copied()),
            _ => Err(kind_mismatch(NodeKind::Composite, node)),
        }
    }

    /// Field name of a composite child, `None` for the root and entries.
    pub fn field_name(&self, id: NodeId) -> StateResult<Option<&str>> {
        Ok(match &self.node(id)?.identity {
            Identity::Field { name, .. } => Some(name),
            _ => None,
        })
    }

    /// The key this entry was assigned when it was added.
    pub fn entry_key(&self, id: NodeId) -> StateResult<Option<&Key>> {
        Ok(match &self.node(id)?.identity {
            Identity::Entry(key) => Some(key),
            _ => None,
        })
    }

    pub fn entry(&self, dict: NodeId, key: &Key) -> StateResult<NodeId> {
        self.try_entry(dict, key)?
            .ok_or_else(|| StateError::MissingKey(key.clone()))
    }

    pub fn try_entry(&self, dict: NodeId, key: &Key) -> StateResult<Option<NodeId>> {
        let node = self.node(dict)?;
        match &node.data {
            NodeData::Dictionary(entries) => Ok(entries.get(key).copied()),
            _ => Err(kind_mismatch(NodeKind::Dictionary, node)),
        }
    }

    /// Dictionary entries in key order.
    pub fn entries(&self, dict: NodeId) -> StateResult<Vec<(Key, NodeId)>> {
        let node = self.node(dict)?;
        match &node.data {
            NodeData::Dictionary(entries) => {
                Ok(entries.iter().map(|(k, v)| (k.clone(), *v)).collect())
            }
            _ => Err(kind_mismatch(NodeKind::Dictionary, node)),
        }
    }

    /// Keys of a dictionary or set, in order.
    pub fn keys(&self, id: NodeId) -> StateResult<Vec<Key>> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Dictionary(entries) => Ok(entries.keys().cloned().collect()),
            NodeData::Set(keys) => Ok(keys.iter().cloned().collect()),
            _ => Err(kind_mismatch(NodeKind::Dictionary, node)),
        }
    }

    pub fn contains_key(&self, id: NodeId, key: &Key) -> StateResult<bool> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Dictionary(entries) => Ok(entries.contains_key(key)),
            NodeData::Set(keys) => Ok(keys.contains(key)),
            _ => Err(kind_mismatch(NodeKind::Dictionary, node)),
        }
    }

    pub fn set_contains(&self, set: NodeId, key: &Key) -> StateResult<bool> {
        let node = self.node(set)?;
        match &node.data {
            NodeData::Set(keys) => Ok(keys.contains(key)),
            _ => Err(kind_mismatch(NodeKind::Set, node)),
        }
    }

    pub fn value(&self, id: NodeId) -> StateResult<&Value> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Primitive(value) => Ok(value),
            _ => Err(kind_mismatch(NodeKind::Primitive, node)),
        }
    }

    /// Items of a list or array.
    pub fn items(&self, id: NodeId) -> StateResult<&[Value]> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::List(items) | NodeData::Array(items) => Ok(items),
            _ => Err(kind_mismatch(NodeKind::List, node)),
        }
    }

    /// Number of entries, keys, items or fields. Primitives have length 1.
    pub fn len(&self, id: NodeId) -> StateResult<usize> {
        Ok(match &self.node(id)?.data {
            NodeData::Primitive(_) => 1,
            NodeData::Composite(fields) => fields.len(),
            NodeData::Dictionary(entries) => entries.len(),
            NodeData::Set(keys) => keys.len(),
            NodeData::List(items) | NodeData::Array(items) => items.len(),
        })
    }

    /// Path of `id` from the root.
    pub fn path_of(&self, id: NodeId) -> StateResult<NodePath> {
        self.path_from(self.root, id)
    }

    /// Path of `id` relative to its ancestor `base`.
    pub fn path_from(&self, base: NodeId, id: NodeId) -> StateResult<NodePath> {
        let mut segments = Vec::new();
        let mut cursor = id;
        while cursor != base {
            let node = self.node(cursor)?;
            segments.push(match &node.identity {
                Identity::Field { index, .. } => PathSegment::Field(*index),
                Identity::Entry(key) => PathSegment::Entry(key.clone()),
                Identity::Root => {
                    return Err(StateError::PathNotFound(format!("{base} is not an ancestor of {id}")))
                }
            });
            cursor = node
                .parent
                .ok_or_else(|| StateError::PathNotFound(format!("{base} is not an ancestor of {id}")))?;
        }
        segments.reverse();
        Ok(NodePath(segments))
    }

    pub fn resolve(&self, path: &NodePath) -> StateResult<NodeId> {
        self.resolve_from(self.root, path)
    }

    pub fn resolve_from(&self, base: NodeId, path: &NodePath) -> StateResult<NodeId> {
        let not_found = || StateError::PathNotFound(path.to_string());
        path.segments().iter().try_fold(base, |node, segment| match segment {
            PathSegment::Field(index) => self.field_at(node, *index)?.ok_or_else(not_found),
            PathSegment::Entry(key) => self.try_entry(node, key)?.ok_or_else(not_found),
        })
    }

    // ── Mutation path ────────────────────────────────────────

    fn check_writable(&self, id: NodeId) -> StateResult<&Node> {
        let node = self.node(id)?;
        if node.lifecycle >= Lifecycle::Disposing {
            return Err(StateError::Disposed(id));
        }
        if node.derived && node.lifecycle == Lifecycle::Active && self.pass.derived_writers == 0 {
            return Err(StateError::DerivedNode(id));
        }
        Ok(node)
    }

    /// Whether a write to `id` would currently be refused for being derived.
    pub(crate) fn derived_locked(&self, id: NodeId) -> StateResult<bool> {
        let node = self.node(id)?;
        Ok(node.derived && node.lifecycle == Lifecycle::Active && self.pass.derived_writers == 0)
    }

    /// Record a change on an Active node: queue its delta op and route the
    /// notification.
    pub(crate) fn record(&mut self, change: NodeChange, delta: Option<DeltaKind>) {
        let source = change.source;
        let tracking = self.pass.suppress_tracking == 0;
        let Some(node) = self.arena.get_mut(source) else {
            return;
        };
        if node.lifecycle != Lifecycle::Active {
            return;
        }
        if let (true, Some(op)) = (tracking, delta) {
            crate::delta::enqueue(&mut node.pending, op);
        }
        let chain = self.ancestry(source);
        self.observers.route(change, &chain);
    }

    /// Set a primitive's value. Setting an equal value is a no-op.
    pub fn set(&mut self, id: NodeId, value: impl Into<Value>) -> StateResult<()> {
        let value = value.into();
        self.batch(|tree| tree.write_value(id, value))
    }

    pub(crate) fn write_value(&mut self, id: NodeId, value: Value) -> StateResult<()> {
        let node = self.check_writable(id)?;
        let value = match &node.schema {
            Schema::Primitive { kind, nullable, .. } => coerce(value, *kind, *nullable)?,
            _ => return Err(kind_mismatch(NodeKind::Primitive, node)),
        };
        let NodeData::Primitive(slot) = &mut self.node_mut(id)?.data else {
            return Ok(());
        };
        if *slot == value {
            return Ok(());
        }
        let previous = std::mem::replace(slot, value.clone());
        self.record(
            NodeChange::new(id, ChangeType::Set)
                .with_values(Some(previous), Some(value.clone())),
            Some(DeltaKind::Set(value)),
        );
        Ok(())
    }

    /// Add a default-initialized entry. The key is assigned here, once.
    pub fn add_entry(&mut self, dict: NodeId, key: impl Into<Key>) -> StateResult<NodeId> {
        let key = key.into();
        self.batch(|tree| tree.insert_entry(dict, key, None))
    }

    /// Add an entry populated from `init` before it becomes observable.
    pub fn add_entry_with(
        &mut self,
        dict: NodeId,
        key: impl Into<Key>,
        init: &Snapshot,
    ) -> StateResult<NodeId> {
        let key = key.into();
        self.batch(|tree| tree.insert_entry(dict, key, Some(init)))
    }

    fn insert_entry(&mut self, dict: NodeId, key: Key, init: Option<&Snapshot>) -> StateResult<NodeId> {
        let node = self.check_writable(dict)?;
        let (key_kind, entry_schema) = match (&node.schema, &node.data) {
            (Schema::Dictionary { key: kind, entry }, NodeData::Dictionary(entries)) => {
                if entries.contains_key(&key) {
                    return Err(StateError::DuplicateKey(key));
                }
                (*kind, entry.clone())
            }
            _ => return Err(kind_mismatch(NodeKind::Dictionary, node)),
        };
        check_key(&key, key_kind)?;
        let dict_active = node.lifecycle == Lifecycle::Active;

        let entry = self.instantiate(&entry_schema, Identity::Entry(key.clone()), Some(dict));
        if let Some(init) = init {
            if let Err(e) = self.apply_snapshot(entry, init) {
                self.discard(entry);
                return Err(e);
            }
        }
        if let NodeData::Dictionary(entries) = &mut self.node_mut(dict)?.data {
            entries.insert(key.clone(), entry);
        }
        if !dict_active {
            return Ok(entry);
        }

        self.activate(entry)?;
        let init = self.snapshot(entry, &filters::all)?;
        // The entry's own initial state travels inside the Add.
        for id in self.post_order(entry)? {
            if let Some(n) = self.arena.get_mut(id) {
                n.pending.clear();
            }
        }
        self.record(
            NodeChange::new(dict, ChangeType::Add).with_key(key.clone()),
            Some(DeltaKind::Add { key, init }),
        );
        Ok(entry)
    }

    /// Remove an entry and dispose its subtree.
    pub fn remove_entry(&mut self, dict: NodeId, key: &Key) -> StateResult<()> {
        self.batch(|tree| {
            let node = tree.check_writable(dict)?;
            let NodeData::Dictionary(entries) = &node.data else {
                return Err(kind_mismatch(NodeKind::Dictionary, node));
            };
            if !entries.contains_key(key) {
                return Err(StateError::MissingKey(key.clone()));
            }
            let entry = match &mut tree.node_mut(dict)?.data {
                NodeData::Dictionary(entries) => entries.remove(key),
                _ => None,
            };
            tree.record(
                NodeChange::new(dict, ChangeType::Remove).with_key(key.clone()),
                Some(DeltaKind::Remove { key: key.clone() }),
            );
            if let Some(entry) = entry {
                tree.dispose_subtree(entry)?;
            }
            Ok(())
        })
    }

    /// Dispose a node. Entries are removed from their dictionary; disposing
    /// the root disposes the whole tree. Composite fields live and die with
    /// their owner.
    pub fn dispose(&mut self, id: NodeId) -> StateResult<()> {
        let node = self.node(id)?;
        match (node.identity.clone(), node.parent) {
            (Identity::Entry(key), Some(parent)) => self.remove_entry(parent, &key),
            (Identity::Root, _) => self.batch(|tree| tree.dispose_subtree(id)),
            _ => Err(StateError::FixedField(id)),
        }
    }

    fn dispose_subtree(&mut self, id: NodeId) -> StateResult<()> {
        let order = self.post_order(id)?;
        for node in &order {
            if let Some(n) = self.arena.get_mut(*node) {
                n.lifecycle = Lifecycle::Disposing;
            }
        }
        for node in order {
            self.observers.dispose_node(node);
            if let Some(mut n) = self.arena.remove(node) {
                n.lifecycle = Lifecycle::Disposed;
            }
        }
        log::trace!("disposed subtree at {id}");
        Ok(())
    }

    /// Drop a never-activated subtree without notifications.
    fn discard(&mut self, id: NodeId) {
        if let Ok(order) = self.post_order(id) {
            for node in order {
                self.arena.remove(node);
            }
        }
    }

    /// Insert a key into a set. Returns `false` if it was already present.
    pub fn set_insert(&mut self, set: NodeId, key: impl Into<Key>) -> StateResult<bool> {
        let key = key.into();
        self.batch(|tree| {
            let node = tree.check_writable(set)?;
            let Schema::Set { key: kind } = &node.schema else {
                return Err(kind_mismatch(NodeKind::Set, node));
            };
            check_key(&key, *kind)?;
            let inserted = match &mut tree.node_mut(set)?.data {
                NodeData::Set(keys) => keys.insert(key.clone()),
                _ => false,
            };
            if inserted {
                tree.record(
                    NodeChange::new(set, ChangeType::Add).with_key(key.clone()),
                    Some(DeltaKind::SetInsert(key)),
                );
            }
            Ok(inserted)
        })
    }

    /// Remove a key from a set. Returns `false` if it was absent.
    pub fn set_remove(&mut self, set: NodeId, key: &Key) -> StateResult<bool> {
        self.batch(|tree| {
            let node = tree.check_writable(set)?;
            if node.data.kind() != NodeKind::Set {
                return Err(kind_mismatch(NodeKind::Set, node));
            }
            let removed = match &mut tree.node_mut(set)?.data {
                NodeData::Set(keys) => keys.remove(key),
                _ => false,
            };
            if removed {
                tree.record(
                    NodeChange::new(set, ChangeType::Remove).with_key(key.clone()),
                    Some(DeltaKind::SetRemove(key.clone())),
                );
            }
            Ok(removed)
        })
    }

    /// Make a set hold exactly `keys`, as individual inserts and removals.
    pub fn set_replace(&mut self, set: NodeId, keys: impl IntoIterator<Item = Key>) -> StateResult<()> {
        let wanted: BTreeSet<Key> = keys.into_iter().collect();
        self.batch(|tree| {
            let current: BTreeSet<Key> = tree.keys(set)?.into_iter().collect();
            for stale in current.difference(&wanted) {
                tree.set_remove(set, stale)?;
            }
            for fresh in wanted.difference(&current) {
                tree.set_insert(set, fresh.clone())?;
            }
            Ok(())
        })
    }

    pub fn list_push(&mut self, list: NodeId, value: impl Into<Value>) -> StateResult<()> {
        let value = value.into();
        self.batch(|tree| {
            let index = tree.len(list)?;
            tree.list_insert_at(list, index, value)
        })
    }

    pub fn list_insert(&mut self, list: NodeId, index: usize, value: impl Into<Value>) -> StateResult<()> {
        let value = value.into();
        self.batch(|tree| tree.list_insert_at(list, index, value))
    }

    fn list_insert_at(&mut self, list: NodeId, index: usize, value: Value) -> StateResult<()> {
        let value = self.check_element(list, NodeKind::List, value)?;
        let NodeData::List(items) = &mut self.node_mut(list)?.data else {
            return Ok(());
        };
        if index > items.len() {
            return Err(StateError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        items.insert(index, value.clone());
        self.record(
            NodeChange::new(list, ChangeType::Add)
                .with_key(Key::Int(index as i64))
                .with_values(None, Some(value.clone())),
            Some(DeltaKind::ListInsert {
                index: index as u32,
                value,
            }),
        );
        Ok(())
    }

    pub fn list_remove(&mut self, list: NodeId, index: usize) -> StateResult<Value> {
        self.batch(|tree| {
            let node = tree.check_writable(list)?;
            if node.data.kind() != NodeKind::List {
                return Err(kind_mismatch(NodeKind::List, node));
            }
            let NodeData::List(items) = &mut tree.node_mut(list)?.data else {
                return Err(StateError::Disposed(list));
            };
            if index >= items.len() {
                return Err(StateError::IndexOutOfRange {
                    index,
                    len: items.len(),
                });
            }
            let removed = items.remove(index);
            tree.record(
                NodeChange::new(list, ChangeType::Remove)
                    .with_key(Key::Int(index as i64))
                    .with_values(Some(removed.clone()), None),
                Some(DeltaKind::ListRemove {
                    index: index as u32,
                }),
            );
            Ok(removed)
        })
    }

    pub fn list_set(&mut self, list: NodeId, index: usize, value: impl Into<Value>) -> StateResult<()> {
        let value = value.into();
        self.batch(|tree| {
            let value = tree.check_element(list, NodeKind::List, value)?;
            let NodeData::List(items) = &mut tree.node_mut(list)?.data else {
                return Ok(());
            };
            let len = items.len();
            let slot = items
                .get_mut(index)
                .ok_or(StateError::IndexOutOfRange { index, len })?;
            if *slot == value {
                return Ok(());
            }
            let previous = std::mem::replace(slot, value.clone());
            tree.record(
                NodeChange::new(list, ChangeType::Set)
                    .with_key(Key::Int(index as i64))
                    .with_values(Some(previous), Some(value.clone())),
                Some(DeltaKind::ListSet {
                    index: index as u32,
                    value,
                }),
            );
            Ok(())
        })
    }

    /// Replace a list's contents wholesale.
    pub fn list_replace(&mut self, list: NodeId, values: Vec<Value>) -> StateResult<()> {
        self.batch(|tree| tree.replace_items(list, NodeKind::List, values))
    }

    /// Bulk-set an array. Arrays have no per-item operations.
    pub fn array_set(&mut self, array: NodeId, values: Vec<Value>) -> StateResult<()> {
        self.batch(|tree| tree.replace_items(array, NodeKind::Array, values))
    }

    fn replace_items(&mut self, id: NodeId, kind: NodeKind, values: Vec<Value>) -> StateResult<()> {
        let values = values
            .into_iter()
            .map(|v| self.check_element(id, kind, v))
            .collect::<StateResult<Vec<_>>>()?;
        let node = self.node_mut(id)?;
        let (NodeData::List(items) | NodeData::Array(items)) = &mut node.data else {
            return Ok(());
        };
        if *items == values {
            return Ok(());
        }
        *items = values.clone();
        let op = match kind {
            NodeKind::Array => DeltaKind::ArraySet(values),
            _ => DeltaKind::ListReplace(values),
        };
        self.record(NodeChange::new(id, ChangeType::Set), Some(op));
        Ok(())
    }

    /// Check that `id` is a writable collection of `kind` and coerce `value`
    /// to its element kind.
    fn check_element(&self, id: NodeId, kind: NodeKind, value: Value) -> StateResult<Value> {
        let node = self.check_writable(id)?;
        match (&node.schema, kind) {
            (Schema::List { element }, NodeKind::List) | (Schema::Array { element }, NodeKind::Array) => {
                coerce(value, *element, false)
            }
            _ => Err(kind_mismatch(kind, node)),
        }
    }
}

fn kind_mismatch(expected: NodeKind, node: &Node) -> StateError {
    StateError::KindMismatch {
        expected,
        found: node.data.kind(),
    }
}

fn check_key(key: &Key, kind: KeyKind) -> StateResult<()> {
    if key.kind() == kind {
        Ok(())
    } else {
        Err(StateError::KeyMismatch {
            expected: kind,
            found: key.kind(),
        })
    }
}

fn coerce(value: Value, kind: ValueKind, nullable: bool) -> StateResult<Value> {
    match (value, kind) {
        (Value::Null, _) if nullable => Ok(Value::Null),
        (Value::Int(i), ValueKind::Float) => Ok(Value::Float(i as f64)),
        (value, kind) if value.kind() == kind => Ok(value),
        (value, kind) => Err(StateError::TypeMismatch {
            expected: kind,
            found: value.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::KeyKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn entry_schema() -> Schema {
        Schema::composite()
            .field("name", Schema::text())
            .field("score", Schema::float())
            .field("parent", Schema::nullable(ValueKind::Text))
            .build()
    }

    fn root_schema() -> Schema {
        Schema::composite()
            .field("title", Schema::with_default("untitled"))
            .field("items", Schema::dictionary(KeyKind::Text, entry_schema()))
            .field("tags", Schema::set(KeyKind::Text))
            .field("log", Schema::list(ValueKind::Text))
            .field("pose", Schema::array(ValueKind::Float))
            .build()
    }

    #[test]
    fn test_initialize_builds_composite_children() {
        let tree = StateTree::initialize(root_schema()).unwrap();
        let root = tree.root();
        assert_eq!(tree.lifecycle(root), Lifecycle::Active);
        assert_eq!(tree.len(root).unwrap(), 5);
        let title = tree.child(root, "title").unwrap();
        assert_eq!(tree.value(title).unwrap(), &Value::from("untitled"));
        assert_eq!(tree.field_name(title).unwrap(), Some("title"));
        assert_eq!(tree.parent(title).unwrap(), Some(root));
        assert!(matches!(
            tree.child(root, "nope"),
            Err(StateError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_set_type_checks_and_coerces() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        let score = tree.child(a, "score").unwrap();
        tree.set(score, 3).unwrap();
        assert_eq!(tree.value(score).unwrap(), &Value::Float(3.0));
        assert!(matches!(
            tree.set(score, "high"),
            Err(StateError::TypeMismatch { .. })
        ));
        let parent = tree.child(a, "parent").unwrap();
        tree.set(parent, "root").unwrap();
        tree.set(parent, Value::Null).unwrap();
        assert!(tree.value(parent).unwrap().is_null());
    }

    #[test]
    fn test_duplicate_and_missing_keys() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        tree.add_entry(items, "a").unwrap();
        assert_eq!(
            tree.add_entry(items, "a").unwrap_err(),
            StateError::DuplicateKey(Key::from("a"))
        );
        assert_eq!(
            tree.remove_entry(items, &Key::from("b")).unwrap_err(),
            StateError::MissingKey(Key::from("b"))
        );
        assert!(matches!(
            tree.add_entry(items, 7),
            Err(StateError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_removed_entry_is_disposed() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        let name = tree.child(a, "name").unwrap();
        tree.remove_entry(items, &Key::from("a")).unwrap();
        assert_eq!(tree.lifecycle(a), Lifecycle::Disposed);
        assert_eq!(tree.set(name, "x").unwrap_err(), StateError::Disposed(name));

        // The slot is reused, but the stale id never aliases the new entry.
        let b = tree.add_entry(items, "b").unwrap();
        assert_ne!(a, b);
        assert_eq!(tree.lifecycle(a), Lifecycle::Disposed);
    }

    #[test]
    fn test_entry_key_assigned_once() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        let name = tree.child(a, "name").unwrap();
        for i in 0..10 {
            tree.set(name, format!("n{i}")).unwrap();
        }
        assert_eq!(tree.entry_key(a).unwrap(), Some(&Key::from("a")));
        assert_eq!(tree.entry(items, &Key::from("a")).unwrap(), a);
    }

    #[test]
    fn test_paths_resolve() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        let name = tree.child(a, "name").unwrap();
        let path = tree.path_of(name).unwrap();
        assert_eq!(path, NodePath::root().field(1).entry("a").field(0));
        assert_eq!(tree.resolve(&path).unwrap(), name);
        assert_eq!(tree.path_from(items, name).unwrap(), NodePath::root().entry("a").field(0));
        assert!(tree.resolve(&NodePath::root().field(1).entry("zz")).is_err());
    }

    #[test]
    fn test_set_list_array_ops() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let root = tree.root();
        let tags = tree.child(root, "tags").unwrap();
        assert!(tree.set_insert(tags, "red").unwrap());
        assert!(!tree.set_insert(tags, "red").unwrap());
        tree.set_replace(tags, vec![Key::from("blue"), Key::from("green")]).unwrap();
        assert_eq!(tree.keys(tags).unwrap(), vec![Key::from("blue"), Key::from("green")]);
        assert!(tree.set_remove(tags, &Key::from("blue")).unwrap());
        assert!(!tree.set_contains(tags, &Key::from("blue")).unwrap());

        let log = tree.child(root, "log").unwrap();
        tree.list_push(log, "a").unwrap();
        tree.list_push(log, "c").unwrap();
        tree.list_insert(log, 1, "b").unwrap();
        tree.list_set(log, 2, "d").unwrap();
        assert_eq!(tree.list_remove(log, 0).unwrap(), Value::from("a"));
        assert_eq!(tree.items(log).unwrap(), &[Value::from("b"), Value::from("d")]);
        assert!(matches!(
            tree.list_remove(log, 5),
            Err(StateError::IndexOutOfRange { index: 5, len: 2 })
        ));

        let pose = tree.child(root, "pose").unwrap();
        tree.array_set(pose, vec![Value::from(1.0), Value::from(2)]).unwrap();
        assert_eq!(tree.items(pose).unwrap(), &[Value::Float(1.0), Value::Float(2.0)]);
    }

    #[test]
    fn test_hooks_run_once_per_instance() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let entry = Schema::composite()
            .field("name", Schema::text())
            .on_initialize(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();
        let schema = Schema::composite()
            .field("items", Schema::dictionary(KeyKind::Int, entry))
            .build();
        let mut tree = StateTree::initialize(schema).unwrap();
        let items = tree.descend(tree.root(), "items").unwrap();
        tree.add_entry(items, 1).unwrap();
        tree.add_entry(items, 2).unwrap();
        let one = tree.entry(items, &Key::Int(1)).unwrap();
        let name = tree.child(one, "name").unwrap();
        tree.set(name, "x").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispose_rules() {
        let mut tree = StateTree::initialize(root_schema()).unwrap();
        let root = tree.root();
        let items = tree.child(root, "items").unwrap();
        let a = tree.add_entry(items, "a").unwrap();
        assert_eq!(tree.dispose(items).unwrap_err(), StateError::FixedField(items));
        tree.dispose(a).unwrap();
        assert!(!tree.contains_key(items, &Key::from("a")).unwrap());
        tree.dispose(root).unwrap();
        assert_eq!(tree.lifecycle(root), Lifecycle::Disposed);
        assert_eq!(tree.node_count(), 0);
    }
}
