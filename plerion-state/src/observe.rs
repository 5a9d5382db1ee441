//! Observation context: who is watching which node, and in what order
//! they hear about changes.
//!
//! Architecture:
//! ```text
//!   record(change)
//!        │  route along source → parent → ... → root
//!        ▼
//!   ┌──────────────────────────────┐
//!   │ watchers: NodeId → [obs]     │  depth 0: any scope
//!   │                              │  depth>0: Scope::All only
//!   └──────────────┬───────────────┘
//!                  ▼
//!   registration.pending += change, mark dirty
//!                  │
//!   flush (end of outermost pass):
//!     loop {
//!       dirty direct observer?  → run it (registration order)
//!       else dirty derived?     → run lowest height first
//!       else                    → done
//!     }
//! ```
//!
//! A derived registration only runs once every direct observer touched by
//! the same pass has run, and a derived value that reads another derived
//! value is ranked above it, so it never sees the upstream value stale.
//!
//! Callbacks are taken out of their slot while they run. A callback may
//! deregister any observer, itself included; a callback whose registration
//! is gone when it returns is simply dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::{StateError, StateResult};
use crate::node::NodeId;
use crate::tree::StateTree;
use crate::value::{Key, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

/// Which changes reach an observer of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    /// Only changes whose source is the watched node itself.
    SelfOnly,
    /// Changes anywhere in the watched node's subtree.
    #[default]
    All,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObserverOptions {
    pub scope: Scope,
    /// Runs after direct observers and may write derived nodes.
    pub derived: bool,
    /// Deregister automatically when this node is disposed.
    pub owner: Option<NodeId>,
}

impl ObserverOptions {
    pub fn scope(scope: Scope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn owned_by(mut self, owner: NodeId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn derived(mut self) -> Self {
        self.derived = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Set,
    Add,
    Remove,
    Dispose,
}

/// One mutation as seen by an observer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeChange {
    pub source: NodeId,
    pub change_type: ChangeType,
    /// Entry key for Add/Remove, item index for list operations.
    pub key: Option<Key>,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

impl NodeChange {
    pub(crate) fn new(source: NodeId, change_type: ChangeType) -> Self {
        Self {
            source,
            change_type,
            key: None,
            previous: None,
            current: None,
        }
    }

    pub(crate) fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    pub(crate) fn with_values(mut self, previous: Option<Value>, current: Option<Value>) -> Self {
        self.previous = previous;
        self.current = current;
        self
    }
}

/// A batch of changes delivered to one observer.
#[derive(Debug, Clone)]
pub struct NodeChangeEventArgs {
    pub observer: ObserverId,
    /// `true` exactly once: the synthetic call made at registration.
    pub initialize: bool,
    pub changes: Vec<NodeChange>,
}

impl NodeChangeEventArgs {
    /// Most recent change whose source is `node`.
    pub fn change_for(&self, node: NodeId) -> Option<&NodeChange> {
        self.changes.iter().rev().find(|c| c.source == node)
    }

    pub fn touched(&self, node: NodeId) -> bool {
        self.changes.iter().any(|c| c.source == node)
    }
}

pub type ObserverCallback =
    Box<dyn FnMut(&mut StateTree, &NodeChangeEventArgs) -> StateResult<()> + Send>;

struct Registration {
    options: ObserverOptions,
    watched: Vec<NodeId>,
    callback: Option<ObserverCallback>,
    pending: Vec<NodeChange>,
    height: u32,
    /// Node written by this registration when it backs a derived value.
    target: Option<NodeId>,
}

#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    registrations: BTreeMap<ObserverId, Registration>,
    watchers: FxHashMap<NodeId, Vec<ObserverId>>,
    owned: FxHashMap<NodeId, Vec<ObserverId>>,
    pub(crate) derived_by_target: FxHashMap<NodeId, ObserverId>,
    dirty_direct: BTreeSet<ObserverId>,
    dirty_derived: BTreeSet<(u32, ObserverId)>,
}

impl Observers {
    pub(crate) fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Deliver `change` to watchers of its source (any scope) and of each
    /// ancestor in `chain[1..]` (scope All). Each observer gets it once.
    pub(crate) fn route(&mut self, change: NodeChange, chain: &[NodeId]) {
        let mut hit: Vec<ObserverId> = Vec::new();
        for (depth, node) in chain.iter().enumerate() {
            let Some(list) = self.watchers.get(node) else {
                continue;
            };
            for id in list {
                let Some(reg) = self.registrations.get(id) else {
                    continue;
                };
                if (depth == 0 || reg.options.scope == Scope::All) && !hit.contains(id) {
                    hit.push(*id);
                }
            }
        }
        for id in hit {
            self.push_change(id, change.clone());
        }
    }

    fn push_change(&mut self, id: ObserverId, change: NodeChange) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        reg.pending.push(change);
        if reg.options.derived {
            self.dirty_derived.insert((reg.height, id));
        } else {
            self.dirty_direct.insert(id);
        }
    }

    fn next_dirty(&mut self) -> Option<ObserverId> {
        self.dirty_direct
            .pop_first()
            .or_else(|| self.dirty_derived.pop_first().map(|(_, id)| id))
    }

    /// A node is going away: tell its direct watchers, unhook it, and drop
    /// registrations it owns or whose derived value it holds.
    pub(crate) fn dispose_node(&mut self, node: NodeId) {
        if let Some(list) = self.watchers.remove(&node) {
            for id in list {
                self.push_change(id, NodeChange::new(node, ChangeType::Dispose));
                if let Some(reg) = self.registrations.get_mut(&id) {
                    reg.watched.retain(|w| *w != node);
                }
            }
        }
        let mut doomed = self.owned.remove(&node).unwrap_or_default();
        if let Some(id) = self.derived_by_target.remove(&node) {
            doomed.push(id);
        }
        for id in doomed {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: ObserverId) -> Option<Registration> {
        let reg = self.registrations.remove(&id)?;
        for node in &reg.watched {
            if let Some(list) = self.watchers.get_mut(node) {
                list.retain(|w| *w != id);
                if list.is_empty() {
                    self.watchers.remove(node);
                }
            }
        }
        if let Some(owner) = reg.options.owner {
            if let Some(list) = self.owned.get_mut(&owner) {
                list.retain(|w| *w != id);
            }
        }
        if let Some(target) = reg.target {
            if self.derived_by_target.get(&target) == Some(&id) {
                self.derived_by_target.remove(&target);
            }
        }
        self.dirty_direct.remove(&id);
        self.dirty_derived.remove(&(reg.height, id));
        Some(reg)
    }

    pub(crate) fn height_of(&self, id: ObserverId) -> Option<u32> {
        self.registrations.get(&id).map(|r| r.height)
    }

    pub(crate) fn bind_target(&mut self, id: ObserverId, target: NodeId) {
        if let Some(reg) = self.registrations.get_mut(&id) {
            reg.target = Some(target);
            self.derived_by_target.insert(target, id);
        }
    }

    /// Move a derived registration to `height`, keeping its dirty entry in
    /// step. Returns the node it writes.
    fn set_height(&mut self, id: ObserverId, height: u32) -> Option<NodeId> {
        let reg = self.registrations.get_mut(&id)?;
        let old = std::mem::replace(&mut reg.height, height);
        let target = reg.target;
        if self.dirty_derived.remove(&(old, id)) {
            self.dirty_derived.insert((height, id));
        }
        target
    }
}

impl StateTree {
    /// Watch `nodes`. The callback runs immediately with `initialize = true`,
    /// then once per pass in which a watched change happened.
    ///
    /// If the initial call fails the registration is dropped and the error
    /// returned.
    pub fn register_observer<F>(
        &mut self,
        options: ObserverOptions,
        nodes: &[NodeId],
        callback: F,
    ) -> StateResult<ObserverId>
    where
        F: FnMut(&mut StateTree, &NodeChangeEventArgs) -> StateResult<()> + Send + 'static,
    {
        for node in nodes.iter().chain(options.owner.iter()) {
            self.node(*node)?;
        }
        let height = if options.derived {
            self.derived_height(nodes, options.scope, None)
        } else {
            0
        };

        let observers = &mut self.observers;
        observers.next_id += 1;
        let id = ObserverId(observers.next_id);
        let mut watched = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !watched.contains(node) {
                watched.push(*node);
                observers.watchers.entry(*node).or_default().push(id);
            }
        }
        if let Some(owner) = options.owner {
            observers.owned.entry(owner).or_default().push(id);
        }
        observers.registrations.insert(
            id,
            Registration {
                options,
                watched,
                callback: Some(Box::new(callback)),
                pending: Vec::new(),
                height,
                target: None,
            },
        );
        log::trace!("registered {id} on {} node(s), height {height}", nodes.len());

        if let Err(e) = self.notify(id, true) {
            self.observers.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Watch additional nodes with an existing registration. No new
    /// `initialize` call is made.
    pub fn extend_observer(&mut self, id: ObserverId, nodes: &[NodeId]) -> StateResult<()> {
        for node in nodes {
            self.node(*node)?;
        }
        let reg = self
            .observers
            .registrations
            .get(&id)
            .ok_or(StateError::UnknownObserver(id))?;
        let (derived, scope, old_height) = (reg.options.derived, reg.options.scope, reg.height);

        let observers = &mut self.observers;
        if let Some(reg) = observers.registrations.get_mut(&id) {
            for node in nodes {
                if !reg.watched.contains(node) {
                    reg.watched.push(*node);
                    observers.watchers.entry(*node).or_default().push(id);
                }
            }
        }
        if derived {
            let watched = self
                .observers
                .registrations
                .get(&id)
                .map(|r| r.watched.clone())
                .unwrap_or_default();
            let height = self.derived_height(&watched, scope, Some(id));
            if height != old_height {
                if let Some(target) = self.observers.set_height(id, height) {
                    self.raise_readers(target, height);
                }
            }
        }
        Ok(())
    }

    /// Remove a registration and all its subscriptions. If it backed a
    /// derived value, that node becomes writable again.
    pub fn deregister_observer(&mut self, id: ObserverId) -> StateResult<()> {
        let reg = self
            .observers
            .remove(id)
            .ok_or(StateError::UnknownObserver(id))?;
        if let Some(target) = reg.target {
            if let Some(node) = self.arena.get_mut(target) {
                node.derived = false;
            }
        }
        log::trace!("deregistered {id}");
        Ok(())
    }

    pub fn is_registered(&self, id: ObserverId) -> bool {
        self.observers.registrations.contains_key(&id)
    }

    /// Height a derived registration watching `nodes` gets: one above the
    /// highest derived value it can read.
    pub(crate) fn derived_height(&self, nodes: &[NodeId], scope: Scope, own: Option<ObserverId>) -> u32 {
        let mut height = 0;
        for (target, id) in &self.observers.derived_by_target {
            if Some(*id) == own {
                continue;
            }
            let reads = match scope {
                Scope::SelfOnly => nodes.contains(target),
                Scope::All => self.ancestry(*target).iter().any(|n| nodes.contains(n)),
            };
            if reads {
                height = height.max(self.observers.height_of(*id).unwrap_or(0));
            }
        }
        height + 1
    }

    /// `target` is now written at `height`: lift every derived registration
    /// that reads it above that, and so on downstream. Registrations made
    /// before their dependency became derived are ranked here.
    pub(crate) fn raise_readers(&mut self, target: NodeId, height: u32) {
        // No acyclic chain is taller than the registration count.
        let ceiling = self.observers.registrations.len() as u32 + 1;
        let mut work = vec![(target, height)];
        while let Some((target, height)) = work.pop() {
            let mut readers: Vec<ObserverId> = Vec::new();
            for (depth, node) in self.ancestry(target).iter().enumerate() {
                let Some(list) = self.observers.watchers.get(node) else {
                    continue;
                };
                for id in list {
                    let Some(reg) = self.observers.registrations.get(id) else {
                        continue;
                    };
                    let reads = depth == 0 || reg.options.scope == Scope::All;
                    if reg.options.derived
                        && reads
                        && reg.target != Some(target)
                        && reg.height <= height
                        && !readers.contains(id)
                    {
                        readers.push(*id);
                    }
                }
            }
            for id in readers {
                let raised = height + 1;
                if raised > ceiling {
                    log::warn!("derived cycle through {target}, {id} left at height {height}");
                    continue;
                }
                log::trace!("{id} raised to height {raised}");
                if let Some(next) = self.observers.set_height(id, raised) {
                    work.push((next, raised));
                }
            }
        }
    }

    /// Run one registration's callback with its pending changes.
    pub(crate) fn notify(&mut self, id: ObserverId, initialize: bool) -> StateResult<()> {
        let Some(reg) = self.observers.registrations.get_mut(&id) else {
            return Ok(());
        };
        let changes = std::mem::take(&mut reg.pending);
        if !initialize && changes.is_empty() {
            return Ok(());
        }
        // Already running further up the stack.
        let Some(mut callback) = reg.callback.take() else {
            return Ok(());
        };
        let derived = reg.options.derived;
        let args = NodeChangeEventArgs {
            observer: id,
            initialize,
            changes,
        };

        if derived {
            self.pass.derived_writers += 1;
        }
        self.pass.depth += 1;
        let result = callback(self, &args);
        self.pass.depth -= 1;
        if derived {
            self.pass.derived_writers -= 1;
        }

        if let Some(reg) = self.observers.registrations.get_mut(&id) {
            reg.callback = Some(callback);
        }
        let flushed = if self.pass.depth == 0 && !self.pass.flushing {
            self.flush()
        } else {
            Ok(())
        };
        result.and(flushed)
    }

    /// Deliver everything routed so far, until no observer is dirty.
    pub(crate) fn flush(&mut self) -> StateResult<()> {
        self.pass.flushing = true;
        let mut first_error = None;
        while let Some(id) = self.observers.next_dirty() {
            if let Err(e) = self.notify(id, false) {
                log::error!("observer {id} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        self.pass.flushing = false;
        first_error.map_or(Ok(()), Err)
    }
}
