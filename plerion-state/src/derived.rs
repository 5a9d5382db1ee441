//! Derived values: primitives computed from other nodes.
//!
//! A derived value is an observer with `derived = true` whose callback runs
//! `compute` and writes the result to its target. Registration marks the
//! target derived, so nothing but that callback (or another derived
//! observer) may write it while it is Active.
//!
//! Ranking: each derived registration has a height, one above the highest
//! derived value among its dependencies. A dependency that becomes derived
//! later lifts its readers (transitively) when it is bound. The flush loop
//! runs dirty derived registrations lowest height first, so a chain
//! `a → b = f(a) → c = g(b)` settles in one pass with no stale reads,
//! whichever order the chain was registered in.

use crate::error::{StateError, StateResult};
use crate::node::{NodeId, NodeKind};
use crate::observe::{ObserverId, ObserverOptions, Scope};
use crate::tree::StateTree;
use crate::value::{Key, Value};

impl StateTree {
    /// Make `node` a function of `deps`. `compute` runs now and again after
    /// every pass that changes a dependency (per `scope`).
    ///
    /// Fails with [`StateError::AlreadyDerived`] if `node` already has a
    /// computation; use [`StateTree::replace_derived`] to swap it.
    pub fn register_derived<F>(
        &mut self,
        node: NodeId,
        scope: Scope,
        deps: &[NodeId],
        compute: F,
    ) -> StateResult<ObserverId>
    where
        F: Fn(&StateTree) -> StateResult<Value> + Send + 'static,
    {
        if self.observers.derived_by_target.contains_key(&node) {
            return Err(StateError::AlreadyDerived(node));
        }
        self.install_derived(node, scope, deps, compute)
    }

    /// Replace the computation behind `node`, or install one if there is
    /// none.
    pub fn replace_derived<F>(
        &mut self,
        node: NodeId,
        scope: Scope,
        deps: &[NodeId],
        compute: F,
    ) -> StateResult<ObserverId>
    where
        F: Fn(&StateTree) -> StateResult<Value> + Send + 'static,
    {
        if let Some(old) = self.observers.derived_by_target.get(&node).copied() {
            self.deregister_observer(old)?;
        }
        self.install_derived(node, scope, deps, compute)
    }

    fn install_derived<F>(
        &mut self,
        node: NodeId,
        scope: Scope,
        deps: &[NodeId],
        compute: F,
    ) -> StateResult<ObserverId>
    where
        F: Fn(&StateTree) -> StateResult<Value> + Send + 'static,
    {
        let kind = self.kind(node)?;
        if kind != NodeKind::Primitive {
            return Err(StateError::KindMismatch {
                expected: NodeKind::Primitive,
                found: kind,
            });
        }
        self.node_mut(node)?.derived = true;

        let options = ObserverOptions {
            scope,
            derived: true,
            owner: Some(node),
        };
        let registered = self.register_observer(options, deps, move |tree, _| {
            let value = compute(tree)?;
            tree.write_value(node, value)
        });
        match registered {
            Ok(id) => {
                self.observers.bind_target(id, node);
                let height = self.observers.height_of(id).unwrap_or(1);
                self.raise_readers(node, height);
                log::trace!("{node} derived via {id}");
                Ok(id)
            }
            Err(e) => {
                if let Ok(n) = self.node_mut(node) {
                    n.derived = false;
                }
                Err(e)
            }
        }
    }

    /// The registration computing `node`, if any.
    pub fn derived_observer(&self, node: NodeId) -> Option<ObserverId> {
        self.observers.derived_by_target.get(&node).copied()
    }

    /// Mark a node as written by a derived observer rather than by actions.
    /// Derived nodes are refused external writes and are skipped when
    /// client input is applied.
    pub fn set_derived(&mut self, node: NodeId, derived: bool) -> StateResult<()> {
        self.node_mut(node)?.derived = derived;
        Ok(())
    }

    /// Run `then` once `dict` has an entry at `key`: right away if it does,
    /// otherwise from a temporary observer that removes itself when the key
    /// shows up. `owner` ties the temporary observer to a node's lifetime.
    ///
    /// `then` runs as a derived observer, so it may register derived values
    /// and write derived nodes.
    pub fn when_entry_exists<F>(
        &mut self,
        dict: NodeId,
        key: Key,
        owner: Option<NodeId>,
        then: F,
    ) -> StateResult<Option<ObserverId>>
    where
        F: FnOnce(&mut StateTree, NodeId) -> StateResult<()> + Send + 'static,
    {
        if let Some(entry) = self.try_entry(dict, &key)? {
            self.pass.derived_writers += 1;
            let result = self.batch(|tree| then(tree, entry));
            self.pass.derived_writers -= 1;
            return result.map(|_| None);
        }

        let options = ObserverOptions {
            scope: Scope::SelfOnly,
            derived: true,
            owner,
        };
        let mut then = Some(then);
        let id = self.register_observer(options, &[dict], move |tree, args| {
            let Some(entry) = tree.try_entry(dict, &key)? else {
                return Ok(());
            };
            tree.deregister_observer(args.observer)?;
            match then.take() {
                Some(then) => then(tree, entry),
                None => Ok(()),
            }
        })?;
        Ok(Some(id))
    }
}
