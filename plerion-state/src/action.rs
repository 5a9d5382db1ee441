//! Action pipeline: mutations as command objects.
//!
//! ```text
//!   apply thread                      any thread / task
//!   ────────────                      ─────────────────
//!   tree.execute_action(t, &a)        sender.execute_action_or_delay(t, a)
//!        │ one pass                   sender.schedule_set(node, v)
//!        ▼                                   │
//!     mutate ──► notify                      ▼
//!                                    unbounded FIFO (tokio mpsc)
//!   tree.drain_actions()  ◄──────────────────┘
//!        │ one pass per action, submission order
//! ```
//!
//! Actions are not transactional. A failing action leaves every write made
//! before the failure in place; keep actions small and order their writes
//! so a partial failure is harmless.

use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::error::{StateError, StateResult};
use crate::node::NodeId;
use crate::snapshot::Snapshot;
use crate::tree::StateTree;
use crate::value::{Key, Value};

/// A mutation of the subtree at `target`.
///
/// An action carries everything it needs; `execute` only reads `tree`
/// through `target` and nodes reachable from it.
pub trait Action: Send {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()>;
}

impl StateTree {
    /// Run `action` now, as one pass. Errors propagate; nothing is rolled
    /// back.
    pub fn execute_action(&mut self, target: NodeId, action: &dyn Action) -> StateResult<()> {
        self.node(target)?;
        log::trace!("executing {} on {target}", action.name());
        self.batch(|tree| action.execute(tree, target))
    }

    /// Handle for submitting actions from outside the apply thread.
    pub fn action_sender(&self) -> ActionSender {
        ActionSender {
            tx: self.queue.tx.clone(),
        }
    }

    /// Run every queued action in submission order, one pass each.
    /// A failing action does not stop the drain; the first error is
    /// returned after the queue is empty.
    pub fn drain_actions(&mut self) -> StateResult<usize> {
        let mut count = 0;
        let mut first_error = None;
        while let Ok(queued) = self.queue.rx.try_recv() {
            count += 1;
            if let Err(e) = self.execute_action(queued.target, queued.action.as_ref()) {
                log::warn!("queued action {} failed: {e}", queued.action.name());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(count), Err)
    }
}

pub(crate) struct QueuedAction {
    target: NodeId,
    action: Box<dyn Action>,
}

pub(crate) struct ActionQueue {
    tx: mpsc::UnboundedSender<QueuedAction>,
    rx: mpsc::UnboundedReceiver<QueuedAction>,
}

impl ActionQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

/// Cloneable, `Send` handle feeding a tree's apply queue.
#[derive(Clone)]
pub struct ActionSender {
    tx: mpsc::UnboundedSender<QueuedAction>,
}

impl ActionSender {
    pub fn execute_action_or_delay(&self, target: NodeId, action: impl Action + 'static) -> StateResult<()> {
        self.tx
            .send(QueuedAction {
                target,
                action: Box::new(action),
            })
            .map_err(|_| StateError::Action("apply queue closed".into()))
    }

    /// Queue a single primitive write.
    pub fn schedule_set(&self, node: NodeId, value: impl Into<Value>) -> StateResult<()> {
        self.execute_action_or_delay(node, SetPrimitiveValue::new(value))
    }
}

// ── Built-in actions ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SetPrimitiveValue {
    pub value: Value,
}

impl SetPrimitiveValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Action for SetPrimitiveValue {
    fn name(&self) -> &str {
        "SetPrimitiveValue"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.set(target, self.value.clone())
    }
}

/// Add a dictionary entry, optionally populated. Fails on an existing key.
#[derive(Debug, Clone)]
pub struct AddEntry {
    pub key: Key,
    pub init: Option<Snapshot>,
}

impl AddEntry {
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            init: None,
        }
    }

    pub fn with(key: impl Into<Key>, init: Snapshot) -> Self {
        Self {
            key: key.into(),
            init: Some(init),
        }
    }
}

impl Action for AddEntry {
    fn name(&self) -> &str {
        "AddEntry"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        match &self.init {
            Some(init) => tree.add_entry_with(target, self.key.clone(), init)?,
            None => tree.add_entry(target, self.key.clone())?,
        };
        Ok(())
    }
}

/// Add the entry, or update it in place if the key already exists.
#[derive(Debug, Clone)]
pub struct AddOrUpdateEntry {
    pub key: Key,
    pub init: Snapshot,
}

impl AddOrUpdateEntry {
    pub fn new(key: impl Into<Key>, init: Snapshot) -> Self {
        Self {
            key: key.into(),
            init,
        }
    }
}

impl Action for AddOrUpdateEntry {
    fn name(&self) -> &str {
        "AddOrUpdateEntry"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        match tree.try_entry(target, &self.key)? {
            Some(entry) => tree.apply_snapshot(entry, &self.init),
            None => tree.add_entry_with(target, self.key.clone(), &self.init).map(|_| ()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoveEntry {
    pub key: Key,
}

impl RemoveEntry {
    pub fn new(key: impl Into<Key>) -> Self {
        Self { key: key.into() }
    }
}

impl Action for RemoveEntry {
    fn name(&self) -> &str {
        "RemoveEntry"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.remove_entry(target, &self.key)
    }
}

#[derive(Debug, Clone)]
pub struct AddToSet {
    pub key: Key,
}

impl AddToSet {
    pub fn new(key: impl Into<Key>) -> Self {
        Self { key: key.into() }
    }
}

impl Action for AddToSet {
    fn name(&self) -> &str {
        "AddToSet"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.set_insert(target, self.key.clone()).map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct RemoveFromSet {
    pub key: Key,
}

impl RemoveFromSet {
    pub fn new(key: impl Into<Key>) -> Self {
        Self { key: key.into() }
    }
}

impl Action for RemoveFromSet {
    fn name(&self) -> &str {
        "RemoveFromSet"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.set_remove(target, &self.key).map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct SetSetValues {
    pub keys: Vec<Key>,
}

impl Action for SetSetValues {
    fn name(&self) -> &str {
        "SetSetValues"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.set_replace(target, self.keys.iter().cloned())
    }
}

#[derive(Debug, Clone)]
pub struct SetArrayValues {
    pub values: Vec<Value>,
}

impl Action for SetArrayValues {
    fn name(&self) -> &str {
        "SetArrayValues"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.array_set(target, self.values.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ApplySnapshot {
    pub snapshot: Snapshot,
}

impl Action for ApplySnapshot {
    fn name(&self) -> &str {
        "ApplySnapshot"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.apply_snapshot(target, &self.snapshot)
    }
}

/// Load a JSON document into the target subtree.
#[derive(Debug, Clone)]
pub struct LoadJson {
    pub json: Json,
}

impl Action for LoadJson {
    fn name(&self) -> &str {
        "LoadJson"
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        tree.from_json(target, &self.json)
    }
}

/// Closure adapter for one-off actions.
pub struct ActionFn<F> {
    name: String,
    f: F,
}

pub fn action_fn<F>(name: impl Into<String>, f: F) -> ActionFn<F>
where
    F: Fn(&mut StateTree, NodeId) -> StateResult<()> + Send,
{
    ActionFn {
        name: name.into(),
        f,
    }
}

impl<F> Action for ActionFn<F>
where
    F: Fn(&mut StateTree, NodeId) -> StateResult<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, tree: &mut StateTree, target: NodeId) -> StateResult<()> {
        (self.f)(tree, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::filters;
    use crate::observe::ObserverOptions;
    use crate::schema::Schema;
    use crate::value::KeyKind;
    use std::sync::{Arc, Mutex};

    fn schema() -> Schema {
        let entry = Schema::composite()
            .field("label", Schema::text())
            .field("size", Schema::int())
            .build();
        Schema::composite()
            .field("nodes", Schema::dictionary(KeyKind::Int, entry))
            .field("selected", Schema::set(KeyKind::Int))
            .field("status", Schema::text())
            .build()
    }

    #[test]
    fn test_execute_action_is_one_pass() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let root = tree.root();
        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        tree.register_observer(ObserverOptions::default(), &[root], move |_, _| {
            *sink.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();
        let action = action_fn("populate", |tree, root| {
            let nodes = tree.child(root, "nodes")?;
            for i in 0..3 {
                tree.add_entry(nodes, i as i64)?;
            }
            tree.set(tree.child(root, "status")?, "ready")
        });
        tree.execute_action(root, &action).unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(tree.len(tree.child(root, "nodes").unwrap()).unwrap(), 3);
    }

    #[test]
    fn test_failed_action_is_not_rolled_back() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let nodes = tree.descend(tree.root(), "nodes").unwrap();
        let action = action_fn("half", |tree, nodes| {
            tree.add_entry(nodes, 1)?;
            tree.add_entry(nodes, 1)?;
            Ok(())
        });
        assert_eq!(
            tree.execute_action(nodes, &action).unwrap_err(),
            StateError::DuplicateKey(Key::Int(1))
        );
        assert!(tree.contains_key(nodes, &Key::Int(1)).unwrap());
    }

    #[test]
    fn test_collection_actions() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let root = tree.root();
        let nodes = tree.child(root, "nodes").unwrap();
        let selected = tree.child(root, "selected").unwrap();

        let init = Snapshot::Composite(vec![(0, Snapshot::Value("a".into()))]);
        tree.execute_action(nodes, &AddEntry::with(7, init)).unwrap();
        let update = Snapshot::Composite(vec![(1, Snapshot::Value(Value::Int(3)))]);
        tree.execute_action(nodes, &AddOrUpdateEntry::new(7, update)).unwrap();
        let doc = tree.to_json(nodes, &filters::all).unwrap();
        assert_eq!(doc, serde_json::json!({ "7": { "label": "a", "size": 3 } }));

        tree.execute_action(selected, &AddToSet::new(7)).unwrap();
        tree.execute_action(selected, &SetSetValues { keys: vec![Key::Int(1), Key::Int(2)] })
            .unwrap();
        tree.execute_action(selected, &RemoveFromSet::new(1)).unwrap();
        assert_eq!(tree.keys(selected).unwrap(), vec![Key::Int(2)]);

        tree.execute_action(nodes, &RemoveEntry::new(7)).unwrap();
        assert_eq!(tree.len(nodes).unwrap(), 0);
    }

    #[test]
    fn test_delayed_actions_keep_submission_order() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let root = tree.root();
        let status = tree.child(root, "status").unwrap();
        let sender = tree.action_sender();

        let worker = std::thread::spawn(move || {
            for i in 0..5 {
                sender.schedule_set(status, format!("step {i}")).unwrap();
            }
        });
        worker.join().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tree.register_observer(ObserverOptions::default(), &[status], move |tree, args| {
            if !args.initialize {
                sink.lock().unwrap().push(tree.value(status)?.clone());
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(tree.drain_actions().unwrap(), 5);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[4], Value::from("step 4"));
        assert_eq!(seen[0], Value::from("step 0"));
    }

    #[test]
    fn test_drain_continues_past_failures() {
        let mut tree = StateTree::initialize(schema()).unwrap();
        let root = tree.root();
        let nodes = tree.child(root, "nodes").unwrap();
        let status = tree.child(root, "status").unwrap();
        let sender = tree.action_sender();
        sender.execute_action_or_delay(nodes, RemoveEntry::new(99)).unwrap();
        sender.schedule_set(status, "after").unwrap();
        assert_eq!(
            tree.drain_actions().unwrap_err(),
            StateError::MissingKey(Key::Int(99))
        );
        assert_eq!(tree.value(status).unwrap(), &Value::from("after"));
        assert_eq!(tree.drain_actions().unwrap(), 0);
    }
}
