//! Snapshot-based undo/redo.
//!
//! Callers register a checkpoint (a named snapshot of the subtree about to
//! change) before dispatching an undoable action. Undo captures the current
//! state for redo, then applies the checkpoint through the ordinary action
//! path so observers and the delta tracker see it like any other edit.

use std::collections::VecDeque;

use crate::action::ApplySnapshot;
use crate::delta::filters;
use crate::error::StateResult;
use crate::node::NodeId;
use crate::snapshot::Snapshot;
use crate::tree::StateTree;

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: String,
    pub node: NodeId,
    snapshot: Snapshot,
}

#[derive(Debug)]
pub struct UndoManager {
    undo: VecDeque<Checkpoint>,
    redo: Vec<Checkpoint>,
    limit: usize,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(100)
    }
}

impl UndoManager {
    /// Keep at most `limit` undo steps; the oldest are dropped first.
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Remember the current state of `node` under `name`. Clears redo.
    pub fn register_checkpoint(
        &mut self,
        tree: &StateTree,
        name: impl Into<String>,
        node: NodeId,
    ) -> StateResult<()> {
        let snapshot = tree.snapshot(node, &filters::exclude_derived)?;
        self.undo.push_back(Checkpoint {
            name: name.into(),
            node,
            snapshot,
        });
        if self.undo.len() > self.limit {
            self.undo.pop_front();
        }
        self.redo.clear();
        Ok(())
    }

    /// Restore the latest checkpoint. Returns its name, or `None` if there
    /// is nothing to undo.
    pub fn undo(&mut self, tree: &mut StateTree) -> StateResult<Option<String>> {
        let Some(checkpoint) = self.undo.pop_back() else {
            return Ok(None);
        };
        let inverse = self.restore(tree, checkpoint)?;
        let name = inverse.name.clone();
        self.redo.push(inverse);
        Ok(Some(name))
    }

    pub fn redo(&mut self, tree: &mut StateTree) -> StateResult<Option<String>> {
        let Some(checkpoint) = self.redo.pop() else {
            return Ok(None);
        };
        let inverse = self.restore(tree, checkpoint)?;
        let name = inverse.name.clone();
        self.undo.push_back(inverse);
        Ok(Some(name))
    }

    /// Apply `checkpoint` and return a checkpoint of the state it replaced.
    fn restore(&self, tree: &mut StateTree, checkpoint: Checkpoint) -> StateResult<Checkpoint> {
        let current = tree.snapshot(checkpoint.node, &filters::exclude_derived)?;
        let action = ApplySnapshot {
            snapshot: checkpoint.snapshot,
        };
        tree.execute_action(checkpoint.node, &action)?;
        log::debug!("restored checkpoint `{}`", checkpoint.name);
        Ok(Checkpoint {
            name: checkpoint.name,
            node: checkpoint.node,
            snapshot: current,
        })
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
