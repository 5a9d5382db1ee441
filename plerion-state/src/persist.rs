//! Settings persistence: a subtree mirrored to a JSON file.
//!
//! On attach the file is loaded into the subtree (or a defaults action runs
//! when there is no usable file). From then on every change under the
//! subtree rewrites the file. The synthetic initialize notification is
//! skipped, so attaching never rewrites what was just read.

use std::fs;
use std::path::{Path, PathBuf};

use crate::action::{Action, LoadJson};
use crate::delta::filters;
use crate::error::StateResult;
use crate::node::NodeId;
use crate::observe::{ObserverId, ObserverOptions, Scope};
use crate::tree::StateTree;

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    node: NodeId,
    observer: ObserverId,
}

impl SettingsStore {
    pub fn attach(
        tree: &mut StateTree,
        node: NodeId,
        path: impl Into<PathBuf>,
        defaults: &dyn Action,
    ) -> StateResult<Self> {
        let path = path.into();
        match load(&path) {
            Ok(Some(json)) => tree.execute_action(node, &LoadJson { json })?,
            Ok(None) => tree.execute_action(node, defaults)?,
            Err(e) => {
                log::warn!("ignoring unreadable settings {}: {e}", path.display());
                tree.execute_action(node, defaults)?;
            }
        }

        let target = path.clone();
        let options = ObserverOptions {
            scope: Scope::All,
            derived: false,
            owner: Some(node),
        };
        let observer = tree.register_observer(options, &[node], move |tree, args| {
            if args.initialize {
                return Ok(());
            }
            write(tree, node, &target)
        })?;
        log::debug!("settings at {} attached to {node}", path.display());
        Ok(Self {
            path,
            node,
            observer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state now.
    pub fn save(&self, tree: &StateTree) -> StateResult<()> {
        write(tree, self.node, &self.path)
    }

    /// Stop mirroring. The file is left as is.
    pub fn detach(self, tree: &mut StateTree) -> StateResult<()> {
        if tree.is_registered(self.observer) {
            tree.deregister_observer(self.observer)?;
        }
        Ok(())
    }
}

fn load(path: &Path) -> StateResult<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

fn write(tree: &StateTree, node: NodeId, path: &Path) -> StateResult<()> {
    let json = tree.to_json(node, &filters::exclude_derived)?;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(&json)?)?;
    log::debug!("wrote settings to {}", path.display());
    Ok(())
}
