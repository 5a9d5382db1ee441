//! Shared AR scene served by every room.
//!
//! ```text
//! room
//! ├── users:          Id → { name, position, rotation, hovering? }
//! ├── nodes:          Id → { label, link, label_scale, position, rotation, layer?, visible* }
//! ├── layers:         Id → { name }
//! ├── hidden_layers:  {Id}
//! ├── node_fetch_radius, node_fetch_limit
//! └── user_count*
//! ```
//!
//! Starred fields are derived. Positions are ECEF `[x, y, z]`, rotations
//! quaternions `[x, y, z, w]`.

use plerion_state::{
    Key, KeyKind, NodeId, Schema, Scope, StateResult, StateTree, Value, ValueKind,
};
use plerion_sync::RoomHook;

pub const DEFAULT_FETCH_RADIUS: f64 = 25.0;
pub const DEFAULT_FETCH_LIMIT: i64 = 100;

fn user() -> Schema {
    Schema::composite()
        .field("name", Schema::text())
        .field("position", Schema::vector())
        .field("rotation", Schema::vector())
        .field("hovering", Schema::nullable(ValueKind::Id))
        .build()
}

fn node() -> Schema {
    Schema::composite()
        .field("label", Schema::text())
        .field("link", Schema::text())
        .field("label_scale", Schema::with_default(1.0))
        .field("position", Schema::vector())
        .field("rotation", Schema::vector())
        .field("layer", Schema::nullable(ValueKind::Id))
        .field("visible", Schema::bool())
        .on_initialize(|tree, node| {
            let root = scene_root(tree, node)?;
            let hidden = tree.child(root, "hidden_layers")?;
            let layer = tree.child(node, "layer")?;
            let visible = tree.child(node, "visible")?;
            tree.register_derived(visible, Scope::SelfOnly, &[layer, hidden], move |t| {
                let shown = match t.value(layer)?.as_id() {
                    Some(id) => !t.set_contains(hidden, &Key::Id(id))?,
                    None => true,
                };
                Ok(Value::Bool(shown))
            })?;
            Ok(())
        })
        .build()
}

fn layer() -> Schema {
    Schema::composite().field("name", Schema::text()).build()
}

/// Node entries live at `root.nodes[id]`.
fn scene_root(tree: &StateTree, node: NodeId) -> StateResult<NodeId> {
    let dict = tree.parent(node)?;
    let root = match dict {
        Some(dict) => tree.parent(dict)?,
        None => None,
    };
    Ok(root.unwrap_or_else(|| tree.root()))
}

/// Schema of one room's scene.
pub fn scene() -> Schema {
    Schema::composite()
        .field("users", Schema::dictionary(KeyKind::Id, user()))
        .field("nodes", Schema::dictionary(KeyKind::Id, node()))
        .field("layers", Schema::dictionary(KeyKind::Id, layer()))
        .field("hidden_layers", Schema::set(KeyKind::Id))
        .field("node_fetch_radius", Schema::with_default(DEFAULT_FETCH_RADIUS))
        .field("node_fetch_limit", Schema::with_default(DEFAULT_FETCH_LIMIT))
        .field("user_count", Schema::int())
        .on_initialize(|tree, root| {
            let users = tree.child(root, "users")?;
            let count = tree.child(root, "user_count")?;
            tree.register_derived(count, Scope::SelfOnly, &[users], move |t| {
                Ok(Value::Int(t.len(users)? as i64))
            })?;
            Ok(())
        })
        .build()
}

/// Authoritative per-tick cleanup: references to nodes and layers that no
/// longer exist are cleared.
#[derive(Debug, Default)]
pub struct SceneHook {
    pruned: u64,
}

impl SceneHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total references cleared since the hook was created.
    pub fn pruned(&self) -> u64 {
        self.pruned
    }

    fn prune_hovering(&mut self, tree: &mut StateTree, root: NodeId) -> StateResult<()> {
        let users = tree.child(root, "users")?;
        let nodes = tree.child(root, "nodes")?;
        for (_, user) in tree.entries(users)? {
            let hovering = tree.child(user, "hovering")?;
            let Some(id) = tree.value(hovering)?.as_id() else {
                continue;
            };
            if !tree.contains_key(nodes, &Key::Id(id))? {
                tree.set(hovering, Value::Null)?;
                self.pruned += 1;
            }
        }
        Ok(())
    }

    fn prune_layers(&mut self, tree: &mut StateTree, root: NodeId) -> StateResult<()> {
        let layers = tree.child(root, "layers")?;
        let hidden = tree.child(root, "hidden_layers")?;
        for key in tree.keys(hidden)? {
            if !tree.contains_key(layers, &key)? {
                tree.set_remove(hidden, &key)?;
                self.pruned += 1;
            }
        }

        let nodes = tree.child(root, "nodes")?;
        for (_, node) in tree.entries(nodes)? {
            let layer = tree.child(node, "layer")?;
            let Some(id) = tree.value(layer)?.as_id() else {
                continue;
            };
            if !tree.contains_key(layers, &Key::Id(id))? {
                tree.set(layer, Value::Null)?;
                self.pruned += 1;
            }
        }
        Ok(())
    }
}

impl RoomHook for SceneHook {
    fn update(&mut self, tree: &mut StateTree) -> StateResult<()> {
        let root = tree.root();
        let before = self.pruned;
        tree.batch(|tree| {
            self.prune_hovering(tree, root)?;
            self.prune_layers(tree, root)
        })?;
        if self.pruned > before {
            log::debug!("Pruned {} stale scene references", self.pruned - before);
        }
        Ok(())
    }
}
