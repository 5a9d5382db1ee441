//! Full snapshots of a subtree, in binary and document form.
//!
//! A [`Snapshot`] mirrors the node kinds. Composite fields are addressed by
//! index and may be sparse: a field a filter left out, or a document did not
//! mention, keeps its current value when the snapshot is applied.
//!
//! Applying a snapshot goes through the normal setters, so observers and the
//! delta tracker see ordinary Set/Add/Remove changes. Dictionaries are
//! diffed: keys missing from the snapshot are removed, new keys added, and
//! existing entries updated in place.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::delta::SerializeFilter;
use crate::error::{StateError, StateResult};
use crate::node::{NodeData, NodeId, NodeKind};
use crate::schema::Schema;
use crate::tree::StateTree;
use crate::value::{Key, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Snapshot {
    Value(Value),
    Composite(Vec<(u16, Snapshot)>),
    Dictionary(Vec<(Key, Snapshot)>),
    Set(Vec<Key>),
    List(Vec<Value>),
    Array(Vec<Value>),
}

impl Snapshot {
    pub fn kind(&self) -> NodeKind {
        match self {
            Snapshot::Value(_) => NodeKind::Primitive,
            Snapshot::Composite(_) => NodeKind::Composite,
            Snapshot::Dictionary(_) => NodeKind::Dictionary,
            Snapshot::Set(_) => NodeKind::Set,
            Snapshot::List(_) => NodeKind::List,
            Snapshot::Array(_) => NodeKind::Array,
        }
    }

    pub fn encode(&self) -> StateResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StateError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> StateResult<Self> {
        let (snapshot, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| StateError::Decode(e.to_string()))?;
        Ok(snapshot)
    }

    /// Read a document shaped by `schema`. Unknown composite fields are
    /// ignored and missing ones left out.
    pub fn from_json(schema: &Schema, json: &Json) -> StateResult<Snapshot> {
        match schema {
            Schema::Primitive { kind, .. } => Ok(Snapshot::Value(Value::from_json(json, *kind)?)),
            Schema::Composite(composite) => {
                let object = expect_object(json)?;
                let mut fields = Vec::new();
                for (index, field) in composite.fields.iter().enumerate() {
                    if let Some(value) = object.get(&*field.name) {
                        fields.push((index as u16, Snapshot::from_json(&field.schema, value)?));
                    }
                }
                Ok(Snapshot::Composite(fields))
            }
            Schema::Dictionary { key, entry } => {
                let object = expect_object(json)?;
                let mut entries = object
                    .iter()
                    .map(|(k, v)| Ok((Key::from_json_key(k, *key)?, Snapshot::from_json(entry, v)?)))
                    .collect::<StateResult<Vec<_>>>()?;
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Snapshot::Dictionary(entries))
            }
            Schema::Set { key } => {
                let mut keys = expect_array(json)?
                    .iter()
                    .map(|k| Key::from_json(k, *key))
                    .collect::<StateResult<Vec<_>>>()?;
                keys.sort();
                keys.dedup();
                Ok(Snapshot::Set(keys))
            }
            Schema::List { element } => Ok(Snapshot::List(
                expect_array(json)?
                    .iter()
                    .map(|v| Value::from_json(v, *element))
                    .collect::<StateResult<_>>()?,
            )),
            Schema::Array { element } => Ok(Snapshot::Array(
                expect_array(json)?
                    .iter()
                    .map(|v| Value::from_json(v, *element))
                    .collect::<StateResult<_>>()?,
            )),
        }
    }
}

fn expect_object(json: &Json) -> StateResult<&Map<String, Json>> {
    json.as_object()
        .ok_or_else(|| StateError::Json(format!("expected an object, found {json}")))
}

fn expect_array(json: &Json) -> StateResult<&Vec<Json>> {
    json.as_array()
        .ok_or_else(|| StateError::Json(format!("expected an array, found {json}")))
}

impl StateTree {
    /// Capture the subtree at `node`. Nodes rejected by `filter` are left
    /// out; the root of the capture is always included.
    pub fn snapshot(&self, node: NodeId, filter: SerializeFilter<'_>) -> StateResult<Snapshot> {
        let n = self.node(node)?;
        Ok(match &n.data {
            NodeData::Primitive(value) => Snapshot::Value(value.clone()),
            NodeData::Composite(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (index, child) in fields.iter().enumerate() {
                    if filter(&self.node_info(*child)?) {
                        out.push((index as u16, self.snapshot(*child, filter)?));
                    }
                }
                Snapshot::Composite(out)
            }
            NodeData::Dictionary(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, child) in entries {
                    if filter(&self.node_info(*child)?) {
                        out.push((key.clone(), self.snapshot(*child, filter)?));
                    }
                }
                Snapshot::Dictionary(out)
            }
            NodeData::Set(keys) => Snapshot::Set(keys.iter().cloned().collect()),
            NodeData::List(items) => Snapshot::List(items.clone()),
            NodeData::Array(items) => Snapshot::Array(items.clone()),
        })
    }

    /// Bring the subtree at `node` in line with `snapshot`, as one pass.
    /// Derived nodes are left to their computations.
    pub fn apply_snapshot(&mut self, node: NodeId, snapshot: &Snapshot) -> StateResult<()> {
        self.batch(|tree| tree.apply_snapshot_at(node, snapshot))
    }

    fn apply_snapshot_at(&mut self, node: NodeId, snapshot: &Snapshot) -> StateResult<()> {
        if self.derived_locked(node)? {
            return Ok(());
        }
        match (self.kind(node)?, snapshot) {
            (NodeKind::Primitive, Snapshot::Value(value)) => self.write_value(node, value.clone()),
            (NodeKind::Composite, Snapshot::Composite(fields)) => {
                for (index, child_snapshot) in fields {
                    if let Some(child) = self.field_at(node, *index)? {
                        self.apply_snapshot_at(child, child_snapshot)?;
                    }
                }
                Ok(())
            }
            (NodeKind::Dictionary, Snapshot::Dictionary(entries)) => {
                let wanted: BTreeSet<&Key> = entries.iter().map(|(k, _)| k).collect();
                for key in self.keys(node)? {
                    if !wanted.contains(&key) {
                        self.remove_entry(node, &key)?;
                    }
                }
                for (key, entry_snapshot) in entries {
                    match self.try_entry(node, key)? {
                        Some(entry) => self.apply_snapshot_at(entry, entry_snapshot)?,
                        None => {
                            self.add_entry_with(node, key.clone(), entry_snapshot)?;
                        }
                    }
                }
                Ok(())
            }
            (NodeKind::Set, Snapshot::Set(keys)) => self.set_replace(node, keys.iter().cloned()),
            (NodeKind::List, Snapshot::List(values)) => self.list_replace(node, values.clone()),
            (NodeKind::Array, Snapshot::Array(values)) => self.array_set(node, values.clone()),
            (expected, other) => Err(StateError::KindMismatch {
                expected,
                found: other.kind(),
            }),
        }
    }

    /// Document form of the subtree at `node`: composites become objects by
    /// field name, dictionaries objects by key, sets and lists arrays.
    pub fn to_json(&self, node: NodeId, filter: SerializeFilter<'_>) -> StateResult<Json> {
        let n = self.node(node)?;
        Ok(match &n.data {
            NodeData::Primitive(value) => value.to_json(),
            NodeData::Composite(fields) => {
                let mut object = Map::new();
                for child in fields {
                    let info = self.node_info(*child)?;
                    if !filter(&info) {
                        continue;
                    }
                    let name = info.name.unwrap_or_default().to_string();
                    object.insert(name, self.to_json(*child, filter)?);
                }
                Json::Object(object)
            }
            NodeData::Dictionary(entries) => {
                let mut object = Map::new();
                for (key, child) in entries {
                    if filter(&self.node_info(*child)?) {
                        object.insert(key.to_json_key(), self.to_json(*child, filter)?);
                    }
                }
                Json::Object(object)
            }
            NodeData::Set(keys) => Json::Array(keys.iter().map(Key::to_json).collect()),
            NodeData::List(items) | NodeData::Array(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
        })
    }

    /// Load a document into the subtree at `node`.
    pub fn from_json(&mut self, node: NodeId, json: &Json) -> StateResult<()> {
        let snapshot = Snapshot::from_json(self.schema_of(node)?, json)?;
        self.apply_snapshot(node, &snapshot)
    }
}
