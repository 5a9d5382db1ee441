//! Scalar values held by primitive nodes, and the keys that address
//! entries of keyed collections.
//!
//! Both are closed sum types: every place that branches on a value or key
//! kind is an exhaustive `match`, so adding a variant is a compile error
//! everywhere it matters.
//!
//! JSON conversion is schema-guided. The document form stays natural
//! (`"label": "x"`, `"position": [1.0, 2.0, 3.0]`, UUIDs as strings) and the
//! schema supplies the kind needed to read it back.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::{StateError, StateResult};

/// A primitive node's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Id(Uuid),
    /// Fixed-size numeric tuples: positions, rotations, matrices.
    Vector(Vec<f64>),
}

/// Payload-free mirror of [`Value`], used by schemas and type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Id,
    Vector,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Id(_) => ValueKind::Id,
            Value::Vector(_) => ValueKind::Vector,
        }
    }

    /// The zero value for a kind.
    pub fn zero(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Null => Value::Null,
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Id => Value::Id(Uuid::nil()),
            ValueKind::Vector => Value::Vector(Vec::new()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, with integers widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<Uuid> {
        match self {
            Value::Id(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::Text(s) => Json::String(s.clone()),
            Value::Id(id) => Json::String(id.to_string()),
            Value::Vector(v) => Json::Array(
                v.iter()
                    .map(|f| serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number))
                    .collect(),
            ),
        }
    }

    /// Read a value of `kind` from its document form. JSON `null` always
    /// reads as [`Value::Null`]; the caller decides whether that is allowed.
    pub fn from_json(json: &Json, kind: ValueKind) -> StateResult<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || StateError::Json(format!("expected {kind:?}, found {json}"));
        match kind {
            ValueKind::Null => Err(mismatch()),
            ValueKind::Bool => json.as_bool().map(Value::Bool).ok_or_else(mismatch),
            ValueKind::Int => json.as_i64().map(Value::Int).ok_or_else(mismatch),
            ValueKind::Float => json.as_f64().map(Value::Float).ok_or_else(mismatch),
            ValueKind::Text => json
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .ok_or_else(mismatch),
            ValueKind::Id => json
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Value::Id)
                .ok_or_else(mismatch),
            ValueKind::Vector => {
                let items = json.as_array().ok_or_else(mismatch)?;
                items
                    .iter()
                    .map(|item| item.as_f64().ok_or_else(mismatch))
                    .collect::<StateResult<Vec<f64>>>()
                    .map(Value::Vector)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Id(id) => write!(f, "{id}"),
            Value::Vector(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f64::from(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Uuid> for Value {
    fn from(id: Uuid) -> Self {
        Value::Id(id)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

impl<const N: usize> From<[f64; N]> for Value {
    fn from(v: [f64; N]) -> Self {
        Value::Vector(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Identity of an entry inside a dictionary or set.
///
/// Keys are totally ordered so entries iterate, serialize and replicate in a
/// deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Text(String),
    Id(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Int,
    Text,
    Id,
}

impl Key {
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Int(_) => KeyKind::Int,
            Key::Text(_) => KeyKind::Text,
            Key::Id(_) => KeyKind::Id,
        }
    }

    /// Object-key form used for dictionaries in documents.
    pub fn to_json_key(&self) -> String {
        match self {
            Key::Int(i) => i.to_string(),
            Key::Text(s) => s.clone(),
            Key::Id(id) => id.to_string(),
        }
    }

    pub fn from_json_key(s: &str, kind: KeyKind) -> StateResult<Key> {
        let bad = || StateError::Json(format!("`{s}` is not a {kind:?} key"));
        match kind {
            KeyKind::Int => s.parse().map(Key::Int).map_err(|_| bad()),
            KeyKind::Text => Ok(Key::Text(s.to_string())),
            KeyKind::Id => Uuid::parse_str(s).map(Key::Id).map_err(|_| bad()),
        }
    }

    /// Element form used for sets in documents.
    pub fn to_json(&self) -> Json {
        match self {
            Key::Int(i) => Json::from(*i),
            Key::Text(s) => Json::String(s.clone()),
            Key::Id(id) => Json::String(id.to_string()),
        }
    }

    pub fn from_json(json: &Json, kind: KeyKind) -> StateResult<Key> {
        match (kind, json) {
            (KeyKind::Int, Json::Number(n)) => n
                .as_i64()
                .map(Key::Int)
                .ok_or_else(|| StateError::Json(format!("`{n}` is not an Int key"))),
            (_, Json::String(s)) => Key::from_json_key(s, kind),
            _ => Err(StateError::Json(format!("`{json}` is not a {kind:?} key"))),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => write!(f, "{s:?}"),
            Key::Id(id) => write!(f, "{id}"),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<Uuid> for Key {
    fn from(id: Uuid) -> Self {
        Key::Id(id)
    }
}
