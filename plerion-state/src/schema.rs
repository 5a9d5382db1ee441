//! Static shape of a state tree.
//!
//! A [`Schema`] is the recipe a tree instantiates from: composites declare
//! their fields up front, collections declare the shape of their entries.
//! Schemas are cheap to clone (composite bodies and entry schemas sit behind
//! `Arc`), so every node keeps a copy of its own.
//!
//! ```text
//!   Schema::composite()
//!       .field("users", Schema::dictionary(KeyKind::Id, user))
//!       .field("hidden", Schema::set(KeyKind::Id))
//!       .on_initialize(|tree, node| { ... register derived values ... })
//!       .build()
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::StateResult;
use crate::node::NodeId;
use crate::tree::StateTree;
use crate::value::{KeyKind, Value, ValueKind};

/// Post-initialize hook run once when a composite instance becomes Active.
pub type Hook = Arc<dyn Fn(&mut StateTree, NodeId) -> StateResult<()> + Send + Sync>;

#[derive(Clone)]
pub enum Schema {
    Primitive {
        kind: ValueKind,
        default: Value,
        nullable: bool,
    },
    Composite(Arc<CompositeSchema>),
    Dictionary {
        key: KeyKind,
        entry: Arc<Schema>,
    },
    Set {
        key: KeyKind,
    },
    List {
        element: ValueKind,
    },
    Array {
        element: ValueKind,
    },
}

pub struct CompositeSchema {
    pub fields: Vec<FieldSchema>,
    pub hook: Option<Hook>,
}

#[derive(Clone)]
pub struct FieldSchema {
    pub name: Arc<str>,
    pub schema: Schema,
}

impl CompositeSchema {
    pub fn field_index(&self, name: &str) -> Option<u16> {
        self.fields
            .iter()
            .position(|f| &*f.name == name)
            .map(|i| i as u16)
    }
}

impl Schema {
    pub fn primitive(kind: ValueKind) -> Self {
        Schema::Primitive {
            kind,
            default: Value::zero(kind),
            nullable: false,
        }
    }

    /// Primitive with an explicit default. The kind is taken from the value.
    pub fn with_default(default: impl Into<Value>) -> Self {
        let default = default.into();
        Schema::Primitive {
            kind: default.kind(),
            default,
            nullable: false,
        }
    }

    /// Optional primitive, `Null` until set.
    pub fn nullable(kind: ValueKind) -> Self {
        Schema::Primitive {
            kind,
            default: Value::Null,
            nullable: true,
        }
    }

    pub fn bool() -> Self {
        Self::primitive(ValueKind::Bool)
    }

    pub fn int() -> Self {
        Self::primitive(ValueKind::Int)
    }

    pub fn float() -> Self {
        Self::primitive(ValueKind::Float)
    }

    pub fn text() -> Self {
        Self::primitive(ValueKind::Text)
    }

    pub fn id() -> Self {
        Self::primitive(ValueKind::Id)
    }

    pub fn vector() -> Self {
        Self::primitive(ValueKind::Vector)
    }

    pub fn dictionary(key: KeyKind, entry: Schema) -> Self {
        Schema::Dictionary {
            key,
            entry: Arc::new(entry),
        }
    }

    pub fn set(key: KeyKind) -> Self {
        Schema::Set { key }
    }

    pub fn list(element: ValueKind) -> Self {
        Schema::List { element }
    }

    pub fn array(element: ValueKind) -> Self {
        Schema::Array { element }
    }

    pub fn composite() -> CompositeBuilder {
        CompositeBuilder {
            fields: Vec::new(),
            hook: None,
        }
    }

    pub fn as_composite(&self) -> Option<&CompositeSchema> {
        match self {
            Schema::Composite(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Primitive {
                kind,
                default,
                nullable,
            } => f
                .debug_struct("Primitive")
                .field("kind", kind)
                .field("default", default)
                .field("nullable", nullable)
                .finish(),
            Schema::Composite(c) => {
                let mut s = f.debug_struct("Composite");
                for field in &c.fields {
                    s.field(&field.name, &field.schema);
                }
                s.field("hook", &c.hook.is_some()).finish()
            }
            Schema::Dictionary { key, entry } => f
                .debug_struct("Dictionary")
                .field("key", key)
                .field("entry", entry)
                .finish(),
            Schema::Set { key } => f.debug_struct("Set").field("key", key).finish(),
            Schema::List { element } => f.debug_struct("List").field("element", element).finish(),
            Schema::Array { element } => {
                f.debug_struct("Array").field("element", element).finish()
            }
        }
    }
}

/// Builder for composite schemas. Field order is declaration order and is
/// the wire identity of each field.
pub struct CompositeBuilder {
    fields: Vec<FieldSchema>,
    hook: Option<Hook>,
}

impl CompositeBuilder {
    pub fn field(mut self, name: &str, schema: Schema) -> Self {
        debug_assert!(
            self.fields.iter().all(|f| &*f.name != name),
            "duplicate field `{name}`"
        );
        self.fields.push(FieldSchema {
            name: Arc::from(name),
            schema,
        });
        self
    }

    pub fn on_initialize<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut StateTree, NodeId) -> StateResult<()> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Schema {
        Schema::Composite(Arc::new(CompositeSchema {
            fields: self.fields,
            hook: self.hook,
        }))
    }
}
