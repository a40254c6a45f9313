use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::error::{CacheError, Result};

/// First character of every internal key.
pub const RESERVED_PREFIX: char = '$';

/// Root entry recording the file a document persists to.
pub const FILE_BINDING_KEY: &str = "$file";

/// Whether `key` belongs to the internal namespace
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Reject keys the public surface may not write.
pub(crate) fn check_writable(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::EmptyKey);
    }
    check_readable(key)
}

pub(crate) fn check_readable(key: &str) -> Result<()> {
    if is_reserved(key) {
        return Err(CacheError::ReservedKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a [`Node`].
///
/// Containers hold child handles; each child points back at its container
/// through a non-owning parent link.
#[derive(Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Node>),
    Object(IndexMap<String, Node>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

struct NodeInner {
    /// Upward link only. Never keeps the parent alive.
    parent: Mutex<Weak<NodeInner>>,
    value: RwLock<Value>,
}

/// Shared handle to one value in a document tree.
///
/// Cloning a `Node` clones the handle, not the value: mutations through any
/// clone are visible through all of them. A node belongs to at most one
/// container. Attaching a node that is already owned, or that would contain
/// itself, attaches a deep copy without reserved entries instead.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(value: Value) -> Self {
        match value {
            Value::Array(items) => {
                let node = Self::leaf(Value::Array(Vec::with_capacity(items.len())));
                for item in items {
                    let item = node.adopt(item);
                    if let Value::Array(slots) = &mut *node.inner.value.write() {
                        slots.push(item);
                    }
                }
                node
            }
            Value::Object(entries) => {
                let node = Self::leaf(Value::Object(IndexMap::with_capacity(entries.len())));
                for (key, child) in entries {
                    node.attach(key, child);
                }
                node
            }
            scalar => Self::leaf(scalar),
        }
    }

    fn leaf(value: Value) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                parent: Mutex::new(Weak::new()),
                value: RwLock::new(value),
            }),
        }
    }

    /// An empty object node
    pub fn object() -> Self {
        Self::leaf(Value::Object(IndexMap::new()))
    }

    pub fn array() -> Self {
        Self::leaf(Value::Array(Vec::new()))
    }

    pub fn null() -> Self {
        Self::leaf(Value::Null)
    }

    pub fn kind(&self) -> ValueKind {
        self.inner.value.read().kind()
    }

    /// Read access to the payload. Mutation goes through the container methods
    /// so that parent links stay consistent.
    pub fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.inner.value.read()
    }

    pub fn parent(&self) -> Option<Node> {
        self.inner
            .parent
            .lock()
            .upgrade()
            .map(|inner| Node { inner })
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Whether both handles point at the same node
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_parent(&self, parent: Option<&Node>) {
        *self.inner.parent.lock() = parent
            .map(|p| Arc::downgrade(&p.inner))
            .unwrap_or_default();
    }

    /// True when `self` is `other` or lives somewhere below it.
    fn is_within(&self, other: &Node) -> bool {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.ptr_eq(other) {
                return true;
            }
            current = node.parent();
        }
        false
    }

    /// Prepare `child` for attachment under `self` and link it.
    ///
    /// Must be called without holding `self`'s value lock: copying may need to
    /// read `self` when `child` is one of its ancestors.
    ///
    /// An owned child is replaced by a copy without its reserved entries.
    /// Owned means parented elsewhere or bound to a file. A child that would
    /// contain `self` is copied too.
    fn adopt(&self, child: Node) -> Node {
        let owned =
            child.parent().is_some() || child.is_bound_root() || self.is_within(&child);
        let child = if owned { child.detached_copy() } else { child };
        child.set_parent(Some(self));
        child
    }

    /// Whether this node is a document root carrying a file binding.
    fn is_bound_root(&self) -> bool {
        self.get_raw(FILE_BINDING_KEY).is_some()
    }

    /// Deep copy with the top-level reserved entries dropped.
    fn detached_copy(&self) -> Node {
        let copy = self.deep_copy();
        if let Value::Object(map) = &mut *copy.inner.value.write() {
            map.retain(|key, _| !is_reserved(key));
        }
        copy
    }

    fn attach(&self, key: String, child: Node) -> Option<Node> {
        let child = self.adopt(child);
        let previous = match &mut *self.inner.value.write() {
            Value::Object(map) => map.insert(key, child),
            _ => None,
        };
        if let Some(previous) = &previous {
            previous.set_parent(None);
        }
        previous
    }

    fn expect_kind(&self, expected: ValueKind) -> Result<()> {
        let found = self.kind();
        if found != expected {
            return Err(CacheError::mismatch(expected.as_str(), found.as_str()));
        }
        Ok(())
    }

    /// Look up an entry, reserved keys included. `None` for non-objects.
    pub(crate) fn get_raw(&self, key: &str) -> Option<Node> {
        match &*self.inner.value.read() {
            Value::Object(map) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Insert an entry, reserved keys included. Returns the replaced node, now detached.
    pub(crate) fn insert_raw(&self, key: impl Into<String>, child: Node) -> Result<Option<Node>> {
        self.expect_kind(ValueKind::Object)?;
        Ok(self.attach(key.into(), child))
    }

    pub(crate) fn remove_raw(&self, key: &str) -> Result<Option<Node>> {
        let removed = match &mut *self.inner.value.write() {
            Value::Object(map) => map.shift_remove(key),
            other => {
                return Err(CacheError::mismatch(
                    ValueKind::Object.as_str(),
                    other.kind().as_str(),
                ))
            }
        };
        if let Some(node) = &removed {
            node.set_parent(None);
        }
        Ok(removed)
    }

    /// All object entries in insertion order, reserved keys included.
    pub(crate) fn entries_raw(&self) -> Vec<(String, Node)> {
        match &*self.inner.value.read() {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        }
    }

    /// Child of an object node. Reserved keys are rejected.
    pub fn child(&self, key: &str) -> Result<Option<Node>> {
        check_readable(key)?;
        Ok(self.get_raw(key))
    }

    /// Insert or replace a child of an object node. Reserved and empty keys are rejected.
    ///
    /// Nothing is written to disk; see [`Node::persist`].
    pub fn set_child(&self, key: &str, child: Node) -> Result<Option<Node>> {
        check_writable(key)?;
        self.insert_raw(key, child)
    }

    pub fn remove_child(&self, key: &str) -> Result<Option<Node>> {
        check_writable(key)?;
        self.remove_raw(key)
    }

    /// Public keys of an object node, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        match &*self.inner.value.read() {
            Value::Object(map) => map.keys().filter(|k| !is_reserved(k)).cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Public entries of an object or items of an array. Zero for scalars.
    pub fn len(&self) -> usize {
        match &*self.inner.value.read() {
            Value::Object(map) => map.keys().filter(|k| !is_reserved(k)).count(),
            Value::Array(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append to an array node.
    pub fn push(&self, item: Node) -> Result<()> {
        self.expect_kind(ValueKind::Array)?;
        let item = self.adopt(item);
        if let Value::Array(items) = &mut *self.inner.value.write() {
            items.push(item);
        }
        Ok(())
    }

    pub fn item(&self, index: usize) -> Option<Node> {
        match &*self.inner.value.read() {
            Value::Array(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    pub fn items(&self) -> Vec<Node> {
        match &*self.inner.value.read() {
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Detached copy of the whole subtree.
    pub fn deep_copy(&self) -> Node {
        let value = match &*self.inner.value.read() {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Integer(i) => Value::Integer(*i),
            Value::Float(f) => Value::Float(*f),
            Value::String(s) => Value::String(s.clone()),
            Value::Array(items) => Value::Array(items.iter().map(Node::deep_copy).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, child)| (k.clone(), child.deep_copy()))
                    .collect(),
            ),
        };
        Node::new(value)
    }

    pub fn to_json(&self) -> JsonValue {
        match &*self.inner.value.read() {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::Number((*i).into()),
            // Non-finite floats are rejected on the way in
            Value::Float(f) => Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Node::to_json).collect()),
            Value::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, child)| (k.clone(), child.to_json()))
                    .collect::<JsonMap<_, _>>(),
            ),
        }
    }

    pub fn from_json(json: &JsonValue) -> Node {
        let value = match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                // u64 beyond i64::MAX degrades to float
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Node::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, child)| (k.clone(), Node::from_json(child)))
                    .collect(),
            ),
        };
        Node::new(value)
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Node::new(value)
    }
}

impl From<&JsonValue> for Node {
    fn from(json: &JsonValue) -> Self {
        Node::from_json(json)
    }
}

/// Structural equality. Integers and floats are distinct even when numerically equal.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.to_json() == other.to_json()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind())
            .field("root", &self.is_root())
            .field("value", &self.to_json())
            .finish()
    }
}
