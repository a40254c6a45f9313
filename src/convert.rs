//! Conversions between native values and document nodes.
//!
//! The supported set is closed: strings, integers, floats, booleans, lists of
//! strings and opaque nodes, plus `Option` over any of them. Other types join
//! by implementing [`IntoNode`] and [`FromNode`], or go through the serde
//! bridge [`Json`].
//!
//! ```
//! use doccache::{FromNode, IntoNode};
//!
//! let node = vec!["a".to_string(), "b".to_string()].into_node().unwrap();
//! let back: Vec<String> = Vec::from_node(&node).unwrap();
//! assert_eq!(back, ["a", "b"]);
//! ```

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CacheError, Result};
use crate::types::{Node, Value, ValueKind};

/// Conversion of a native value into a detached document node.
pub trait IntoNode {
    fn into_node(self) -> Result<Node>;
}

/// Conversion of a document node into a native value.
pub trait FromNode: Sized {
    fn from_node(node: &Node) -> Result<Self>;
}

/// Takes the already-guarded value: the node lock is not reentrant.
fn mismatch(expected: &'static str, value: &Value) -> CacheError {
    CacheError::mismatch(expected, value.kind().as_str())
}

impl IntoNode for Node {
    fn into_node(self) -> Result<Node> {
        Ok(self)
    }
}

/// Opaque pass-through: the live handle, not a copy.
impl FromNode for Node {
    fn from_node(node: &Node) -> Result<Self> {
        Ok(node.clone())
    }
}

impl IntoNode for String {
    fn into_node(self) -> Result<Node> {
        Ok(Node::new(Value::String(self)))
    }
}

impl IntoNode for &str {
    fn into_node(self) -> Result<Node> {
        self.to_string().into_node()
    }
}

impl FromNode for String {
    fn from_node(node: &Node) -> Result<Self> {
        match &*node.read() {
            Value::String(s) => Ok(s.clone()),
            other => Err(mismatch("string", other)),
        }
    }
}

impl IntoNode for i64 {
    fn into_node(self) -> Result<Node> {
        Ok(Node::new(Value::Integer(self)))
    }
}

impl FromNode for i64 {
    fn from_node(node: &Node) -> Result<Self> {
        match &*node.read() {
            Value::Integer(i) => Ok(*i),
            other => Err(mismatch("integer", other)),
        }
    }
}

macro_rules! narrow_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoNode for $ty {
                fn into_node(self) -> Result<Node> {
                    i64::from(self).into_node()
                }
            }

            impl FromNode for $ty {
                fn from_node(node: &Node) -> Result<Self> {
                    let wide = i64::from_node(node)?;
                    <$ty>::try_from(wide)
                        .map_err(|_| CacheError::mismatch(stringify!($ty), "out-of-range integer"))
                }
            }
        )*
    };
}

narrow_integer!(i32, u32);

impl IntoNode for f64 {
    fn into_node(self) -> Result<Node> {
        if !self.is_finite() {
            return Err(CacheError::NonFiniteFloat(self));
        }
        Ok(Node::new(Value::Float(self)))
    }
}

/// Integers widen to floats on read.
impl FromNode for f64 {
    fn from_node(node: &Node) -> Result<Self> {
        match &*node.read() {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(mismatch("float", other)),
        }
    }
}

impl IntoNode for bool {
    fn into_node(self) -> Result<Node> {
        Ok(Node::new(Value::Bool(self)))
    }
}

impl FromNode for bool {
    fn from_node(node: &Node) -> Result<Self> {
        match &*node.read() {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl IntoNode for Vec<String> {
    fn into_node(self) -> Result<Node> {
        let items = self
            .into_iter()
            .map(|s| Node::new(Value::String(s)))
            .collect();
        Ok(Node::new(Value::Array(items)))
    }
}

impl FromNode for Vec<String> {
    fn from_node(node: &Node) -> Result<Self> {
        let items = match &*node.read() {
            Value::Array(items) => items.clone(),
            other => return Err(mismatch("list of strings", other)),
        };
        items
            .iter()
            .map(|item| match &*item.read() {
                Value::String(s) => Ok(s.clone()),
                other => Err(mismatch("list of strings", other)),
            })
            .collect()
    }
}

/// `None` is stored as `null`.
impl<T: IntoNode> IntoNode for Option<T> {
    fn into_node(self) -> Result<Node> {
        match self {
            Some(value) => value.into_node(),
            None => Ok(Node::null()),
        }
    }
}

impl<T: FromNode> FromNode for Option<T> {
    fn from_node(node: &Node) -> Result<Self> {
        if node.kind() == ValueKind::Null {
            return Ok(None);
        }
        T::from_node(node).map(Some)
    }
}

/// Serde bridge: stores any serializable type as a document subtree.
///
/// ```
/// use doccache::{FromNode, IntoNode, Json};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Window { width: u32, height: u32 }
///
/// let node = Json(Window { width: 800, height: 600 }).into_node().unwrap();
/// let Json(window) = Json::<Window>::from_node(&node).unwrap();
/// assert_eq!(window, Window { width: 800, height: 600 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoNode for Json<T> {
    fn into_node(self) -> Result<Node> {
        let json = serde_json::to_value(&self.0)?;
        Ok(Node::from_json(&json))
    }
}

impl<T: DeserializeOwned> FromNode for Json<T> {
    fn from_node(node: &Node) -> Result<Self> {
        Ok(Json(serde_json::from_value(node.to_json())?))
    }
}

impl Node {
    /// Typed read of a child entry. `None` when the key is absent.
    pub fn get<T: FromNode>(&self, key: &str) -> Result<Option<T>> {
        match self.child(key)? {
            Some(child) => T::from_node(&child).map(Some).map_err(|e| e.with_key(key)),
            None => Ok(None),
        }
    }

    /// Typed write of a child entry. Nothing is flushed; see [`Node::persist`].
    pub fn set<T: IntoNode>(&self, key: &str, value: T) -> Result<()> {
        self.set_child(key, value.into_node()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(String::from_node(&"hi".into_node().unwrap()).unwrap(), "hi");
        assert_eq!(i64::from_node(&(-9_i64).into_node().unwrap()).unwrap(), -9);
        assert_eq!(f64::from_node(&2.25_f64.into_node().unwrap()).unwrap(), 2.25);
        assert!(bool::from_node(&true.into_node().unwrap()).unwrap());
    }

    #[test]
    fn test_integer_widens_to_float() {
        let node = 7_i64.into_node().unwrap();
        assert_eq!(f64::from_node(&node).unwrap(), 7.0);
    }

    #[test]
    fn test_float_does_not_narrow_to_integer() {
        let node = 7.0_f64.into_node().unwrap();
        assert!(matches!(
            i64::from_node(&node),
            Err(CacheError::TypeMismatch { expected: "integer", found: "float", .. })
        ));
    }

    #[test]
    fn test_narrow_integers_check_range() {
        let node = (u32::MAX as i64 + 1).into_node().unwrap();
        assert!(u32::from_node(&node).is_err());
        let node = (-1_i64).into_node().unwrap();
        assert!(u32::from_node(&node).is_err());
        assert_eq!(i32::from_node(&node).unwrap(), -1);
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(matches!(f64::NAN.into_node(), Err(CacheError::NonFiniteFloat(_))));
        assert!(matches!(
            f64::INFINITY.into_node(),
            Err(CacheError::NonFiniteFloat(_))
        ));
    }

    #[test]
    fn test_string_list() {
        let node = vec!["x".to_string(), "y".to_string()].into_node().unwrap();
        assert_eq!(node.to_json(), json!(["x", "y"]));

        let mixed = Node::from_json(&json!(["x", 1]));
        assert!(matches!(
            Vec::<String>::from_node(&mixed),
            Err(CacheError::TypeMismatch { expected: "list of strings", found: "integer", .. })
        ));
    }

    #[test]
    fn test_option_maps_null() {
        let none: Option<i64> = None;
        let node = none.into_node().unwrap();
        assert_eq!(node.kind(), ValueKind::Null);
        assert_eq!(Option::<i64>::from_node(&node).unwrap(), None);
        assert_eq!(
            Option::<i64>::from_node(&5_i64.into_node().unwrap()).unwrap(),
            Some(5)
        );
    }

    #[test]
    fn test_node_passes_through() {
        let object = Node::object();
        let back = Node::from_node(&object).unwrap();
        assert!(back.ptr_eq(&object));
        assert!(object.clone().into_node().unwrap().ptr_eq(&object));
    }

    #[test]
    fn test_mismatch_under_concurrent_writes() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let section = Node::object();
        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let section = section.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut i = 0_i64;
                while !done.load(Ordering::Relaxed) {
                    section.set("k", i).unwrap();
                    i += 1;
                }
            })
        };

        for _ in 0..200_000 {
            assert!(String::from_node(&section).is_err());
            assert!(Vec::<String>::from_node(&section).is_err());
        }
        done.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_json_bridge() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Profile {
            name: String,
            tags: Vec<String>,
            volume: f32,
        }

        let profile = Profile {
            name: "guest".into(),
            tags: vec!["a".into()],
            volume: 0.5,
        };
        let node = Json(profile).into_node().unwrap();
        assert_eq!(node.kind(), ValueKind::Object);
        let Json(back) = Json::<Profile>::from_node(&node).unwrap();
        assert_eq!(back.name, "guest");
        assert_eq!(back.volume, 0.5);

        let bad = Node::from_json(&json!({"name": 3}));
        assert!(matches!(
            Json::<Profile>::from_node(&bad),
            Err(CacheError::Conversion(_))
        ));
    }

    #[test]
    fn test_typed_child_access() {
        let section = Node::object();
        section.set("count", 3_i64).unwrap();
        assert_eq!(section.get::<i64>("count").unwrap(), Some(3));
        assert_eq!(section.get::<i64>("missing").unwrap(), None);
        match section.get::<String>("count") {
            Err(CacheError::TypeMismatch { key, .. }) => assert_eq!(key.as_deref(), Some("count")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
