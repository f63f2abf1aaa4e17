use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Synthesized map key carrying the container id of the mirrored container.
/// Never written to the document.
pub const CID_KEY: &str = "$cid";

/// A finite JSON-like tree.
///
/// Leaves are strings, finite numbers, booleans, or the null sentinel;
/// interior nodes are insertion-ordered mappings or sequences. Interior
/// nodes sit behind [`Arc`], so cloning a value is cheap and mutation is
/// copy-on-write: untouched subtrees stay shared between snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null. A valid map value, preserved through both directions.
    Null,
    /// Boolean leaf.
    Bool(bool),
    /// Finite numeric leaf.
    Number(f64),
    /// String leaf.
    String(String),
    /// Insertion-ordered mapping.
    Map(Arc<IndexMap<String, Value>>),
    /// Ordered sequence.
    List(Arc<Vec<Value>>),
}

/// Discriminant of a [`Value`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ValueKind {
    /// [`Value::Null`]
    Null,
    /// [`Value::Bool`]
    Bool,
    /// [`Value::Number`]
    Number,
    /// [`Value::String`]
    String,
    /// [`Value::Map`]
    Map,
    /// [`Value::List`]
    List,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Map => "map",
            Self::List => "list",
        };
        f.write_str(s)
    }
}

impl Value {
    /// An empty mapping.
    pub fn map() -> Self {
        Self::Map(Arc::new(IndexMap::new()))
    }

    /// An empty sequence.
    pub fn list() -> Self {
        Self::List(Arc::new(Vec::new()))
    }

    /// The value's discriminant.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::String(_) => ValueKind::String,
            Self::Map(_) => ValueKind::Map,
            Self::List(_) => ValueKind::List,
        }
    }

    /// True for the null sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrows the boolean leaf, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrows the numeric leaf, if this is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrows the string leaf, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrows the mapping, if this is one.
    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrows the sequence, if this is one.
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Mutable access to the mapping, cloning shared structure on demand.
    pub fn make_map(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Self::Map(m) => Some(Arc::make_mut(m)),
            _ => None,
        }
    }

    /// Mutable access to the sequence, cloning shared structure on demand.
    pub fn make_list(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Self::List(l) => Some(Arc::make_mut(l)),
            _ => None,
        }
    }

    /// Looks up a key in a mapping value. `None` for other kinds.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    /// Looks up an index in a sequence value. `None` for other kinds.
    pub fn index(&self, ix: usize) -> Option<&Value> {
        self.as_list()?.get(ix)
    }

    /// A copy with every `$cid` field removed, at any depth. Used when
    /// comparing mirrored state against the document's view.
    pub fn without_cid(&self) -> Value {
        match self {
            Self::Map(m) => {
                let stripped = m
                    .iter()
                    .filter(|(k, _)| k.as_str() != CID_KEY)
                    .map(|(k, v)| (k.clone(), v.without_cid()))
                    .collect();
                Self::Map(Arc::new(stripped))
            }
            Self::List(l) => Self::List(Arc::new(l.iter().map(Value::without_cid).collect())),
            other => other.clone(),
        }
    }

    /// True when the value's kind matches a tree node: a mapping with both
    /// `id` and `children` fields.
    pub(crate) fn is_tree_node(&self) -> bool {
        self.as_map()
            .map(|m| m.contains_key("id") && m.contains_key("children"))
            .unwrap_or(false)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(m: IndexMap<String, Value>) -> Self {
        Self::Map(Arc::new(m))
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Self::List(Arc::new(l))
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(a) => {
                Self::List(Arc::new(a.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(o) => Self::Map(Arc::new(
                o.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
            Value::List(l) => {
                serde_json::Value::Array(l.iter().map(serde_json::Value::from).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip() {
        let v: Value = json!({"a": [1.0, "x", null], "b": {"c": true}}).into();
        assert_eq!(v.get("a").unwrap().index(1).unwrap().as_str(), Some("x"));
        assert!(v.get("a").unwrap().index(2).unwrap().is_null());
        let back: serde_json::Value = (&v).into();
        assert_eq!(back, json!({"a": [1.0, "x", null], "b": {"c": true}}));
    }

    #[test]
    fn copy_on_write_shares_untouched_subtrees() {
        let a: Value = json!({"left": {"x": 1.0}, "right": {"y": 2.0}}).into();
        let mut b = a.clone();
        b.make_map()
            .unwrap()
            .insert("right".into(), json!({"y": 3.0}).into());
        // left is still the same allocation in both snapshots
        match (a.get("left").unwrap(), b.get("left").unwrap()) {
            (Value::Map(l), Value::Map(r)) => assert!(Arc::ptr_eq(l, r)),
            _ => panic!("expected maps"),
        }
        assert_eq!(a.get("right").unwrap(), &Value::from(json!({"y": 2.0})));
    }

    #[test]
    fn without_cid_strips_at_depth() {
        let v: Value = json!({
            "$cid": "cid:1:map",
            "inner": {"$cid": "cid:2:map", "x": 1.0},
            "list": [{"$cid": "cid:3:map"}]
        })
        .into();
        let stripped = v.without_cid();
        assert_eq!(
            serde_json::Value::from(&stripped),
            json!({"inner": {"x": 1.0}, "list": [{}]})
        );
    }

    #[test]
    fn serde_untagged_roundtrip() {
        let v: Value = json!({"n": 1.5, "s": "hi", "b": false, "z": null}).into();
        let text = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, back);
    }
}
