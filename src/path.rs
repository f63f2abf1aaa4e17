use crate::id::TreeNodeId;
use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// One step of a state path.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Segment {
    /// Map key.
    Key(String),
    /// Sequence index.
    Index(usize),
    /// Tree node, located by id inside a tree's node sequence.
    Node(TreeNodeId),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Key(k) => f.write_str(k),
            Self::Index(i) => write!(f, "{i}"),
            Self::Node(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Self::Key(s.to_owned())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Self::Key(s)
    }
}

impl From<usize> for Segment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

impl From<TreeNodeId> for Segment {
    fn from(id: TreeNodeId) -> Self {
        Self::Node(id)
    }
}

/// An owned path of [`Segment`]s. An empty path denotes the root.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PathBuf(SmallVec<[Segment; 4]>);

impl PathBuf {
    /// The empty path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment.
    pub fn push(&mut self, seg: impl Into<Segment>) {
        self.0.push(seg.into());
    }

    /// Returns a copy with one more segment.
    pub fn child(&self, seg: impl Into<Segment>) -> Self {
        let mut p = self.clone();
        p.push(seg);
        p
    }

    /// The path's segments.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }
}

impl std::ops::Deref for PathBuf {
    type Target = [Segment];

    fn deref(&self) -> &[Segment] {
        &self.0
    }
}

impl<S: Into<Segment>> FromIterator<S> for PathBuf {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<Segment>> Extend<S> for PathBuf {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

impl fmt::Display for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.0 {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

/// Result of resolving a path against a state tree.
#[derive(Debug)]
pub struct Resolved<'a> {
    /// The last navigable parent, `None` when the path is empty.
    pub parent: Option<&'a Value>,
    /// The key under the parent, normalized (`meta` remapped, node ids
    /// turned into the found index).
    pub key: Option<Segment>,
    /// The addressed node, `None` when navigation ran off the tree.
    pub node: Option<&'a Value>,
}

fn rendered(path: &[Segment], upto: usize) -> String {
    path[..=upto].iter().fold(String::new(), |mut acc, seg| {
        acc.push('/');
        acc.push_str(&seg.to_string());
        acc
    })
}

fn unsupported(path: &[Segment], at: usize) -> Error {
    Error::UnsupportedSegment {
        segment: path[at].to_string(),
        path: rendered(path, at),
    }
}

/// Searches a sequence of tree nodes for the node with the given id string.
fn node_position(list: &[Value], id: &str) -> Option<usize> {
    list.iter()
        .position(|n| n.is_tree_node() && n.get("id").and_then(Value::as_str) == Some(id))
}

/// Normalizes one segment against its parent: `meta` becomes `data` inside
/// a tree-node shape, and node ids become the index where the node sits.
fn normalize<'a>(parent: &Value, seg: &'a Segment) -> Option<Segment> {
    match (parent, seg) {
        (Value::Map(m), Segment::Key(k)) => {
            if k == "meta" && m.contains_key("id") && m.contains_key("children") {
                Some(Segment::Key("data".into()))
            } else {
                Some(seg.clone())
            }
        }
        (Value::List(l), Segment::Key(k)) => node_position(l, k).map(Segment::Index),
        (Value::List(l), Segment::Node(id)) => {
            node_position(l, &id.to_string()).map(Segment::Index)
        }
        (Value::List(_), Segment::Index(_)) => Some(seg.clone()),
        _ => None,
    }
}

fn child<'a>(parent: &'a Value, key: &Segment) -> Option<&'a Value> {
    match key {
        Segment::Key(k) => parent.get(k),
        Segment::Index(i) => parent.index(*i),
        Segment::Node(_) => None,
    }
}

/// Resolves `path` against `root`, returning the parent/key/node triple.
///
/// Fails with *unsupported-segment* when a segment cannot be interpreted
/// against the node it is applied to (an index into a mapping, a key into a
/// scalar). Navigation into a merely missing node is not an error: `node`
/// comes back `None` with the last valid parent and key preserved.
pub fn resolve<'a>(root: &'a Value, path: &[Segment]) -> Result<Resolved<'a>> {
    let mut parent: Option<&Value> = None;
    let mut key: Option<Segment> = None;
    let mut node: Option<&Value> = Some(root);
    for (ix, seg) in path.iter().enumerate() {
        let cur = match node {
            Some(cur) => cur,
            // ran off the tree earlier; keep the last valid parent/key
            None => return Ok(Resolved { parent, key, node: None }),
        };
        match cur {
            Value::Map(_) | Value::List(_) => {}
            _ => return Ok(Resolved { parent, key, node: None }),
        }
        let norm = match normalize(cur, seg) {
            Some(norm) => norm,
            None => match (cur, seg) {
                // a key that matched no node id: missing, not unsupported
                (Value::List(_), Segment::Key(_)) | (Value::List(_), Segment::Node(_)) => {
                    parent = Some(cur);
                    key = Some(seg.clone());
                    node = None;
                    continue;
                }
                _ => return Err(unsupported(path, ix)),
            },
        };
        parent = Some(cur);
        node = child(cur, &norm);
        key = Some(norm);
    }
    Ok(Resolved { parent, key, node })
}

fn step_mut<'a>(cur: &'a mut Value, norm: &Segment) -> Option<&'a mut Value> {
    match (cur, norm) {
        (Value::Map(m), Segment::Key(k)) => std::sync::Arc::make_mut(m).get_mut(k),
        (Value::List(l), Segment::Index(i)) => std::sync::Arc::make_mut(l).get_mut(*i),
        _ => None,
    }
}

/// Mutable variant of [`resolve`] addressing the target node itself.
/// Returns `Ok(None)` when the target is missing.
pub fn get_mut<'a>(root: &'a mut Value, path: &[Segment]) -> Result<Option<&'a mut Value>> {
    let mut cur = root;
    for (ix, seg) in path.iter().enumerate() {
        match cur {
            Value::Map(_) | Value::List(_) => {}
            _ => return Ok(None),
        }
        let norm = match normalize(cur, seg) {
            Some(norm) => norm,
            None => match (&*cur, seg) {
                (Value::List(_), Segment::Key(_)) | (Value::List(_), Segment::Node(_)) => {
                    return Ok(None)
                }
                _ => return Err(unsupported(path, ix)),
            },
        };
        cur = match step_mut(cur, &norm) {
            Some(next) => next,
            None => return Ok(None),
        };
    }
    Ok(Some(cur))
}

/// Navigates to the target, inserting `default` at the final segment when
/// the target is missing. Intermediate nodes must exist.
pub fn get_or_insert_with<'a>(
    root: &'a mut Value,
    path: &[Segment],
    default: impl FnOnce() -> Value,
) -> Result<&'a mut Value> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(root);
    };
    let parent = get_mut(root, parents)?
        .ok_or_else(|| Error::internal(format!("missing parent at {}", rendered(path, path.len() - 1))))?;
    let norm = normalize(parent, last);
    match (parent, norm) {
        (Value::Map(m), Some(Segment::Key(k))) => {
            Ok(std::sync::Arc::make_mut(m).entry(k).or_insert_with(default))
        }
        (Value::List(l), Some(Segment::Index(i))) => {
            let l = std::sync::Arc::make_mut(l);
            if i >= l.len() {
                l.push(default());
                let last = l.len() - 1;
                Ok(&mut l[last])
            } else {
                Ok(&mut l[i])
            }
        }
        (Value::List(_), None) => Err(Error::internal(format!(
            "missing tree node at {}",
            rendered(path, path.len() - 1)
        ))),
        _ => Err(unsupported(path, path.len() - 1)),
    }
}
