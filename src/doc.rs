use crate::event::{Diff, Event, EventBatch, EventBy, EventValue, ListDelta, TextDelta, TreeOp};
use crate::id::{ContainerId, ContainerKind, TreeNodeId};
use crate::path::{PathBuf, Segment};
use crate::value::Value;
use crate::{Error, Result};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback = Arc<dyn Fn(&EventBatch) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
enum Entry {
    Value(Value),
    Child(ContainerId),
}

impl Entry {
    fn event_value(&self) -> EventValue {
        match self {
            Self::Value(v) => EventValue::Value(v.clone()),
            Self::Child(id) => EventValue::Container(*id),
        }
    }

    fn child(&self) -> Option<ContainerId> {
        match self {
            Self::Child(id) => Some(*id),
            Self::Value(_) => None,
        }
    }
}

#[derive(Debug)]
struct TreeNode {
    parent: Option<TreeNodeId>,
    children: Vec<TreeNodeId>,
    data: ContainerId,
}

#[derive(Debug, Default)]
struct TreeData {
    nodes: FnvHashMap<TreeNodeId, TreeNode>,
    roots: Vec<TreeNodeId>,
}

impl TreeData {
    fn siblings(&self, parent: Option<TreeNodeId>) -> Option<&Vec<TreeNodeId>> {
        match parent {
            None => Some(&self.roots),
            Some(p) => self.nodes.get(&p).map(|n| &n.children),
        }
    }

    fn siblings_mut(&mut self, parent: Option<TreeNodeId>) -> Option<&mut Vec<TreeNodeId>> {
        match parent {
            None => Some(&mut self.roots),
            Some(p) => self.nodes.get_mut(&p).map(|n| &mut n.children),
        }
    }

    fn is_descendant(&self, node: TreeNodeId, ancestor: TreeNodeId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }
}

#[derive(Debug)]
enum Content {
    Map(IndexMap<String, Entry>),
    List(Vec<Entry>),
    MovableList(Vec<Entry>),
    Text(String),
    Tree(TreeData),
    Counter(f64),
}

impl Content {
    fn empty(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::Map => Self::Map(IndexMap::new()),
            ContainerKind::List => Self::List(Vec::new()),
            ContainerKind::MovableList => Self::MovableList(Vec::new()),
            ContainerKind::Text => Self::Text(String::new()),
            ContainerKind::Tree => Self::Tree(TreeData::default()),
            ContainerKind::Counter => Self::Counter(0.0),
        }
    }
}

#[derive(Debug)]
struct Container {
    parent: Option<ContainerId>,
    content: Content,
}

#[derive(Default)]
struct DocState {
    containers: FnvHashMap<ContainerId, Container>,
    roots: IndexMap<String, ContainerId>,
    next_container: u64,
    next_node: u64,
    pending: Vec<Event>,
    commits: u64,
}

impl DocState {
    fn container(&self, id: ContainerId) -> Result<&Container> {
        self.containers.get(&id).ok_or(Error::StaleReference(id))
    }

    fn container_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.containers.get_mut(&id).ok_or(Error::StaleReference(id))
    }

    fn mint(&mut self, kind: ContainerKind, parent: Option<ContainerId>) -> ContainerId {
        let id = ContainerId::new(self.next_container, kind);
        self.next_container += 1;
        self.containers.insert(id, Container { parent, content: Content::empty(kind) });
        id
    }

    /// The container's current path from the state root.
    fn path_of(&self, id: ContainerId) -> Option<PathBuf> {
        let mut rev: Vec<Segment> = Vec::new();
        let mut cur = id;
        loop {
            let container = self.containers.get(&cur)?;
            let Some(parent) = container.parent else {
                let (name, _) = self.roots.iter().find(|(_, v)| **v == cur)?;
                rev.push(Segment::Key(name.clone()));
                break;
            };
            match &self.containers.get(&parent)?.content {
                Content::Map(m) => {
                    let (key, _) = m.iter().find(|(_, e)| e.child() == Some(cur))?;
                    rev.push(Segment::Key(key.clone()));
                }
                Content::List(l) | Content::MovableList(l) => {
                    let ix = l.iter().position(|e| e.child() == Some(cur))?;
                    rev.push(Segment::Index(ix));
                }
                Content::Tree(t) => {
                    let (node, _) = t.nodes.iter().find(|(_, n)| n.data == cur)?;
                    rev.push(Segment::Key("meta".into()));
                    rev.push(Segment::Node(*node));
                }
                _ => return None,
            }
            cur = parent;
        }
        rev.reverse();
        Some(rev.into_iter().collect())
    }

    fn record(&mut self, target: ContainerId, diff: Diff) {
        let path = self.path_of(target).unwrap_or_default();
        self.pending.push(Event { target, path, diff });
    }

    /// Drops a container together with every container reachable from it.
    fn drop_subtree(&mut self, id: ContainerId) {
        let Some(container) = self.containers.remove(&id) else {
            return;
        };
        let mut children = Vec::new();
        match container.content {
            Content::Map(m) => {
                children.extend(m.values().filter_map(Entry::child));
            }
            Content::List(l) | Content::MovableList(l) => {
                children.extend(l.iter().filter_map(Entry::child));
            }
            Content::Tree(t) => {
                children.extend(t.nodes.values().map(|n| n.data));
            }
            _ => {}
        }
        for child in children {
            self.drop_subtree(child);
        }
    }

    fn deep_value(&self, id: ContainerId) -> Value {
        let Some(container) = self.containers.get(&id) else {
            return Value::Null;
        };
        match &container.content {
            Content::Map(m) => {
                let out: IndexMap<String, Value> = m
                    .iter()
                    .map(|(k, e)| (k.clone(), self.entry_value(e)))
                    .collect();
                out.into()
            }
            Content::List(l) | Content::MovableList(l) => {
                let out: Vec<Value> = l.iter().map(|e| self.entry_value(e)).collect();
                out.into()
            }
            Content::Text(s) => Value::String(s.clone()),
            Content::Counter(n) => Value::Number(*n),
            Content::Tree(t) => {
                let out: Vec<Value> = t.roots.iter().map(|r| self.node_value(t, *r)).collect();
                out.into()
            }
        }
    }

    fn entry_value(&self, entry: &Entry) -> Value {
        match entry {
            Entry::Value(v) => v.clone(),
            Entry::Child(id) => self.deep_value(*id),
        }
    }

    /// Tree nodes render as `{id, meta, children}`; `meta` is the raw
    /// vocabulary the mirror normalizes to `data` at its boundary.
    fn node_value(&self, tree: &TreeData, id: TreeNodeId) -> Value {
        let mut out = IndexMap::new();
        out.insert("id".to_owned(), Value::String(id.to_string()));
        let Some(node) = tree.nodes.get(&id) else {
            return out.into();
        };
        out.insert("meta".to_owned(), self.deep_value(node.data));
        let children: Vec<Value> = node
            .children
            .iter()
            .map(|c| self.node_value(tree, *c))
            .collect();
        out.insert("children".to_owned(), children.into());
        out.into()
    }
}

struct Sub {
    id: u64,
    cb: Callback,
}

#[derive(Default)]
struct DocShared {
    state: Mutex<DocState>,
    subs: Mutex<Vec<Sub>>,
    next_sub: AtomicU64,
}

/// An in-memory document of typed containers.
///
/// The document is the source of truth the mirror reconciles against:
/// container mutations buffer typed events, and [`Document::commit`]
/// flushes them to subscribers as one [`EventBatch`] tagged with an
/// optional origin. Handles are clonable and share the same document.
#[derive(Clone, Default)]
pub struct Document {
    shared: Arc<DocShared>,
}

/// Guard for a document subscription; dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    shared: Weak<DocShared>,
    id: u64,
}

impl Subscription {
    /// Keeps the subscription alive for the document's lifetime.
    pub fn detach(mut self) {
        self.shared = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subs.lock().retain(|s| s.id != self.id);
        }
    }
}

macro_rules! root_getter {
    ($fn:ident, $kind:ident, $handle:ident) => {
        /// Returns the named root container, creating it on first touch.
        pub fn $fn(&self, name: &str) -> Result<$handle> {
            let id = self.root(name, ContainerKind::$kind)?;
            Ok($handle { doc: self.clone(), id })
        }
    };
}

macro_rules! handle_getter {
    ($fn:ident, $kind:ident, $handle:ident) => {
        /// Returns a handle for an existing container of the matching kind.
        pub fn $fn(&self, id: ContainerId) -> Result<$handle> {
            self.check(id, ContainerKind::$kind)?;
            Ok($handle { doc: self.clone(), id })
        }
    };
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    root_getter!(get_map, Map, MapRef);
    root_getter!(get_list, List, ListRef);
    root_getter!(get_movable_list, MovableList, MovableListRef);
    root_getter!(get_text, Text, TextRef);
    root_getter!(get_tree, Tree, TreeRef);
    root_getter!(get_counter, Counter, CounterRef);

    handle_getter!(map, Map, MapRef);
    handle_getter!(list, List, ListRef);
    handle_getter!(movable_list, MovableList, MovableListRef);
    handle_getter!(text, Text, TextRef);
    handle_getter!(tree, Tree, TreeRef);
    handle_getter!(counter, Counter, CounterRef);

    fn root(&self, name: &str, kind: ContainerKind) -> Result<ContainerId> {
        let mut st = self.shared.state.lock();
        if let Some(id) = st.roots.get(name) {
            if id.kind() != kind {
                return Err(Error::internal(format!(
                    "root {name:?} is a {} container, not a {}",
                    id.kind(),
                    kind
                )));
            }
            return Ok(*id);
        }
        let id = st.mint(kind, None);
        st.roots.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Creates a root container of the given kind.
    pub fn get_root(&self, name: &str, kind: ContainerKind) -> Result<ContainerId> {
        self.root(name, kind)
    }

    fn check(&self, id: ContainerId, kind: ContainerKind) -> Result<()> {
        let st = self.shared.state.lock();
        st.container(id)?;
        if id.kind() != kind {
            return Err(Error::internal(format!("{id} is not a {kind} container")));
        }
        Ok(())
    }

    /// True when the container exists.
    pub fn contains(&self, id: ContainerId) -> bool {
        self.shared.state.lock().containers.contains_key(&id)
    }

    /// The registered roots in creation order.
    pub fn roots(&self) -> Vec<(String, ContainerId)> {
        let st = self.shared.state.lock();
        st.roots.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Looks up a root container by name.
    pub fn root_id(&self, name: &str) -> Option<ContainerId> {
        self.shared.state.lock().roots.get(name).copied()
    }

    /// The container's current path from the state root.
    pub fn path_of(&self, id: ContainerId) -> Option<PathBuf> {
        self.shared.state.lock().path_of(id)
    }

    /// Deep value of the whole document. Tree nodes use the raw
    /// `{id, meta, children}` shape.
    pub fn to_value(&self) -> Value {
        let st = self.shared.state.lock();
        let out: IndexMap<String, Value> = st
            .roots
            .iter()
            .map(|(k, id)| (k.clone(), st.deep_value(*id)))
            .collect();
        out.into()
    }

    /// Deep value of one container.
    pub fn container_value(&self, id: ContainerId) -> Option<Value> {
        let st = self.shared.state.lock();
        st.containers.contains_key(&id).then(|| st.deep_value(id))
    }

    /// Map entries as values-or-children, in insertion order.
    pub fn map_entries(&self, id: ContainerId) -> Result<Vec<(String, EventValue)>> {
        let st = self.shared.state.lock();
        match &st.container(id)?.content {
            Content::Map(m) => Ok(m.iter().map(|(k, e)| (k.clone(), e.event_value())).collect()),
            _ => Err(Error::internal(format!("{id} is not a map container"))),
        }
    }

    /// List elements as values-or-children.
    pub fn list_entries(&self, id: ContainerId) -> Result<Vec<EventValue>> {
        let st = self.shared.state.lock();
        match &st.container(id)?.content {
            Content::List(l) | Content::MovableList(l) => {
                Ok(l.iter().map(Entry::event_value).collect())
            }
            _ => Err(Error::internal(format!("{id} is not a sequence container"))),
        }
    }

    /// The child container stored under a map key, if any.
    pub fn map_child(&self, id: ContainerId, key: &str) -> Option<ContainerId> {
        let st = self.shared.state.lock();
        match &st.containers.get(&id)?.content {
            Content::Map(m) => m.get(key).and_then(Entry::child),
            _ => None,
        }
    }

    /// The child container stored at a list index, if any.
    pub fn list_child(&self, id: ContainerId, index: usize) -> Option<ContainerId> {
        let st = self.shared.state.lock();
        match &st.containers.get(&id)?.content {
            Content::List(l) | Content::MovableList(l) => l.get(index).and_then(Entry::child),
            _ => None,
        }
    }

    /// Children of a tree node (or the forest roots) in order.
    pub fn tree_children(
        &self,
        id: ContainerId,
        parent: Option<TreeNodeId>,
    ) -> Result<Vec<TreeNodeId>> {
        let st = self.shared.state.lock();
        match &st.container(id)?.content {
            Content::Tree(t) => t
                .siblings(parent)
                .cloned()
                .ok_or_else(|| Error::internal(format!("unknown tree node {parent:?}"))),
            _ => Err(Error::internal(format!("{id} is not a tree container"))),
        }
    }

    /// Every node of a tree, preorder.
    pub fn tree_nodes(&self, id: ContainerId) -> Result<Vec<TreeNodeId>> {
        let st = self.shared.state.lock();
        match &st.container(id)?.content {
            Content::Tree(t) => {
                let mut out = Vec::with_capacity(t.nodes.len());
                let mut stack: Vec<TreeNodeId> = t.roots.iter().rev().copied().collect();
                while let Some(cur) = stack.pop() {
                    out.push(cur);
                    if let Some(n) = t.nodes.get(&cur) {
                        stack.extend(n.children.iter().rev());
                    }
                }
                Ok(out)
            }
            _ => Err(Error::internal(format!("{id} is not a tree container"))),
        }
    }

    /// The data map container of a tree node.
    pub fn node_data_id(&self, id: ContainerId, node: TreeNodeId) -> Result<ContainerId> {
        let st = self.shared.state.lock();
        match &st.container(id)?.content {
            Content::Tree(t) => t
                .nodes
                .get(&node)
                .map(|n| n.data)
                .ok_or_else(|| Error::internal(format!("unknown tree node {node}"))),
            _ => Err(Error::internal(format!("{id} is not a tree container"))),
        }
    }

    /// Number of commits flushed so far.
    pub fn commit_count(&self) -> u64 {
        self.shared.state.lock().commits
    }

    /// Flushes pending events to subscribers without an origin marker.
    pub fn commit(&self) {
        self.commit_internal(None);
    }

    /// Flushes pending events tagged with an origin marker.
    pub fn commit_with_origin(&self, origin: &str) {
        self.commit_internal(Some(origin.to_owned()));
    }

    fn commit_internal(&self, origin: Option<String>) {
        let batch = {
            let mut st = self.shared.state.lock();
            if st.pending.is_empty() {
                return;
            }
            st.commits += 1;
            EventBatch { origin, by: EventBy::Local, events: std::mem::take(&mut st.pending) }
        };
        let subs: Vec<Callback> = self.shared.subs.lock().iter().map(|s| s.cb.clone()).collect();
        for cb in subs {
            cb(&batch);
        }
    }

    /// Registers a subscriber for committed event batches.
    pub fn subscribe(&self, cb: impl Fn(&EventBatch) + Send + Sync + 'static) -> Subscription {
        let id = self.shared.next_sub.fetch_add(1, Ordering::Relaxed);
        self.shared.subs.lock().push(Sub { id, cb: Arc::new(cb) });
        Subscription { shared: Arc::downgrade(&self.shared), id }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DocState) -> Result<T>) -> Result<T> {
        f(&mut self.shared.state.lock())
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Document")
            .field("roots", &st.roots)
            .field("containers", &st.containers.len())
            .field("commits", &st.commits)
            .finish()
    }
}

/// Handle to a map container.
#[derive(Clone, Debug)]
pub struct MapRef {
    doc: Document,
    id: ContainerId,
}

impl MapRef {
    /// The container's id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Sets a key to a plain value (set-or-insert).
    pub fn insert(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.doc.with_state(|st| {
            let id = self.id;
            let old = match &mut st.container_mut(id)?.content {
                Content::Map(m) => m.insert(key.to_owned(), Entry::Value(value.clone())),
                _ => return Err(Error::internal(format!("{id} is not a map container"))),
            };
            if let Some(child) = old.as_ref().and_then(Entry::child) {
                st.drop_subtree(child);
            }
            let mut updated = IndexMap::new();
            updated.insert(key.to_owned(), Some(EventValue::Value(value)));
            st.record(id, Diff::Map { updated });
            Ok(())
        })
    }

    /// Creates a child container under a key.
    pub fn insert_container(&self, key: &str, kind: ContainerKind) -> Result<ContainerId> {
        self.doc.with_state(|st| {
            let id = self.id;
            st.container(id)?;
            let child = st.mint(kind, Some(id));
            let old = match &mut st.container_mut(id)?.content {
                Content::Map(m) => m.insert(key.to_owned(), Entry::Child(child)),
                _ => return Err(Error::internal(format!("{id} is not a map container"))),
            };
            if let Some(previous) = old.as_ref().and_then(Entry::child) {
                st.drop_subtree(previous);
            }
            let mut updated = IndexMap::new();
            updated.insert(key.to_owned(), Some(EventValue::Container(child)));
            st.record(id, Diff::Map { updated });
            Ok(child)
        })
    }

    /// Deletes a key. Deleting a missing key is a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.doc.with_state(|st| {
            let id = self.id;
            let old = match &mut st.container_mut(id)?.content {
                Content::Map(m) => m.shift_remove(key),
                _ => return Err(Error::internal(format!("{id} is not a map container"))),
            };
            let Some(old) = old else { return Ok(()) };
            if let Some(child) = old.child() {
                st.drop_subtree(child);
            }
            let mut updated = IndexMap::new();
            updated.insert(key.to_owned(), None);
            st.record(id, Diff::Map { updated });
            Ok(())
        })
    }

    /// Deep value of the entry under a key.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let st = self.doc.shared.state.lock();
        match &st.containers.get(&self.id)?.content {
            Content::Map(m) => m.get(key).map(|e| st.entry_value(e)),
            _ => None,
        }
    }

    /// The child container under a key, if any.
    pub fn get_child(&self, key: &str) -> Option<ContainerId> {
        self.doc.map_child(self.id, key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.doc.map_entries(self.id).map(|e| e.len()).unwrap_or(0)
    }

    /// True when the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn seq_content<'a>(
    content: &'a mut Content,
    id: ContainerId,
) -> Result<&'a mut Vec<Entry>> {
    match content {
        Content::List(l) | Content::MovableList(l) => Ok(l),
        _ => Err(Error::internal(format!("{id} is not a sequence container"))),
    }
}

fn seq_insert(st: &mut DocState, id: ContainerId, index: usize, entry: Entry) -> Result<()> {
    let event = entry.event_value();
    let seq = seq_content(&mut st.container_mut(id)?.content, id)?;
    let index = index.min(seq.len());
    seq.insert(index, entry);
    let mut delta = Vec::new();
    if index > 0 {
        delta.push(ListDelta::Retain(index));
    }
    delta.push(ListDelta::Insert(vec![event]));
    st.record(id, Diff::List(delta));
    Ok(())
}

fn seq_delete(st: &mut DocState, id: ContainerId, index: usize) -> Result<()> {
    let seq = seq_content(&mut st.container_mut(id)?.content, id)?;
    if index >= seq.len() {
        return Err(Error::internal(format!("index {index} out of bounds in {id}")));
    }
    let old = seq.remove(index);
    if let Some(child) = old.child() {
        st.drop_subtree(child);
    }
    let mut delta = Vec::new();
    if index > 0 {
        delta.push(ListDelta::Retain(index));
    }
    delta.push(ListDelta::Delete(1));
    st.record(id, Diff::List(delta));
    Ok(())
}

fn seq_len(doc: &Document, id: ContainerId) -> usize {
    doc.list_entries(id).map(|e| e.len()).unwrap_or(0)
}

/// Handle to a list container.
#[derive(Clone, Debug)]
pub struct ListRef {
    doc: Document,
    id: ContainerId,
}

impl ListRef {
    /// The container's id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Inserts a plain value; the index is clamped to the length.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.doc.with_state(|st| seq_insert(st, self.id, index, Entry::Value(value)))
    }

    /// Creates a child container at an index.
    pub fn insert_container(&self, index: usize, kind: ContainerKind) -> Result<ContainerId> {
        self.doc.with_state(|st| {
            st.container(self.id)?;
            let child = st.mint(kind, Some(self.id));
            seq_insert(st, self.id, index, Entry::Child(child))?;
            Ok(child)
        })
    }

    /// Appends a plain value.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        self.insert(usize::MAX, value)
    }

    /// Removes the element at an index.
    pub fn delete(&self, index: usize) -> Result<()> {
        self.doc.with_state(|st| seq_delete(st, self.id, index))
    }

    /// Deep value of the element at an index.
    pub fn get_value(&self, index: usize) -> Option<Value> {
        let st = self.doc.shared.state.lock();
        match &st.containers.get(&self.id)?.content {
            Content::List(l) | Content::MovableList(l) => l.get(index).map(|e| st.entry_value(e)),
            _ => None,
        }
    }

    /// The child container at an index, if any.
    pub fn get_child(&self, index: usize) -> Option<ContainerId> {
        self.doc.list_child(self.id, index)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        seq_len(&self.doc, self.id)
    }

    /// True when the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a movable-list container.
#[derive(Clone, Debug)]
pub struct MovableListRef {
    doc: Document,
    id: ContainerId,
}

impl MovableListRef {
    /// The container's id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Inserts a plain value; the index is clamped to the length.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.doc.with_state(|st| seq_insert(st, self.id, index, Entry::Value(value)))
    }

    /// Creates a child container at an index.
    pub fn insert_container(&self, index: usize, kind: ContainerKind) -> Result<ContainerId> {
        self.doc.with_state(|st| {
            st.container(self.id)?;
            let child = st.mint(kind, Some(self.id));
            seq_insert(st, self.id, index, Entry::Child(child))?;
            Ok(child)
        })
    }

    /// Appends a plain value.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        self.insert(usize::MAX, value)
    }

    /// Removes the element at an index.
    pub fn delete(&self, index: usize) -> Result<()> {
        self.doc.with_state(|st| seq_delete(st, self.id, index))
    }

    /// Moves the element at `from` so it ends up at `to`, preserving its
    /// identity (child containers keep their id).
    pub fn mov(&self, from: usize, to: usize) -> Result<()> {
        self.doc.with_state(|st| {
            let id = self.id;
            let seq = seq_content(&mut st.container_mut(id)?.content, id)?;
            if from >= seq.len() {
                return Err(Error::internal(format!("index {from} out of bounds in {id}")));
            }
            let entry = seq.remove(from);
            let to = to.min(seq.len());
            let event = entry.event_value();
            seq.insert(to, entry);
            if from == to {
                return Ok(());
            }
            let mut removal = Vec::new();
            if from > 0 {
                removal.push(ListDelta::Retain(from));
            }
            removal.push(ListDelta::Delete(1));
            st.record(id, Diff::List(removal));
            let mut insertion = Vec::new();
            if to > 0 {
                insertion.push(ListDelta::Retain(to));
            }
            insertion.push(ListDelta::Insert(vec![event]));
            st.record(id, Diff::List(insertion));
            Ok(())
        })
    }

    /// Replaces the element at an index with a plain value.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.doc.with_state(|st| {
            let id = self.id;
            let seq = seq_content(&mut st.container_mut(id)?.content, id)?;
            if index >= seq.len() {
                return Err(Error::internal(format!("index {index} out of bounds in {id}")));
            }
            let old = std::mem::replace(&mut seq[index], Entry::Value(value.clone()));
            if let Some(child) = old.child() {
                st.drop_subtree(child);
            }
            let mut delta = Vec::new();
            if index > 0 {
                delta.push(ListDelta::Retain(index));
            }
            delta.push(ListDelta::Insert(vec![EventValue::Value(value)]));
            delta.push(ListDelta::Delete(1));
            st.record(id, Diff::List(delta));
            Ok(())
        })
    }

    /// Replaces the element at an index with a fresh child container.
    pub fn set_container(&self, index: usize, kind: ContainerKind) -> Result<ContainerId> {
        self.doc.with_state(|st| {
            let id = self.id;
            st.container(id)?;
            let child = st.mint(kind, Some(id));
            let seq = seq_content(&mut st.container_mut(id)?.content, id)?;
            if index >= seq.len() {
                return Err(Error::internal(format!("index {index} out of bounds in {id}")));
            }
            let old = std::mem::replace(&mut seq[index], Entry::Child(child));
            if let Some(previous) = old.child() {
                st.drop_subtree(previous);
            }
            let mut delta = Vec::new();
            if index > 0 {
                delta.push(ListDelta::Retain(index));
            }
            delta.push(ListDelta::Insert(vec![EventValue::Container(child)]));
            delta.push(ListDelta::Delete(1));
            st.record(id, Diff::List(delta));
            Ok(child)
        })
    }

    /// Deep value of the element at an index.
    pub fn get_value(&self, index: usize) -> Option<Value> {
        let st = self.doc.shared.state.lock();
        match &st.containers.get(&self.id)?.content {
            Content::List(l) | Content::MovableList(l) => l.get(index).map(|e| st.entry_value(e)),
            _ => None,
        }
    }

    /// The child container at an index, if any.
    pub fn get_child(&self, index: usize) -> Option<ContainerId> {
        self.doc.list_child(self.id, index)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        seq_len(&self.doc, self.id)
    }

    /// True when the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a text container.
#[derive(Clone, Debug)]
pub struct TextRef {
    doc: Document,
    id: ContainerId,
}

impl TextRef {
    /// The container's id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    fn text_mut<'a>(content: &'a mut Content, id: ContainerId) -> Result<&'a mut String> {
        match content {
            Content::Text(s) => Ok(s),
            _ => Err(Error::internal(format!("{id} is not a text container"))),
        }
    }

    /// Inserts a fragment at a character position (clamped).
    pub fn insert(&self, pos: usize, fragment: &str) -> Result<()> {
        if fragment.is_empty() {
            return Ok(());
        }
        self.doc.with_state(|st| {
            let id = self.id;
            let text = Self::text_mut(&mut st.container_mut(id)?.content, id)?;
            let chars = text.chars().count();
            let pos = pos.min(chars);
            let byte = char_to_byte(text, pos);
            text.insert_str(byte, fragment);
            let mut delta = Vec::new();
            if pos > 0 {
                delta.push(TextDelta::Retain(pos));
            }
            delta.push(TextDelta::Insert(fragment.to_owned()));
            st.record(id, Diff::Text(delta));
            Ok(())
        })
    }

    /// Deletes `len` characters starting at a character position.
    pub fn delete(&self, pos: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.doc.with_state(|st| {
            let id = self.id;
            let text = Self::text_mut(&mut st.container_mut(id)?.content, id)?;
            let chars = text.chars().count();
            if pos + len > chars {
                return Err(Error::internal(format!(
                    "text range {pos}..{} out of bounds in {id}",
                    pos + len
                )));
            }
            let start = char_to_byte(text, pos);
            let end = char_to_byte(text, pos + len);
            text.replace_range(start..end, "");
            let mut delta = Vec::new();
            if pos > 0 {
                delta.push(TextDelta::Retain(pos));
            }
            delta.push(TextDelta::Delete(len));
            st.record(id, Diff::Text(delta));
            Ok(())
        })
    }

    /// Updates the whole text to `new`, emitting a minimal splice.
    pub fn update(&self, new: &str) -> Result<()> {
        self.doc.with_state(|st| {
            let id = self.id;
            let text = Self::text_mut(&mut st.container_mut(id)?.content, id)?;
            let Some((prefix, deleted, inserted)) = splice(text, new) else {
                return Ok(());
            };
            *text = new.to_owned();
            let mut delta = Vec::new();
            if prefix > 0 {
                delta.push(TextDelta::Retain(prefix));
            }
            if deleted > 0 {
                delta.push(TextDelta::Delete(deleted));
            }
            if !inserted.is_empty() {
                delta.push(TextDelta::Insert(inserted));
            }
            st.record(id, Diff::Text(delta));
            Ok(())
        })
    }

    /// The current text.
    pub fn value(&self) -> String {
        let st = self.doc.shared.state.lock();
        match st.containers.get(&self.id).map(|c| &c.content) {
            Some(Content::Text(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Number of characters.
    pub fn len(&self) -> usize {
        self.value().chars().count()
    }

    /// True when the text is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn char_to_byte(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map(|(b, _)| b).unwrap_or(s.len())
}

/// Minimal prefix/suffix splice between two strings, in characters.
/// `None` when equal.
fn splice(old: &str, new: &str) -> Option<(usize, usize, String)> {
    if old == new {
        return None;
    }
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let mut prefix = 0;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let deleted = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    Some((prefix, deleted, inserted))
}

/// Handle to a tree container.
#[derive(Clone, Debug)]
pub struct TreeRef {
    doc: Document,
    id: ContainerId,
}

impl TreeRef {
    /// The container's id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    fn tree_mut<'a>(content: &'a mut Content, id: ContainerId) -> Result<&'a mut TreeData> {
        match content {
            Content::Tree(t) => Ok(t),
            _ => Err(Error::internal(format!("{id} is not a tree container"))),
        }
    }

    /// Creates a node under `parent` at `index` (clamped), returning its id.
    pub fn create(&self, parent: Option<TreeNodeId>, index: usize) -> Result<TreeNodeId> {
        self.doc.with_state(|st| {
            let id = self.id;
            st.container(id)?;
            let node = TreeNodeId(st.next_node);
            st.next_node += 1;
            let data = st.mint(ContainerKind::Map, Some(id));
            let tree = Self::tree_mut(&mut st.container_mut(id)?.content, id)?;
            let siblings = tree
                .siblings_mut(parent)
                .ok_or_else(|| Error::internal(format!("unknown tree node {parent:?}")))?;
            let index = index.min(siblings.len());
            siblings.insert(index, node);
            tree.nodes.insert(node, TreeNode { parent, children: Vec::new(), data });
            st.record(id, Diff::Tree(vec![TreeOp::Create { target: node, parent, index }]));
            Ok(node)
        })
    }

    /// Moves a node so it ends up at `index` among `parent`'s children.
    pub fn mov(
        &self,
        target: TreeNodeId,
        parent: Option<TreeNodeId>,
        index: usize,
    ) -> Result<()> {
        self.doc.with_state(|st| {
            let id = self.id;
            let tree = Self::tree_mut(&mut st.container_mut(id)?.content, id)?;
            let node = tree
                .nodes
                .get(&target)
                .ok_or_else(|| Error::internal(format!("unknown tree node {target}")))?;
            let old_parent = node.parent;
            if let Some(p) = parent {
                if tree.is_descendant(p, target) {
                    return Err(Error::internal(format!(
                        "cannot move {target} under its own subtree"
                    )));
                }
            }
            let old_siblings = tree
                .siblings_mut(old_parent)
                .ok_or_else(|| Error::internal(format!("unknown tree node {old_parent:?}")))?;
            let old_index = old_siblings
                .iter()
                .position(|n| *n == target)
                .ok_or_else(|| Error::internal(format!("detached tree node {target}")))?;
            old_siblings.remove(old_index);
            let siblings = tree
                .siblings_mut(parent)
                .ok_or_else(|| Error::internal(format!("unknown tree node {parent:?}")))?;
            let index = index.min(siblings.len());
            siblings.insert(index, target);
            tree.nodes.get_mut(&target).expect("checked above").parent = parent;
            if old_parent == parent && old_index == index {
                return Ok(());
            }
            // the event speaks in pre-removal coordinates: a forward move
            // within one parent reports the slot the node is aimed at before
            // its own removal shifts the suffix
            let event_index = if old_parent == parent && old_index < index {
                index + 1
            } else {
                index
            };
            st.record(
                id,
                Diff::Tree(vec![TreeOp::Move {
                    target,
                    parent,
                    index: event_index,
                    old_parent,
                    old_index,
                }]),
            );
            Ok(())
        })
    }

    /// Deletes a node and its whole subtree.
    pub fn delete(&self, target: TreeNodeId) -> Result<()> {
        self.doc.with_state(|st| {
            let id = self.id;
            let tree = Self::tree_mut(&mut st.container_mut(id)?.content, id)?;
            let node = tree
                .nodes
                .get(&target)
                .ok_or_else(|| Error::internal(format!("unknown tree node {target}")))?;
            let old_parent = node.parent;
            let old_index = tree
                .siblings(old_parent)
                .and_then(|s| s.iter().position(|n| *n == target))
                .ok_or_else(|| Error::internal(format!("detached tree node {target}")))?;
            tree.siblings_mut(old_parent).expect("checked above").remove(old_index);
            // collect the subtree before detaching node records
            let mut stack = vec![target];
            let mut data_maps = Vec::new();
            while let Some(cur) = stack.pop() {
                if let Some(n) = tree.nodes.remove(&cur) {
                    data_maps.push(n.data);
                    stack.extend(n.children);
                }
            }
            for data in data_maps {
                st.drop_subtree(data);
            }
            st.record(
                id,
                Diff::Tree(vec![TreeOp::Delete { target, old_parent, old_index }]),
            );
            Ok(())
        })
    }

    /// Handle to a node's data map.
    pub fn data(&self, node: TreeNodeId) -> Result<MapRef> {
        let id = self.doc.node_data_id(self.id, node)?;
        self.doc.map(id)
    }

    /// Children of a node (or the forest roots) in order.
    pub fn children(&self, parent: Option<TreeNodeId>) -> Result<Vec<TreeNodeId>> {
        self.doc.tree_children(self.id, parent)
    }

    /// Forest roots in order.
    pub fn roots(&self) -> Vec<TreeNodeId> {
        self.children(None).unwrap_or_default()
    }
}

/// Handle to a counter container.
#[derive(Clone, Debug)]
pub struct CounterRef {
    doc: Document,
    id: ContainerId,
}

impl CounterRef {
    /// The container's id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Adds `delta` (may be negative) to the counter.
    pub fn increment(&self, delta: f64) -> Result<()> {
        self.doc.with_state(|st| {
            let id = self.id;
            match &mut st.container_mut(id)?.content {
                Content::Counter(n) => *n += delta,
                _ => return Err(Error::internal(format!("{id} is not a counter container"))),
            }
            st.record(id, Diff::Counter { increment: delta });
            Ok(())
        })
    }

    /// The current value.
    pub fn value(&self) -> f64 {
        let st = self.doc.shared.state.lock();
        match st.containers.get(&self.id).map(|c| &c.content) {
            Some(Content::Counter(n)) => *n,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_events_carry_paths() {
        let doc = Document::new();
        let todos = doc.get_map("todos").unwrap();
        let one = todos.insert_container("1", ContainerKind::Map).unwrap();
        doc.map(one).unwrap().insert("text", "Buy milk").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc.subscribe(move |batch| sink.lock().push(batch.clone()));
        doc.commit();

        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        let events = &batches[0].events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path.to_string(), "/todos");
        assert_eq!(events[1].path.to_string(), "/todos/1");
        assert_eq!(doc.commit_count(), 1);
    }

    #[test]
    fn empty_commit_is_a_noop() {
        let doc = Document::new();
        doc.get_map("m").unwrap();
        doc.commit();
        assert_eq!(doc.commit_count(), 0);
    }

    #[test]
    fn text_update_emits_minimal_splice() {
        let doc = Document::new();
        let text = doc.get_text("t").unwrap();
        text.insert(0, "Hello world").unwrap();
        doc.commit();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc.subscribe(move |batch| sink.lock().push(batch.clone()));
        text.update("Hello there").unwrap();
        doc.commit();

        assert_eq!(text.value(), "Hello there");
        let batches = seen.lock();
        let Diff::Text(delta) = &batches[0].events[0].diff else {
            panic!("expected text diff")
        };
        assert_eq!(
            delta,
            &vec![
                TextDelta::Retain(6),
                TextDelta::Delete(5),
                TextDelta::Insert("there".into())
            ]
        );
    }

    #[test]
    fn movable_list_move_preserves_child_identity() {
        let doc = Document::new();
        let items = doc.get_movable_list("items").unwrap();
        let a = items.insert_container(0, ContainerKind::Map).unwrap();
        let b = items.insert_container(1, ContainerKind::Map).unwrap();
        items.mov(1, 0).unwrap();
        assert_eq!(items.get_child(0), Some(b));
        assert_eq!(items.get_child(1), Some(a));
    }

    #[test]
    fn tree_shapes_render_with_meta() {
        let doc = Document::new();
        let tree = doc.get_tree("tree").unwrap();
        let a = tree.create(None, 0).unwrap();
        tree.data(a).unwrap().insert("title", "A").unwrap();
        let a1 = tree.create(Some(a), 0).unwrap();
        tree.data(a1).unwrap().insert("title", "A1").unwrap();

        let value = doc.to_value();
        assert_eq!(
            serde_json::Value::from(&value),
            json!({"tree": [
                {"id": a.to_string(), "meta": {"title": "A"}, "children": [
                    {"id": a1.to_string(), "meta": {"title": "A1"}, "children": []}
                ]}
            ]})
        );
    }

    #[test]
    fn tree_move_rejects_cycles() {
        let doc = Document::new();
        let tree = doc.get_tree("tree").unwrap();
        let a = tree.create(None, 0).unwrap();
        let b = tree.create(Some(a), 0).unwrap();
        assert!(tree.mov(a, Some(b), 0).is_err());
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let doc = Document::new();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let sub = doc.subscribe(move |_| *sink.lock() += 1);
        let m = doc.get_map("m").unwrap();
        m.insert("a", 1.0).unwrap();
        doc.commit();
        drop(sub);
        m.insert("b", 2.0).unwrap();
        doc.commit();
        assert_eq!(*seen.lock(), 1);
    }
}
