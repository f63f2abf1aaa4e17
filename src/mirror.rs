use crate::applier::{apply_batch, ApplyEnv};
use crate::change::{self, ChangeScript};
use crate::diff::{diff_container, DiffCtx, InferOptions};
use crate::doc::{Document, Subscription};
use crate::event::{EventBatch, EventValue};
use crate::id::{ContainerId, ContainerKind, TreeNodeId};
use crate::registry::{ChildKey, Registry};
use crate::schema::Schema;
use crate::value::{Value, CID_KEY};
use crate::{Error, Result};
use fnv::FnvHashSet;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Origin marker stamped on outbound commits and filtered on receive.
pub const OUTBOUND_ORIGIN: &str = "to-source";

/// Which way a state update travelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// The document changed and the state followed.
    FromSource,
    /// A caller changed the state and the document followed.
    ToSource,
    /// Both at once (initial synchronization).
    Bidirectional,
}

/// Metadata passed to state subscribers.
#[derive(Clone, Debug)]
pub struct UpdateMeta {
    /// Which way the update travelled.
    pub direction: Direction,
    /// Caller-provided tags, outbound only.
    pub tags: Vec<String>,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct MirrorOptions {
    /// Validate proposed states against the schema.
    pub validate_updates: bool,
    /// Whether invalid updates fail the call or are accepted with a log.
    pub throw_on_validation_error: bool,
    /// Emit diagnostic logging for schema misses and dropped updates.
    pub debug: bool,
    /// After each outbound cycle, compare the state against the document's
    /// normalized view and fail on divergence.
    pub check_state_consistency: bool,
    /// Container inference for fields no schema covers.
    pub infer: InferOptions,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            validate_updates: true,
            throw_on_validation_error: true,
            debug: false,
            check_state_consistency: false,
            infer: InferOptions::default(),
        }
    }
}

type StateCallback = Arc<dyn Fn(&Value, &UpdateMeta) + Send + Sync>;

struct Inner {
    state: Value,
    schema: Schema,
    registry: Registry,
    options: MirrorOptions,
    busy: bool,
}

struct MirrorShared {
    doc: Document,
    inner: Mutex<Inner>,
    subs: Mutex<Vec<(u64, StateCallback)>>,
    next_sub: AtomicU64,
}

/// Guard for a state subscription; dropping it unsubscribes.
#[must_use = "dropping a StateSubscription immediately unsubscribes"]
pub struct StateSubscription {
    shared: Weak<MirrorShared>,
    id: u64,
}

impl StateSubscription {
    /// Keeps the subscription alive for the mirror's lifetime.
    pub fn detach(mut self) {
        self.shared = Weak::new();
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subs.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// The reconciliation engine: keeps an immutable state tree equivalent to
/// a document of typed containers, both ways.
///
/// Inbound event batches are applied through the event applier; outbound
/// state proposals are diffed into a change script and executed against the
/// document within a single origin-tagged commit. A `busy` flag serializes
/// the two directions, and batches carrying the outbound origin are dropped
/// so a cycle never feeds itself.
pub struct Mirror {
    shared: Arc<MirrorShared>,
    _sub: Subscription,
}

impl Mirror {
    /// Builds a mirror over `doc` with the given root schema (map kind).
    pub fn new(doc: Document, schema: Schema, options: MirrorOptions) -> Result<Self> {
        Self::with_initial_state(doc, schema, options, None)
    }

    /// Builds a mirror, overlaying `initial` over schema defaults and the
    /// document's current content and synchronizing the document to match.
    pub fn with_initial_state(
        doc: Document,
        schema: Schema,
        options: MirrorOptions,
        initial: Option<Value>,
    ) -> Result<Self> {
        let mut registry = Registry::new();
        registry.ensure_roots(&doc, &schema, initial.as_ref())?;
        for (name, id) in doc.roots() {
            if registry.root_path(id).is_none() {
                registry.register(&doc, id, None);
                registry.set_root_path(id, [name.as_str()].into_iter().collect());
            }
        }
        let snapshot = normalized_view(&doc, &registry);
        let mut desired = schema.apply_defaults(&snapshot);
        if let Some(initial) = &initial {
            desired = overlay(&desired, initial);
        }

        let shared = Arc::new(MirrorShared {
            doc: doc.clone(),
            inner: Mutex::new(Inner {
                state: snapshot.clone(),
                schema,
                registry,
                options,
                busy: false,
            }),
            subs: Mutex::new(Vec::new()),
            next_sub: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&shared);
        let sub = doc.subscribe(move |batch| {
            if let Some(shared) = weak.upgrade() {
                Mirror::on_batch(&shared, batch);
            }
        });
        let mirror = Self { shared, _sub: sub };
        if desired != snapshot {
            mirror.apply_update(desired, Vec::new())?;
        }
        Ok(mirror)
    }

    /// A snapshot of the current state. Cheap: untouched subtrees are
    /// shared with the engine's own copy.
    pub fn state(&self) -> Value {
        self.shared.inner.lock().state.clone()
    }

    /// The mirrored document.
    pub fn document(&self) -> Document {
        self.shared.doc.clone()
    }

    /// Proposes a new state by mutating a draft of the current one.
    pub fn set_state(&self, updater: impl FnOnce(&mut Value)) -> Result<()> {
        self.set_state_with_tags(Vec::new(), updater)
    }

    /// [`Mirror::set_state`] with tags surfaced to subscribers.
    pub fn set_state_with_tags(
        &self,
        tags: Vec<String>,
        updater: impl FnOnce(&mut Value),
    ) -> Result<()> {
        let mut next = self.state();
        updater(&mut next);
        self.apply_update(next, tags)
    }

    /// Replaces the state wholesale.
    pub fn replace_state(&self, next: Value) -> Result<()> {
        self.apply_update(next, Vec::new())
    }

    /// Overlays a partial mapping over the current state's top level.
    pub fn merge_state(&self, partial: Value) -> Result<()> {
        let Some(partial) = partial.as_map().cloned() else {
            return Err(Error::shape("merge_state expects an object"));
        };
        self.set_state(move |state| {
            if let Some(map) = state.make_map() {
                for (k, v) in partial {
                    map.insert(k, v);
                }
            }
        })
    }

    /// Registers a subscriber notified after every adopted update.
    pub fn subscribe(
        &self,
        cb: impl Fn(&Value, &UpdateMeta) + Send + Sync + 'static,
    ) -> StateSubscription {
        let id = self.shared.next_sub.fetch_add(1, Ordering::Relaxed);
        self.shared.subs.lock().push((id, Arc::new(cb)));
        StateSubscription { shared: Arc::downgrade(&self.shared), id }
    }

    fn apply_update(&self, new_state: Value, tags: Vec<String>) -> Result<()> {
        let shared = &self.shared;
        let doc = shared.doc.clone();
        let staged = {
            let mut inner = shared.inner.lock();
            if inner.busy {
                if inner.options.debug {
                    tracing::debug!("set_state during an active cycle dropped");
                }
                return Ok(());
            }
            inner.busy = true;
            match outbound(&doc, &mut inner, new_state) {
                Ok(staged) => staged,
                Err(err) => {
                    inner.busy = false;
                    drop(inner);
                    // flush whatever the broken cycle already wrote, tagged
                    // so the inbound path drops it; the in-memory state was
                    // never adopted
                    doc.commit_with_origin(OUTBOUND_ORIGIN);
                    return Err(err);
                }
            }
        };
        if staged.committed {
            doc.commit_with_origin(OUTBOUND_ORIGIN);
        }
        let consistent = {
            let mut inner = shared.inner.lock();
            inner.busy = false;
            if staged.changed && inner.options.check_state_consistency {
                let view = normalized_view(&doc, &inner.registry);
                inner.state.without_cid() == view.without_cid()
            } else {
                true
            }
        };
        if !consistent {
            return Err(Error::ConsistencyDivergence);
        }
        if staged.changed {
            Self::notify(shared, Direction::ToSource, tags);
        }
        Ok(())
    }

    fn on_batch(shared: &Arc<MirrorShared>, batch: &EventBatch) {
        {
            let mut inner = shared.inner.lock();
            inner.registry.register_from_batch(&shared.doc, batch);
            if batch.origin.as_deref() == Some(OUTBOUND_ORIGIN) {
                return;
            }
            if inner.busy {
                tracing::warn!("inbound batch delivered during an active cycle, dropped");
                return;
            }
            inner.busy = true;
            let mut batch = batch.clone();
            for event in &mut batch.events {
                if let Some(root) = inner.registry.root_path(event.target) {
                    // canonicalize however the document spelled the address
                    event.path = root.clone();
                }
            }
            // containers the batch itself bulk-projects land here so later
            // events in the same batch do not re-apply their content
            let mut ignore = FnvHashSet::default();
            let next = {
                let env = MirrorEnv { doc: &shared.doc, registry: &inner.registry };
                apply_batch(&inner.state, &batch, &env, &mut ignore)
            };
            inner.state = next;
            inner.busy = false;
        }
        Self::notify(shared, Direction::FromSource, Vec::new());
    }

    fn notify(shared: &Arc<MirrorShared>, direction: Direction, tags: Vec<String>) {
        let state = shared.inner.lock().state.clone();
        let subs: Vec<StateCallback> =
            shared.subs.lock().iter().map(|(_, cb)| cb.clone()).collect();
        let meta = UpdateMeta { direction, tags };
        for cb in subs {
            cb(&state, &meta);
        }
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Mirror").field("doc", &self.shared.doc).finish_non_exhaustive()
    }
}

struct Staged {
    committed: bool,
    changed: bool,
}

/// One outbound cycle: carry permanent roots, validate, diff, execute, and
/// adopt. Runs with the engine lock held; the commit itself happens after
/// the lock is released.
fn outbound(doc: &Document, inner: &mut Inner, mut new_state: Value) -> Result<Staged> {
    // roots are permanent: a proposal that omits one leaves it untouched
    for (name, _) in doc.roots() {
        if new_state.get(&name).is_none() {
            if let Some(old) = inner.state.get(&name) {
                let old = old.clone();
                if let Some(map) = new_state.make_map() {
                    map.insert(name, old);
                }
            }
        }
    }

    if inner.options.validate_updates {
        let issues = inner.schema.validate(&new_state);
        if !issues.is_empty() {
            let messages: Vec<String> = issues.iter().map(|i| i.render()).collect();
            if inner.options.throw_on_validation_error {
                return Err(Error::Validation { messages });
            }
            tracing::warn!("accepting update with validation issues: {}", messages.join("; "));
        }
    }

    let snapshot = inner.state.clone();
    if let Some(map) = new_state.as_map() {
        let pairs: Vec<(String, Value)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (name, value) in pairs {
            if doc.root_id(&name).is_none() {
                inner.registry.ensure_root_for_value(doc, &name, &value)?;
            }
        }
    } else {
        return Err(Error::shape("the mirrored state root must be an object"));
    }

    let mut script = ChangeScript::new();
    {
        let ctx = DiffCtx { doc, registry: &inner.registry, infer: inner.options.infer };
        for (name, cid) in doc.roots() {
            let old = snapshot.get(&name).cloned().unwrap_or(Value::Null);
            let Some(new_value) = new_state.get(&name) else { continue };
            let schema = inner.schema.child_by_key(&name);
            let path = [name.as_str()].into_iter().collect();
            diff_container(&ctx, &mut script, cid, &old, new_value, schema, &path)?;
        }
    }

    if script.is_empty() && new_state == snapshot {
        return Ok(Staged { committed: false, changed: false });
    }
    let committed = !script.is_empty();
    change::execute(doc, &mut inner.registry, script, &mut new_state, inner.options.infer)?;
    stamp_cids(doc, &inner.registry, &mut new_state);
    inner.state = new_state;
    Ok(Staged { committed, changed: true })
}

struct MirrorEnv<'a> {
    doc: &'a Document,
    registry: &'a Registry,
}

impl ApplyEnv for MirrorEnv<'_> {
    fn container_value(&self, id: ContainerId) -> Option<Value> {
        self.doc.contains(id).then(|| project(self.doc, self.registry, id))
    }

    fn injects_cid(&self, id: ContainerId) -> bool {
        self.registry.schema_of(id).map(Schema::injects_cid).unwrap_or(false)
    }

    fn tree_injects_cid(&self, tree: ContainerId) -> bool {
        self.registry
            .schema_for_child(tree, ChildKey::NodeData)
            .map(|s| s.injects_cid())
            .unwrap_or(false)
    }

    fn node_data_id(&self, tree: ContainerId, node: TreeNodeId) -> Option<ContainerId> {
        self.doc.node_data_id(tree, node).ok()
    }
}

/// Deep projection of a container in the mirrored shape: tree nodes as
/// `{id, data, children}` and `$cid` injected where the schema asks.
fn project(doc: &Document, registry: &Registry, id: ContainerId) -> Value {
    match id.kind() {
        ContainerKind::Map => {
            let mut out = indexmap::IndexMap::new();
            if registry.schema_of(id).map(Schema::injects_cid).unwrap_or(false) {
                out.insert(CID_KEY.to_owned(), Value::String(id.to_string()));
            }
            for (key, entry) in doc.map_entries(id).unwrap_or_default() {
                let value = match entry {
                    EventValue::Value(v) => v,
                    EventValue::Container(child) => project(doc, registry, child),
                };
                out.insert(key, value);
            }
            out.into()
        }
        ContainerKind::List | ContainerKind::MovableList => {
            let items: Vec<Value> = doc
                .list_entries(id)
                .unwrap_or_default()
                .into_iter()
                .map(|entry| match entry {
                    EventValue::Value(v) => v,
                    EventValue::Container(child) => project(doc, registry, child),
                })
                .collect();
            items.into()
        }
        ContainerKind::Tree => {
            let roots = doc.tree_children(id, None).unwrap_or_default();
            let nodes: Vec<Value> = roots
                .into_iter()
                .map(|node| project_node(doc, registry, id, node))
                .collect();
            nodes.into()
        }
        ContainerKind::Text | ContainerKind::Counter => {
            doc.container_value(id).unwrap_or(Value::Null)
        }
    }
}

fn project_node(
    doc: &Document,
    registry: &Registry,
    tree: ContainerId,
    node: TreeNodeId,
) -> Value {
    let mut out = indexmap::IndexMap::new();
    out.insert("id".to_owned(), Value::String(node.to_string()));
    let data = match doc.node_data_id(tree, node) {
        Ok(data) => project(doc, registry, data),
        Err(_) => Value::map(),
    };
    out.insert("data".to_owned(), data);
    let children: Vec<Value> = doc
        .tree_children(tree, Some(node))
        .unwrap_or_default()
        .into_iter()
        .map(|child| project_node(doc, registry, tree, child))
        .collect();
    out.insert("children".to_owned(), children.into());
    out.into()
}

/// The document's whole content in the mirrored shape.
fn normalized_view(doc: &Document, registry: &Registry) -> Value {
    let mut out = indexmap::IndexMap::new();
    for (name, id) in doc.roots() {
        out.insert(name, project(doc, registry, id));
    }
    out.into()
}

fn overlay(base: &Value, over: &Value) -> Value {
    match (base, over) {
        (Value::Map(b), Value::Map(o)) => {
            let mut out = indexmap::IndexMap::new();
            for (k, bv) in b.iter() {
                match o.get(k) {
                    Some(ov) => out.insert(k.clone(), overlay(bv, ov)),
                    None => out.insert(k.clone(), bv.clone()),
                };
            }
            for (k, ov) in o.iter() {
                if !out.contains_key(k) {
                    out.insert(k.clone(), ov.clone());
                }
            }
            out.into()
        }
        _ => over.clone(),
    }
}

/// Re-stamps `$cid` fields for surviving containers whose mirrored objects
/// lost them in the proposed state (the executor only stamps containers it
/// creates).
fn stamp_cids(doc: &Document, registry: &Registry, state: &mut Value) {
    let roots = doc.roots();
    let Some(map) = state.make_map() else { return };
    for (name, id) in roots {
        if let Some(value) = map.get_mut(&name) {
            stamp_container(doc, registry, id, value);
        }
    }
}

fn stamp_container(doc: &Document, registry: &Registry, id: ContainerId, value: &mut Value) {
    match id.kind() {
        ContainerKind::Map => {
            let Some(map) = value.make_map() else { return };
            if registry.schema_of(id).map(Schema::injects_cid).unwrap_or(false) {
                map.insert(CID_KEY.to_owned(), Value::String(id.to_string()));
            }
            for (key, entry) in doc.map_entries(id).unwrap_or_default() {
                if let EventValue::Container(child) = entry {
                    if let Some(slot) = map.get_mut(&key) {
                        stamp_container(doc, registry, child, slot);
                    }
                }
            }
        }
        ContainerKind::List | ContainerKind::MovableList => {
            let Some(list) = value.make_list() else { return };
            for (i, entry) in doc.list_entries(id).unwrap_or_default().into_iter().enumerate() {
                if let EventValue::Container(child) = entry {
                    if let Some(slot) = list.get_mut(i) {
                        stamp_container(doc, registry, child, slot);
                    }
                }
            }
        }
        ContainerKind::Tree => {
            let Some(nodes) = value.make_list() else { return };
            for node in nodes.iter_mut() {
                stamp_node(doc, registry, id, node);
            }
        }
        ContainerKind::Text | ContainerKind::Counter => {}
    }
}

fn stamp_node(doc: &Document, registry: &Registry, tree: ContainerId, node: &mut Value) {
    let id = node
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| TreeNodeId::from_str(s).ok());
    let Some(map) = node.make_map() else { return };
    if let Some(node_id) = id {
        if let Ok(data_id) = doc.node_data_id(tree, node_id) {
            if let Some(data) = map.get_mut("data") {
                stamp_container(doc, registry, data_id, data);
            }
        }
    }
    if let Some(Value::List(_)) = map.get("children") {
        let children = map.get_mut("children").and_then(Value::make_list);
        if let Some(children) = children {
            for child in children.iter_mut() {
                stamp_node(doc, registry, tree, child);
            }
        }
    }
}
