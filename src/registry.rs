use crate::doc::Document;
use crate::event::{Diff, EventBatch, EventValue, ListDelta, TreeOp};
use crate::id::{ContainerId, ContainerKind};
use crate::path::PathBuf;
use crate::schema::{Schema, SchemaKind};
use crate::value::Value;
use crate::{Error, Result};
use fnv::FnvHashMap;

#[derive(Debug, Default)]
struct RegEntry {
    schema: Option<Schema>,
    registered: bool,
}

/// How a child container hangs off its parent, for schema lookup.
#[derive(Clone, Copy, Debug)]
pub enum ChildKey<'a> {
    /// Map child under a key.
    Key(&'a str),
    /// Sequence element at an index.
    Index(usize),
    /// A tree node's data map.
    NodeData,
}

/// Binds container identities to their schema subtrees and tracks the
/// canonical root path of every root-level container.
///
/// Registration is idempotent: re-registering upgrades a previously unknown
/// schema and re-walks the container's children, otherwise it is a no-op.
#[derive(Debug, Default)]
pub struct Registry {
    entries: FnvHashMap<ContainerId, RegEntry>,
    root_paths: FnvHashMap<ContainerId, PathBuf>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container, recursively registering nested containers
    /// with schema guidance.
    pub fn register(&mut self, doc: &Document, id: ContainerId, schema: Option<Schema>) {
        let (walk, effective) = {
            let entry = self.entries.entry(id).or_default();
            let upgraded = entry.schema.is_none() && schema.is_some();
            if upgraded {
                entry.schema = schema;
            }
            let walk = !entry.registered || upgraded;
            entry.registered = true;
            (walk, entry.schema.clone())
        };
        if !walk {
            return;
        }
        let schema = effective.as_ref();
        match id.kind() {
            ContainerKind::Map => {
                let Ok(entries) = doc.map_entries(id) else { return };
                for (key, entry) in entries {
                    if let EventValue::Container(child) = entry {
                        let child_schema = schema.and_then(|s| s.child_by_key(&key)).cloned();
                        self.register(doc, child, child_schema);
                    }
                }
            }
            ContainerKind::List | ContainerKind::MovableList => {
                let Ok(entries) = doc.list_entries(id) else { return };
                let item = schema.and_then(Schema::child_item);
                for entry in entries {
                    if let EventValue::Container(child) = entry {
                        self.register(doc, child, item.cloned());
                    }
                }
            }
            ContainerKind::Tree => {
                let Ok(nodes) = doc.tree_nodes(id) else { return };
                let node_schema = schema.and_then(Schema::tree_node);
                for node in nodes {
                    if let Ok(data) = doc.node_data_id(id, node) {
                        self.register(doc, data, node_schema.cloned());
                    }
                }
            }
            ContainerKind::Text | ContainerKind::Counter => {}
        }
    }

    /// The schema bound to a container, if any.
    pub fn schema_of(&self, id: ContainerId) -> Option<&Schema> {
        self.entries.get(&id)?.schema.as_ref()
    }

    /// The schema applicable to a child of a registered container.
    pub fn schema_for_child(&self, id: ContainerId, key: ChildKey) -> Option<Schema> {
        let schema = self.schema_of(id)?;
        match key {
            ChildKey::Key(k) => schema.child_by_key(k).cloned(),
            ChildKey::Index(_) => schema.child_item().cloned(),
            ChildKey::NodeData => schema.tree_node().cloned(),
        }
    }

    /// The canonical root path of a root-level container.
    pub fn root_path(&self, id: ContainerId) -> Option<&PathBuf> {
        self.root_paths.get(&id)
    }

    /// Records the canonical root path of a root-level container.
    pub fn set_root_path(&mut self, id: ContainerId, path: PathBuf) {
        self.root_paths.insert(id, path);
    }

    /// Creates and registers the root containers the schema names, plus
    /// roots implied by the caller's initial shape (sequence to list,
    /// string to text, object to map).
    pub fn ensure_roots(
        &mut self,
        doc: &Document,
        root: &Schema,
        initial: Option<&Value>,
    ) -> Result<()> {
        let SchemaKind::Map(map) = &root.kind else {
            return Err(Error::shape("the root schema must be of map kind"));
        };
        for (name, field) in &map.fields {
            let kind = field.container_kind().ok_or_else(|| {
                Error::shape(format!("root field {name:?} must be container-typed"))
            })?;
            let id = doc.get_root(name, kind)?;
            self.register(doc, id, Some(field.clone()));
            self.set_root_path(id, [name.as_str()].into_iter().collect());
        }
        let Some(initial) = initial.and_then(Value::as_map) else {
            return Ok(());
        };
        for (name, value) in initial {
            self.ensure_root_for_value(doc, name, value)?;
        }
        Ok(())
    }

    /// Creates and registers a root container shaped after a state value
    /// (sequence to list, string to text, object to map). Null values are
    /// skipped; other primitives have no root container kind.
    pub fn ensure_root_for_value(
        &mut self,
        doc: &Document,
        name: &str,
        value: &Value,
    ) -> Result<Option<ContainerId>> {
        if let Some(id) = doc.root_id(name) {
            return Ok(Some(id));
        }
        let kind = match value {
            Value::Map(_) => ContainerKind::Map,
            Value::List(_) => ContainerKind::List,
            Value::String(_) => ContainerKind::Text,
            Value::Null => return Ok(None),
            other => {
                return Err(Error::shape(format!(
                    "cannot mirror a root {} under {name:?}",
                    other.kind()
                )))
            }
        };
        let id = doc.get_root(name, kind)?;
        self.register(doc, id, None);
        self.set_root_path(id, [name].into_iter().collect());
        Ok(Some(id))
    }

    /// Pre-registers every container a batch introduces, before the event
    /// applier walks it.
    pub fn register_from_batch(&mut self, doc: &Document, batch: &EventBatch) {
        for event in &batch.events {
            if !self.entries.contains_key(&event.target) {
                self.register(doc, event.target, None);
            }
            match &event.diff {
                Diff::Map { updated } => {
                    for (key, change) in updated {
                        if let Some(EventValue::Container(child)) = change {
                            let schema = self.schema_for_child(event.target, ChildKey::Key(key));
                            self.register(doc, *child, schema);
                        }
                    }
                }
                Diff::List(delta) => {
                    for item in delta {
                        let ListDelta::Insert(items) = item else { continue };
                        for inserted in items {
                            if let EventValue::Container(child) = inserted {
                                let schema =
                                    self.schema_for_child(event.target, ChildKey::Index(0));
                                self.register(doc, *child, schema);
                            }
                        }
                    }
                }
                Diff::Tree(ops) => {
                    for op in ops {
                        let TreeOp::Create { target: node, .. } = op else { continue };
                        if let Ok(data) = doc.node_data_id(event.target, *node) {
                            let schema = self.schema_for_child(event.target, ChildKey::NodeData);
                            self.register(doc, data, schema);
                        }
                    }
                }
                Diff::Text(_) | Diff::Counter { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_and_upgrades_schema() {
        let doc = Document::new();
        let todos = doc.get_map("todos").unwrap();
        let one = todos.insert_container("1", ContainerKind::Map).unwrap();

        let mut registry = Registry::new();
        registry.register(&doc, todos.id(), None);
        assert!(registry.schema_of(todos.id()).is_none());
        assert!(registry.schema_of(one).is_none());

        let schema = Schema::map([]).catchall(Schema::map([("id", Schema::string())]));
        registry.register(&doc, todos.id(), Some(schema));
        assert!(registry.schema_of(todos.id()).is_some());
        // the upgrade re-walked children with schema guidance
        assert!(registry.schema_of(one).is_some());
    }

    #[test]
    fn ensure_roots_creates_schema_and_initial_roots() {
        let doc = Document::new();
        let mut registry = Registry::new();
        let root = Schema::map([
            ("todos", Schema::map([])),
            ("notes", Schema::text()),
        ]);
        let initial: Value = serde_json::json!({"extra": [1.0], "title": "x"}).into();
        registry.ensure_roots(&doc, &root, Some(&initial)).unwrap();

        assert_eq!(doc.root_id("todos").unwrap().kind(), ContainerKind::Map);
        assert_eq!(doc.root_id("notes").unwrap().kind(), ContainerKind::Text);
        assert_eq!(doc.root_id("extra").unwrap().kind(), ContainerKind::List);
        assert_eq!(doc.root_id("title").unwrap().kind(), ContainerKind::Text);
        let todos = doc.root_id("todos").unwrap();
        assert_eq!(registry.root_path(todos).unwrap().to_string(), "/todos");
    }

    #[test]
    fn rejects_non_container_roots() {
        let doc = Document::new();
        let mut registry = Registry::new();
        let root = Schema::map([("n", Schema::number())]);
        assert!(registry.ensure_roots(&doc, &root, None).is_err());
    }
}
