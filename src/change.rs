use crate::diff::{container_kind_of, InferOptions};
use crate::doc::Document;
use crate::id::{ContainerId, ContainerKind, TreeNodeId};
use crate::path::{self, PathBuf};
use crate::registry::Registry;
use crate::schema::Schema;
use crate::value::{Value, CID_KEY};
use crate::{Error, Result};

/// A tree node referenced by an outbound operation: either one that already
/// exists, or one a `TreeCreate` earlier in the same script will produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeRef {
    /// A node the document already knows.
    Existing(TreeNodeId),
    /// The node produced by the create op owning this slot.
    Pending(usize),
}

/// One typed operation of an outbound change script.
#[derive(Clone, Debug)]
pub enum ChangeOp {
    /// Set-or-insert a plain value under a map key.
    MapInsert {
        /// Target map container.
        container: ContainerId,
        /// Key.
        key: String,
        /// Plain value (explicit null included).
        value: Value,
    },
    /// Create a child container under a map key and materialize `value`
    /// into it.
    MapInsertContainer {
        /// Target map container.
        container: ContainerId,
        /// Key.
        key: String,
        /// Kind of the child container.
        kind: ContainerKind,
        /// Content materialized into the child.
        value: Value,
        /// Schema of the child, if known.
        schema: Option<Schema>,
        /// Where the child's mirrored value sits in the pending new state.
        state_path: PathBuf,
    },
    /// Delete a map key.
    MapDelete {
        /// Target map container.
        container: ContainerId,
        /// Key.
        key: String,
    },
    /// Insert a plain value into a sequence.
    ListInsert {
        /// Target sequence container.
        container: ContainerId,
        /// Insertion index.
        index: usize,
        /// Plain value.
        value: Value,
    },
    /// Create a child container at a sequence index and materialize `value`.
    ListInsertContainer {
        /// Target sequence container.
        container: ContainerId,
        /// Insertion index.
        index: usize,
        /// Kind of the child container.
        kind: ContainerKind,
        /// Content materialized into the child.
        value: Value,
        /// Schema of the child, if known.
        schema: Option<Schema>,
        /// Where the child's mirrored value sits in the pending new state.
        state_path: PathBuf,
    },
    /// Delete a sequence element.
    ListDelete {
        /// Target sequence container.
        container: ContainerId,
        /// Index to remove.
        index: usize,
    },
    /// Replace a movable-list element with a plain value.
    ListSet {
        /// Target movable-list container.
        container: ContainerId,
        /// Index to replace.
        index: usize,
        /// Plain value.
        value: Value,
    },
    /// Replace a movable-list element with a fresh child container.
    ListSetContainer {
        /// Target movable-list container.
        container: ContainerId,
        /// Index to replace.
        index: usize,
        /// Kind of the child container.
        kind: ContainerKind,
        /// Content materialized into the child.
        value: Value,
        /// Schema of the child, if known.
        schema: Option<Schema>,
        /// Where the child's mirrored value sits in the pending new state.
        state_path: PathBuf,
    },
    /// Move a movable-list element.
    ListMove {
        /// Target movable-list container.
        container: ContainerId,
        /// Current index.
        from: usize,
        /// Destination index.
        to: usize,
    },
    /// Replace a text container's content.
    TextUpdate {
        /// Target text container.
        container: ContainerId,
        /// The new text; the document computes the minimal splice.
        text: String,
    },
    /// Adjust a counter container.
    CounterIncrement {
        /// Target counter container.
        container: ContainerId,
        /// Difference between proposed and stored value.
        delta: f64,
    },
    /// Create a tree node, fill its data map, and stamp the assigned node
    /// id back into the pending state.
    TreeCreate {
        /// Target tree container.
        tree: ContainerId,
        /// Slot the assigned id is published under for later ops.
        slot: usize,
        /// Intended parent, possibly itself pending.
        parent: Option<NodeRef>,
        /// Position among the parent's children.
        index: usize,
        /// The node's mirrored value; its initial data map is materialized
        /// here, children are created by their own ops.
        node: Value,
        /// Schema of the node's data map, if known.
        schema: Option<Schema>,
        /// Where the node's mirrored value sits in the pending new state.
        state_path: PathBuf,
    },
    /// Move a tree node.
    TreeMove {
        /// Target tree container.
        tree: ContainerId,
        /// The node to move, possibly pending.
        target: NodeRef,
        /// New parent, possibly pending.
        parent: Option<NodeRef>,
        /// Position among the new parent's children.
        index: usize,
    },
    /// Delete a tree node and its subtree.
    TreeDelete {
        /// Target tree container.
        tree: ContainerId,
        /// The node to delete.
        target: TreeNodeId,
    },
}

/// The ordered sequence of operations one outbound cycle executes.
#[derive(Clone, Debug, Default)]
pub struct ChangeScript {
    ops: Vec<ChangeOp>,
    pending_slots: usize,
}

impl ChangeScript {
    /// An empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn push(&mut self, op: ChangeOp) {
        self.ops.push(op);
    }

    /// Allocates a slot for a node id a `TreeCreate` will assign.
    pub fn alloc_slot(&mut self) -> usize {
        let slot = self.pending_slots;
        self.pending_slots += 1;
        slot
    }

    /// The operations in execution order.
    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    /// True when no operation was produced.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Executes a script against the document, materializing container values
/// deeply and stamping minted ids into the pending new state. Does not
/// commit; the engine commits once afterwards with its origin tag.
pub(crate) fn execute(
    doc: &Document,
    registry: &mut Registry,
    script: ChangeScript,
    new_state: &mut Value,
    infer: InferOptions,
) -> Result<()> {
    let mut pending: Vec<Option<TreeNodeId>> = vec![None; script.pending_slots];
    let resolve = |pending: &[Option<TreeNodeId>], r: NodeRef| -> Result<TreeNodeId> {
        match r {
            NodeRef::Existing(id) => Ok(id),
            NodeRef::Pending(slot) => pending
                .get(slot)
                .copied()
                .flatten()
                .ok_or_else(|| Error::internal(format!("unresolved pending tree node #{slot}"))),
        }
    };
    let resolve_parent =
        |pending: &[Option<TreeNodeId>], p: Option<NodeRef>| -> Result<Option<TreeNodeId>> {
            p.map(|r| resolve(pending, r)).transpose()
        };
    for op in script.ops {
        match op {
            ChangeOp::MapInsert { container, key, value } => {
                doc.map(container)?.insert(&key, value)?;
            }
            ChangeOp::MapInsertContainer { container, key, kind, value, schema, state_path } => {
                let child = doc.map(container)?.insert_container(&key, kind)?;
                fill(doc, registry, child, &value, schema.as_ref(), &state_path, new_state, infer)?;
            }
            ChangeOp::MapDelete { container, key } => {
                doc.map(container)?.delete(&key)?;
            }
            ChangeOp::ListInsert { container, index, value } => match container.kind() {
                ContainerKind::MovableList => doc.movable_list(container)?.insert(index, value)?,
                _ => doc.list(container)?.insert(index, value)?,
            },
            ChangeOp::ListInsertContainer { container, index, kind, value, schema, state_path } => {
                let child = match container.kind() {
                    ContainerKind::MovableList => {
                        doc.movable_list(container)?.insert_container(index, kind)?
                    }
                    _ => doc.list(container)?.insert_container(index, kind)?,
                };
                fill(doc, registry, child, &value, schema.as_ref(), &state_path, new_state, infer)?;
            }
            ChangeOp::ListDelete { container, index } => match container.kind() {
                ContainerKind::MovableList => doc.movable_list(container)?.delete(index)?,
                _ => doc.list(container)?.delete(index)?,
            },
            ChangeOp::ListSet { container, index, value } => {
                doc.movable_list(container)?.set(index, value)?;
            }
            ChangeOp::ListSetContainer { container, index, kind, value, schema, state_path } => {
                let child = doc.movable_list(container)?.set_container(index, kind)?;
                fill(doc, registry, child, &value, schema.as_ref(), &state_path, new_state, infer)?;
            }
            ChangeOp::ListMove { container, from, to } => {
                doc.movable_list(container)?.mov(from, to)?;
            }
            ChangeOp::TextUpdate { container, text } => {
                doc.text(container)?.update(&text)?;
            }
            ChangeOp::CounterIncrement { container, delta } => {
                doc.counter(container)?.increment(delta)?;
            }
            ChangeOp::TreeCreate { tree, slot, parent, index, node, schema, state_path } => {
                let parent = resolve_parent(&pending, parent)?;
                let node = create_node(
                    doc, registry, tree, parent, index, &node, schema.as_ref(), &state_path,
                    new_state, infer, false,
                )?;
                if let Some(entry) = pending.get_mut(slot) {
                    *entry = Some(node);
                }
            }
            ChangeOp::TreeMove { tree, target, parent, index } => {
                let target = resolve(&pending, target)?;
                let parent = resolve_parent(&pending, parent)?;
                doc.tree(tree)?.mov(target, parent, index)?;
            }
            ChangeOp::TreeDelete { tree, target } => {
                doc.tree(tree)?.delete(target)?;
            }
        }
    }
    Ok(())
}

/// Creates one tree node with its data content, stamping the assigned node
/// id (and `$cid` when the schema injects it) into the pending new state.
/// With `recurse` set, the node value's children are created as well; the
/// tree diff instead emits one create per node and keeps `recurse` off.
#[allow(clippy::too_many_arguments)]
fn create_node(
    doc: &Document,
    registry: &mut Registry,
    tree: ContainerId,
    parent: Option<TreeNodeId>,
    index: usize,
    node_value: &Value,
    schema: Option<&Schema>,
    state_path: &PathBuf,
    new_state: &mut Value,
    infer: InferOptions,
    recurse: bool,
) -> Result<TreeNodeId> {
    let handle = doc.tree(tree)?;
    let node = handle.create(parent, index)?;
    if let Some(slot) = path::get_mut(new_state, state_path)? {
        if let Some(map) = slot.make_map() {
            map.insert("id".to_owned(), Value::String(node.to_string()));
            map.entry("children".to_owned()).or_insert_with(Value::list);
            map.entry("data".to_owned()).or_insert_with(Value::map);
        }
    }
    let data_id = handle.data(node)?.id();
    let data = node_value.get("data").cloned().unwrap_or_else(Value::map);
    fill(
        doc,
        registry,
        data_id,
        &data,
        schema,
        &state_path.child("data"),
        new_state,
        infer,
    )?;
    if !recurse {
        return Ok(node);
    }
    if let Some(children) = node_value.get("children").and_then(Value::as_list) {
        for (i, child) in children.iter().enumerate() {
            let child_path = state_path.child("children").child(i);
            create_node(
                doc, registry, tree, Some(node), i, child, schema, &child_path, new_state,
                infer, true,
            )?;
        }
    }
    Ok(node)
}

/// Materializes `value` into a freshly created container, registering it,
/// stamping `$cid` into the pending state for maps that inject it, and
/// recursing into nested containers.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fill(
    doc: &Document,
    registry: &mut Registry,
    id: ContainerId,
    value: &Value,
    schema: Option<&Schema>,
    state_path: &PathBuf,
    new_state: &mut Value,
    infer: InferOptions,
) -> Result<()> {
    registry.register(doc, id, schema.cloned());
    match id.kind() {
        ContainerKind::Map => {
            if schema.map(Schema::injects_cid).unwrap_or(false) {
                if let Some(slot) = path::get_mut(new_state, state_path)? {
                    if let Some(map) = slot.make_map() {
                        map.insert(CID_KEY.to_owned(), Value::String(id.to_string()));
                    }
                }
            }
            let Some(entries) = value.as_map() else {
                return Err(Error::shape(format!("expected an object to fill {id}")));
            };
            let handle = doc.map(id)?;
            for (key, item) in entries {
                if key == CID_KEY {
                    continue;
                }
                let child_schema = schema.and_then(|s| s.child_by_key(key));
                match container_kind_of(item, child_schema, infer) {
                    Some(kind) => {
                        let child = handle.insert_container(key, kind)?;
                        fill(
                            doc, registry, child, item, child_schema,
                            &state_path.child(key.as_str()), new_state, infer,
                        )?;
                    }
                    None => handle.insert(key, item.clone())?,
                }
            }
        }
        ContainerKind::List | ContainerKind::MovableList => {
            let Some(items) = value.as_list() else {
                return Err(Error::shape(format!("expected a sequence to fill {id}")));
            };
            let item_schema = schema.and_then(Schema::child_item);
            for (i, item) in items.iter().enumerate() {
                match container_kind_of(item, item_schema, infer) {
                    Some(kind) => {
                        let child = match id.kind() {
                            ContainerKind::MovableList => {
                                doc.movable_list(id)?.insert_container(i, kind)?
                            }
                            _ => doc.list(id)?.insert_container(i, kind)?,
                        };
                        fill(
                            doc, registry, child, item, item_schema, &state_path.child(i),
                            new_state, infer,
                        )?;
                    }
                    None => match id.kind() {
                        ContainerKind::MovableList => {
                            doc.movable_list(id)?.insert(i, item.clone())?
                        }
                        _ => doc.list(id)?.insert(i, item.clone())?,
                    },
                }
            }
        }
        ContainerKind::Text => {
            let Some(text) = value.as_str() else {
                return Err(Error::shape(format!("expected a string to fill {id}")));
            };
            doc.text(id)?.insert(0, text)?;
        }
        ContainerKind::Counter => {
            let n = value.as_number().unwrap_or(0.0);
            if n != 0.0 {
                doc.counter(id)?.increment(n)?;
            }
        }
        ContainerKind::Tree => {
            let Some(roots) = value.as_list() else {
                return Err(Error::shape(format!("expected a node sequence to fill {id}")));
            };
            let node_schema = schema.and_then(Schema::tree_node);
            for (i, node) in roots.iter().enumerate() {
                create_node(
                    doc, registry, id, None, i, node, node_schema, &state_path.child(i),
                    new_state, infer, true,
                )?;
            }
        }
    }
    Ok(())
}
