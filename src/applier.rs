use crate::event::{Diff, Event, EventBatch, EventValue, ListDelta, TextDelta, TreeOp};
use crate::id::{ContainerId, ContainerKind, TreeNodeId};
use crate::path;
use crate::value::{Value, CID_KEY};
use crate::Result;
use fnv::FnvHashSet;
use indexmap::IndexMap;

/// What the applier needs from its surroundings. Injected by the
/// reconciliation engine; the applier itself never touches the document.
pub(crate) trait ApplyEnv {
    /// Deep, normalized projection of a container (tree nodes in `data`
    /// shape, `$cid` injected where the schema asks for it).
    fn container_value(&self, id: ContainerId) -> Option<Value>;
    /// Whether the container's mirrored object carries `$cid`.
    fn injects_cid(&self, id: ContainerId) -> bool;
    /// Whether the tree's node data maps carry `$cid`.
    fn tree_injects_cid(&self, tree: ContainerId) -> bool;
    /// The container id of a tree node's data map.
    fn node_data_id(&self, tree: ContainerId, node: TreeNodeId) -> Option<ContainerId>;
}

/// Applies a batch of events to `state`, returning the next state.
///
/// `ignore` collects containers whose content was already materialized in
/// full: inserted containers are bulk-projected and their ids added, so
/// later events in the same batch do not re-apply content. Event-level
/// faults are logged and skipped; the rest of the batch still applies.
pub(crate) fn apply_batch<E: ApplyEnv>(
    state: &Value,
    batch: &EventBatch,
    env: &E,
    ignore: &mut FnvHashSet<ContainerId>,
) -> Value {
    let mut next = state.clone();
    for event in &batch.events {
        if ignore.contains(&event.target) {
            continue;
        }
        if let Err(err) = apply_event(&mut next, event, env, ignore) {
            tracing::warn!("skipping event at {}: {}", event.path, err);
        }
    }
    next
}

fn apply_event<E: ApplyEnv>(
    state: &mut Value,
    event: &Event,
    env: &E,
    ignore: &mut FnvHashSet<ContainerId>,
) -> Result<()> {
    let target = path::get_or_insert_with(state, &event.path, || event.diff.baseline())?;
    if !kind_matches(target, &event.diff) {
        *target = event.diff.baseline();
    }
    match &event.diff {
        Diff::Map { updated } => apply_map(target, updated, env, ignore),
        Diff::List(delta) => apply_list(target, delta, env, ignore),
        Diff::Text(delta) => apply_text(target, delta),
        Diff::Tree(ops) => apply_tree(target, ops, event.target, env),
        Diff::Counter { increment } => {
            let current = target.as_number().unwrap_or(0.0);
            *target = Value::Number(current + increment);
            Ok(())
        }
    }
}

fn kind_matches(value: &Value, diff: &Diff) -> bool {
    match diff {
        Diff::Map { .. } => value.as_map().is_some(),
        Diff::List(_) | Diff::Tree(_) => value.as_list().is_some(),
        Diff::Text(_) => value.as_str().is_some(),
        Diff::Counter { .. } => value.as_number().is_some(),
    }
}

fn neutral(kind: ContainerKind) -> Value {
    match kind {
        ContainerKind::Map => Value::map(),
        ContainerKind::List | ContainerKind::MovableList | ContainerKind::Tree => Value::list(),
        ContainerKind::Text => Value::String(String::new()),
        ContainerKind::Counter => Value::Number(0.0),
    }
}

fn apply_map<E: ApplyEnv>(
    target: &mut Value,
    updated: &IndexMap<String, Option<EventValue>>,
    env: &E,
    ignore: &FnvHashSet<ContainerId>,
) -> Result<()> {
    let map = target
        .make_map()
        .ok_or_else(|| crate::Error::shape("map diff against a non-map value"))?;
    for (key, change) in updated {
        match change {
            None => {
                map.shift_remove(key);
            }
            Some(EventValue::Container(id)) => {
                // already bulk-projected earlier in this batch; don't
                // clobber it with a baseline
                if ignore.contains(id) {
                    continue;
                }
                let mut baseline = neutral(id.kind());
                if env.injects_cid(*id) {
                    if let Some(m) = baseline.make_map() {
                        m.insert(CID_KEY.to_owned(), Value::String(id.to_string()));
                    }
                }
                map.insert(key.clone(), baseline);
            }
            // explicit null included: a valid map value, preserved as-is
            Some(EventValue::Value(v)) => {
                map.insert(key.clone(), v.clone());
            }
        }
    }
    Ok(())
}

fn apply_list<E: ApplyEnv>(
    target: &mut Value,
    delta: &[ListDelta],
    env: &E,
    ignore: &mut FnvHashSet<ContainerId>,
) -> Result<()> {
    let old = target
        .as_list()
        .ok_or_else(|| crate::Error::shape("list diff against a non-sequence value"))?;
    let mut out: Vec<Value> = Vec::with_capacity(old.len());
    let mut cursor = 0usize;
    for item in delta {
        match item {
            ListDelta::Retain(n) => {
                let end = (cursor + n).min(old.len());
                out.extend_from_slice(old.get(cursor..end).unwrap_or(&[]));
                cursor = end;
            }
            ListDelta::Delete(n) => {
                cursor = (cursor + n).min(old.len());
            }
            ListDelta::Insert(items) => {
                for item in items {
                    match item {
                        EventValue::Value(v) => out.push(v.clone()),
                        EventValue::Container(id) => {
                            out.push(env.container_value(*id).unwrap_or_else(|| neutral(id.kind())));
                            ignore.insert(*id);
                        }
                    }
                }
            }
        }
    }
    out.extend_from_slice(old.get(cursor..).unwrap_or(&[]));
    *target = out.into();
    Ok(())
}

fn apply_text(target: &mut Value, delta: &[TextDelta]) -> Result<()> {
    let old = target
        .as_str()
        .ok_or_else(|| crate::Error::shape("text diff against a non-string value"))?;
    let chars: Vec<char> = old.chars().collect();
    let mut out = String::with_capacity(old.len());
    let mut cursor = 0usize;
    for item in delta {
        match item {
            TextDelta::Retain(n) => {
                let end = (cursor + n).min(chars.len());
                out.extend(&chars[cursor..end]);
                cursor = end;
            }
            TextDelta::Delete(n) => {
                cursor = (cursor + n).min(chars.len());
            }
            TextDelta::Insert(fragment) => out.push_str(fragment),
        }
    }
    out.extend(&chars[cursor..]);
    *target = Value::String(out);
    Ok(())
}

fn node_id_of(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Locates a node by id anywhere in the forest; the returned path is the
/// sequence of child indices from the root list down to the node.
fn locate(list: &[Value], id: &str, path: &mut Vec<usize>) -> bool {
    for (i, v) in list.iter().enumerate() {
        if node_id_of(v) == Some(id) {
            path.push(i);
            return true;
        }
        if let Some(children) = v.get("children").and_then(Value::as_list) {
            path.push(i);
            if locate(children, id, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

fn descend<'a>(root: &'a mut Vec<Value>, path: &[usize]) -> Option<&'a mut Value> {
    let (&first, rest) = path.split_first()?;
    let mut cur = root.get_mut(first)?;
    for &i in rest {
        cur = cur
            .make_map()?
            .get_mut("children")?
            .make_list()?
            .get_mut(i)?;
    }
    Some(cur)
}

/// Mutable access to the child list of `parent` (`None` means the forest
/// roots). `None` when the parent is not in the forest.
fn children_mut<'a>(
    root: &'a mut Vec<Value>,
    parent: Option<TreeNodeId>,
) -> Option<&'a mut Vec<Value>> {
    match parent {
        None => Some(root),
        Some(p) => {
            let mut path = Vec::new();
            if !locate(root, &p.to_string(), &mut path) {
                return None;
            }
            let node = descend(root, &path)?;
            let map = node.make_map()?;
            map.entry("children".to_owned())
                .or_insert_with(Value::list)
                .make_list()
        }
    }
}

/// Removes a node, trusting `old_index` when it points at the right id and
/// falling back to a by-id search inside the same child list.
fn remove_node(
    root: &mut Vec<Value>,
    target: TreeNodeId,
    old_parent: Option<TreeNodeId>,
    old_index: usize,
) -> Option<Value> {
    let id = target.to_string();
    let children = children_mut(root, old_parent)?;
    let ix = if children
        .get(old_index.min(children.len().saturating_sub(1)))
        .and_then(node_id_of)
        == Some(id.as_str())
    {
        old_index.min(children.len().saturating_sub(1))
    } else {
        children.iter().position(|n| node_id_of(n) == Some(id.as_str()))?
    };
    Some(children.remove(ix))
}

fn apply_tree<E: ApplyEnv>(
    target: &mut Value,
    ops: &[TreeOp],
    tree: ContainerId,
    env: &E,
) -> Result<()> {
    let root = target
        .make_list()
        .ok_or_else(|| crate::Error::shape("tree diff against a non-sequence value"))?;
    for op in ops {
        match op {
            TreeOp::Create { target: node, parent, index } => {
                let mut data = IndexMap::new();
                if env.tree_injects_cid(tree) {
                    if let Some(cid) = env.node_data_id(tree, *node) {
                        data.insert(CID_KEY.to_owned(), Value::String(cid.to_string()));
                    }
                }
                let mut value = IndexMap::new();
                value.insert("id".to_owned(), Value::String(node.to_string()));
                value.insert("data".to_owned(), data.into());
                value.insert("children".to_owned(), Value::list());
                let Some(children) = children_mut(root, *parent) else {
                    tracing::warn!("create {node} under unknown parent {parent:?}");
                    continue;
                };
                let ix = (*index).min(children.len());
                children.insert(ix, value.into());
            }
            TreeOp::Move { target: node, parent, index, old_parent, old_index } => {
                let Some(value) = remove_node(root, *node, *old_parent, *old_index) else {
                    tracing::warn!("move of unknown node {node}");
                    continue;
                };
                let mut ix = *index;
                // a forward move within one parent lands one slot left once
                // the node's own removal has shifted the suffix
                if parent == old_parent && *old_index < ix {
                    ix -= 1;
                }
                let Some(children) = children_mut(root, *parent) else {
                    tracing::warn!("move {node} under unknown parent {parent:?}");
                    continue;
                };
                let ix = ix.min(children.len());
                children.insert(ix, value);
            }
            TreeOp::Delete { target: node, old_parent, old_index } => {
                // already gone when the subtree's root was deleted first;
                // both delete orders converge to the same state
                remove_node(root, *node, *old_parent, *old_index);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) struct NoEnv;

#[cfg(test)]
impl ApplyEnv for NoEnv {
    fn container_value(&self, _id: ContainerId) -> Option<Value> {
        None
    }

    fn injects_cid(&self, _id: ContainerId) -> bool {
        false
    }

    fn tree_injects_cid(&self, _tree: ContainerId) -> bool {
        false
    }

    fn node_data_id(&self, _tree: ContainerId, _node: TreeNodeId) -> Option<ContainerId> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBy;
    use crate::path::PathBuf;
    use serde_json::json;

    fn batch(events: Vec<Event>) -> EventBatch {
        EventBatch { origin: None, by: EventBy::Local, events }
    }

    fn event(target: ContainerId, path: PathBuf, diff: Diff) -> Event {
        Event { target, path, diff }
    }

    fn cid(seq: u64, kind: ContainerKind) -> ContainerId {
        ContainerId::new(seq, kind)
    }

    #[test]
    fn text_delta_walks_with_source_cursor() {
        let state: Value = json!({"t": "Hello world"}).into();
        let diff = Diff::Text(vec![
            TextDelta::Retain(6),
            TextDelta::Delete(5),
            TextDelta::Insert("there".into()),
        ]);
        let ev = event(cid(0, ContainerKind::Text), ["t"].into_iter().collect(), diff);
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        assert_eq!(next.get("t").unwrap().as_str(), Some("Hello there"));
    }

    #[test]
    fn trailing_suffix_is_appended() {
        let state: Value = json!({"t": "abcdef"}).into();
        let diff = Diff::Text(vec![TextDelta::Retain(1), TextDelta::Delete(2)]);
        let ev = event(cid(0, ContainerKind::Text), ["t"].into_iter().collect(), diff);
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        assert_eq!(next.get("t").unwrap().as_str(), Some("adef"));
    }

    #[test]
    fn explicit_null_is_preserved_in_maps() {
        let state: Value = json!({"m": {}}).into();
        let mut updated = IndexMap::new();
        updated.insert("nested".to_owned(), Some(EventValue::Value(Value::Null)));
        let ev = event(
            cid(0, ContainerKind::Map),
            ["m"].into_iter().collect(),
            Diff::Map { updated },
        );
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        assert_eq!(next.get("m").unwrap().get("nested"), Some(&Value::Null));
    }

    #[test]
    fn missing_target_gets_a_baseline() {
        let state: Value = json!({}).into();
        let mut updated = IndexMap::new();
        updated.insert("k".to_owned(), Some(EventValue::Value(Value::Number(1.0))));
        let ev = event(
            cid(0, ContainerKind::Map),
            ["m"].into_iter().collect(),
            Diff::Map { updated },
        );
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        assert_eq!(
            serde_json::Value::from(&next),
            json!({"m": {"k": 1.0}})
        );
    }

    #[test]
    fn tree_create_move_delete() {
        let tree = cid(0, ContainerKind::Tree);
        let state: Value = json!({"tree": []}).into();
        let path: PathBuf = ["tree"].into_iter().collect();
        let (a, b) = (TreeNodeId(0), TreeNodeId(1));
        let events = vec![
            event(
                tree,
                path.clone(),
                Diff::Tree(vec![TreeOp::Create { target: a, parent: None, index: 0 }]),
            ),
            event(
                tree,
                path.clone(),
                Diff::Tree(vec![TreeOp::Create { target: b, parent: None, index: 1 }]),
            ),
            event(
                tree,
                path.clone(),
                Diff::Tree(vec![TreeOp::Move {
                    target: a,
                    parent: Some(b),
                    index: 0,
                    old_parent: None,
                    old_index: 0,
                }]),
            ),
        ];
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(events), &NoEnv, &mut ignore);
        assert_eq!(
            serde_json::Value::from(&next),
            json!({"tree": [
                {"id": "node:1", "data": {}, "children": [
                    {"id": "node:0", "data": {}, "children": []}
                ]}
            ]})
        );

        let del = event(
            tree,
            path,
            Diff::Tree(vec![TreeOp::Delete { target: b, old_parent: None, old_index: 0 }]),
        );
        let next = apply_batch(&next, &batch(vec![del]), &NoEnv, &mut ignore);
        assert_eq!(serde_json::Value::from(&next), json!({"tree": []}));
    }

    #[test]
    fn same_parent_forward_move_shifts_left() {
        let tree = cid(0, ContainerKind::Tree);
        let state: Value = json!({"tree": [
            {"id": "node:0", "data": {}, "children": []},
            {"id": "node:1", "data": {}, "children": []},
            {"id": "node:2", "data": {}, "children": []}
        ]})
        .into();
        // move node:0 to sit after node:1; event index speaks pre-removal
        let ev = event(
            tree,
            ["tree"].into_iter().collect(),
            Diff::Tree(vec![TreeOp::Move {
                target: TreeNodeId(0),
                parent: None,
                index: 2,
                old_parent: None,
                old_index: 0,
            }]),
        );
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        let ids: Vec<_> = next
            .get("tree")
            .unwrap()
            .as_list()
            .unwrap()
            .iter()
            .map(|n| n.get("id").unwrap().as_str().unwrap().to_owned())
            .collect();
        assert_eq!(ids, vec!["node:1", "node:0", "node:2"]);
    }

    #[test]
    fn wrong_delete_index_falls_back_to_id_lookup() {
        let tree = cid(0, ContainerKind::Tree);
        let state: Value = json!({"tree": [
            {"id": "node:0", "data": {}, "children": []},
            {"id": "node:1", "data": {}, "children": []}
        ]})
        .into();
        let ev = event(
            tree,
            ["tree"].into_iter().collect(),
            Diff::Tree(vec![TreeOp::Delete {
                target: TreeNodeId(0),
                old_parent: None,
                old_index: 1,
            }]),
        );
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        let ids: Vec<_> = next
            .get("tree")
            .unwrap()
            .as_list()
            .unwrap()
            .iter()
            .map(|n| n.get("id").unwrap().as_str().unwrap().to_owned())
            .collect();
        assert_eq!(ids, vec!["node:1"]);
    }

    #[test]
    fn ignored_targets_are_skipped() {
        let state: Value = json!({"m": {"k": 1.0}}).into();
        let target = cid(0, ContainerKind::Map);
        let mut updated = IndexMap::new();
        updated.insert("k".to_owned(), Some(EventValue::Value(Value::Number(2.0))));
        let ev = event(target, ["m"].into_iter().collect(), Diff::Map { updated });
        let mut ignore = FnvHashSet::default();
        ignore.insert(target);
        let next = apply_batch(&state, &batch(vec![ev]), &NoEnv, &mut ignore);
        assert_eq!(next.get("m").unwrap().get("k"), Some(&Value::Number(1.0)));
    }
}
