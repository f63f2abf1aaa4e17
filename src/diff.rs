use crate::change::{ChangeOp, ChangeScript};
use crate::doc::Document;
use crate::id::{ContainerId, ContainerKind};
use crate::path::PathBuf;
use crate::registry::Registry;
use crate::schema::{Schema, Selector};
use crate::tree;
use crate::value::{Value, CID_KEY};
use crate::{Error, Result};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// How unknown fields are materialized when no schema covers them.
#[derive(Clone, Copy, Debug, Default)]
pub struct InferOptions {
    /// Materialize unknown string fields as text containers.
    pub default_text: bool,
    /// Materialize unknown array fields as movable lists instead of lists.
    pub default_movable_list: bool,
}

pub(crate) struct DiffCtx<'a> {
    pub doc: &'a Document,
    pub registry: &'a Registry,
    pub infer: InferOptions,
}

/// Decides whether a proposed value becomes a container, and of which kind.
/// The schema wins; without one the inference rules apply.
pub(crate) fn container_kind_of(
    value: &Value,
    schema: Option<&Schema>,
    infer: InferOptions,
) -> Option<ContainerKind> {
    if let Some(schema) = schema {
        let kind = schema.container_kind()?;
        // a shape mismatch falls back to plain-value treatment; validation
        // reports it separately
        return match (kind, value) {
            (ContainerKind::Map, Value::Map(_))
            | (ContainerKind::List, Value::List(_))
            | (ContainerKind::MovableList, Value::List(_))
            | (ContainerKind::Tree, Value::List(_))
            | (ContainerKind::Text, Value::String(_))
            | (ContainerKind::Counter, Value::Number(_)) => Some(kind),
            _ => None,
        };
    }
    match value {
        Value::Map(_) => Some(ContainerKind::Map),
        Value::List(_) => Some(if infer.default_movable_list {
            ContainerKind::MovableList
        } else {
            ContainerKind::List
        }),
        Value::String(_) if infer.default_text => Some(ContainerKind::Text),
        _ => None,
    }
}

/// Compares the old and new mirrored value of one container and appends the
/// operations that turn the stored content into the new one.
pub(crate) fn diff_container(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    old: &Value,
    new: &Value,
    schema: Option<&Schema>,
    state_path: &PathBuf,
) -> Result<()> {
    let registered;
    let schema = match schema {
        Some(s) => Some(s),
        None => {
            registered = ctx.registry.schema_of(cid).cloned();
            registered.as_ref()
        }
    };
    match cid.kind() {
        ContainerKind::Map => {
            let empty = IndexMap::new();
            let old = old.as_map().unwrap_or(&empty);
            let new = new
                .as_map()
                .ok_or_else(|| Error::shape(format!("expected an object at {state_path}")))?;
            diff_map(ctx, script, cid, old, new, schema, state_path)
        }
        ContainerKind::List => {
            let empty = Vec::new();
            let old = old.as_list().unwrap_or(&empty);
            let new = new
                .as_list()
                .ok_or_else(|| Error::shape(format!("expected a sequence at {state_path}")))?;
            match schema.and_then(Schema::selector) {
                Some(selector) => {
                    diff_list_by_id(ctx, script, cid, old, new, schema, selector, state_path)
                }
                None => diff_list_by_index(ctx, script, cid, old, new, schema, state_path),
            }
        }
        ContainerKind::MovableList => {
            let empty = Vec::new();
            let old = old.as_list().unwrap_or(&empty);
            let new = new
                .as_list()
                .ok_or_else(|| Error::shape(format!("expected a sequence at {state_path}")))?;
            diff_movable_list(ctx, script, cid, old, new, schema, state_path)
        }
        ContainerKind::Text => {
            let old = old.as_str().unwrap_or("");
            let new = new
                .as_str()
                .ok_or_else(|| Error::shape(format!("expected a string at {state_path}")))?;
            if old != new {
                script.push(ChangeOp::TextUpdate { container: cid, text: new.to_owned() });
            }
            Ok(())
        }
        ContainerKind::Counter => {
            let old = old.as_number().unwrap_or(0.0);
            let new = new
                .as_number()
                .ok_or_else(|| Error::shape(format!("expected a number at {state_path}")))?;
            let delta = new - old;
            if delta != 0.0 {
                script.push(ChangeOp::CounterIncrement { container: cid, delta });
            }
            Ok(())
        }
        ContainerKind::Tree => tree::diff_tree(ctx, script, cid, old, new, schema, state_path),
    }
}

fn push_map_insert(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    key: &str,
    value: &Value,
    schema: Option<&Schema>,
    state_path: &PathBuf,
) {
    match container_kind_of(value, schema, ctx.infer) {
        Some(kind) => script.push(ChangeOp::MapInsertContainer {
            container: cid,
            key: key.to_owned(),
            kind,
            value: value.clone(),
            schema: schema.cloned(),
            state_path: state_path.child(key),
        }),
        None => script.push(ChangeOp::MapInsert {
            container: cid,
            key: key.to_owned(),
            value: value.clone(),
        }),
    }
}

fn diff_map(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    old: &IndexMap<String, Value>,
    new: &IndexMap<String, Value>,
    schema: Option<&Schema>,
    state_path: &PathBuf,
) -> Result<()> {
    for key in old.keys() {
        if key == CID_KEY || new.contains_key(key) {
            continue;
        }
        script.push(ChangeOp::MapDelete { container: cid, key: key.clone() });
    }
    for (key, new_value) in new {
        if key == CID_KEY {
            continue;
        }
        let child_schema = schema.and_then(|s| s.child_by_key(key));
        let Some(old_value) = old.get(key) else {
            push_map_insert(ctx, script, cid, key, new_value, child_schema, state_path);
            continue;
        };
        if old_value == new_value {
            continue;
        }
        let old_kind = container_kind_of(old_value, child_schema, ctx.infer);
        let new_kind = container_kind_of(new_value, child_schema, ctx.infer);
        let stored = ctx.doc.map_child(cid, key);
        match (old_kind, new_kind, stored) {
            (Some(ok), Some(nk), Some(child)) if ok == nk && child.kind() == nk => {
                diff_container(
                    ctx, script, child, old_value, new_value, child_schema,
                    &state_path.child(key.as_str()),
                )?;
            }
            (None, None, _) => {
                // set-or-insert for plain values
                script.push(ChangeOp::MapInsert {
                    container: cid,
                    key: key.clone(),
                    value: new_value.clone(),
                });
            }
            _ => {
                script.push(ChangeOp::MapDelete { container: cid, key: key.clone() });
                push_map_insert(ctx, script, cid, key, new_value, child_schema, state_path);
            }
        }
    }
    Ok(())
}

fn push_list_insert(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    index: usize,
    value: &Value,
    schema: Option<&Schema>,
    state_path: &PathBuf,
    state_index: usize,
) {
    match container_kind_of(value, schema, ctx.infer) {
        Some(kind) => script.push(ChangeOp::ListInsertContainer {
            container: cid,
            index,
            kind,
            value: value.clone(),
            schema: schema.cloned(),
            state_path: state_path.child(state_index),
        }),
        None => script.push(ChangeOp::ListInsert {
            container: cid,
            index,
            value: value.clone(),
        }),
    }
}

fn diff_list_by_index(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    old: &[Value],
    new: &[Value],
    schema: Option<&Schema>,
    state_path: &PathBuf,
) -> Result<()> {
    let item_schema = schema.and_then(Schema::child_item);
    if old.len() > new.len() {
        // tail excess, dropped once from the new length
        for _ in new.len()..old.len() {
            script.push(ChangeOp::ListDelete { container: cid, index: new.len() });
        }
    }
    for (i, new_value) in new.iter().enumerate() {
        let Some(old_value) = old.get(i) else {
            push_list_insert(ctx, script, cid, i, new_value, item_schema, state_path, i);
            continue;
        };
        if old_value == new_value {
            continue;
        }
        let old_kind = container_kind_of(old_value, item_schema, ctx.infer);
        let new_kind = container_kind_of(new_value, item_schema, ctx.infer);
        let stored = ctx.doc.list_child(cid, i);
        match (old_kind, new_kind, stored) {
            (Some(ok), Some(nk), Some(child)) if ok == nk && child.kind() == nk => {
                diff_container(
                    ctx, script, child, old_value, new_value, item_schema, &state_path.child(i),
                )?;
            }
            _ => {
                script.push(ChangeOp::ListDelete { container: cid, index: i });
                push_list_insert(ctx, script, cid, i, new_value, item_schema, state_path, i);
            }
        }
    }
    Ok(())
}

fn select_ids(items: &[Value], selector: &Selector) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| match selector.select(item) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(Error::shape("identity selector produced no id for an element")),
        })
        .collect()
}

fn reject_duplicates(ids: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(Error::DuplicateIdentity { id: id.clone() });
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn diff_list_by_id(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    old: &[Value],
    new: &[Value],
    schema: Option<&Schema>,
    selector: &Selector,
    state_path: &PathBuf,
) -> Result<()> {
    let item_schema = schema.and_then(Schema::child_item);
    let old_ids = select_ids(old, selector)?;
    let new_ids = select_ids(new, selector)?;
    reject_duplicates(&new_ids)?;
    let old_set: HashSet<&str> = old_ids.iter().map(String::as_str).collect();

    let mut i = 0usize; // cursor over the stored list
    let mut offset = 0isize;
    let mut j = 0usize; // cursor over the proposed list
    let at = |i: usize, offset: isize| (i as isize + offset) as usize;
    while j < new.len() {
        let new_id = new_ids[j].as_str();
        if i >= old.len() {
            // trailing proposed items append
            push_list_insert(ctx, script, cid, at(i, offset), &new[j], item_schema, state_path, j);
            offset += 1;
            j += 1;
            continue;
        }
        if old_ids[i] == new_id {
            if old[i] != new[j] {
                let old_kind = container_kind_of(&old[i], item_schema, ctx.infer);
                let new_kind = container_kind_of(&new[j], item_schema, ctx.infer);
                let stored = ctx.doc.list_child(cid, i);
                match (old_kind, new_kind, stored) {
                    (Some(ok), Some(nk), Some(child)) if ok == nk && child.kind() == nk => {
                        diff_container(
                            ctx, script, child, &old[i], &new[j], item_schema,
                            &state_path.child(j),
                        )?;
                    }
                    _ => {
                        script.push(ChangeOp::ListDelete { container: cid, index: at(i, offset) });
                        push_list_insert(
                            ctx, script, cid, at(i, offset), &new[j], item_schema, state_path, j,
                        );
                    }
                }
            }
            i += 1;
            j += 1;
        } else if !old_set.contains(new_id) {
            push_list_insert(ctx, script, cid, at(i, offset), &new[j], item_schema, state_path, j);
            offset += 1;
            j += 1;
        } else {
            script.push(ChangeOp::ListDelete { container: cid, index: at(i, offset) });
            i += 1;
            offset -= 1;
        }
    }
    while i < old.len() {
        script.push(ChangeOp::ListDelete { container: cid, index: at(i, offset) });
        i += 1;
        offset -= 1;
    }
    Ok(())
}

/// Identity strings for movable-list elements: the selector when provided,
/// otherwise the element's own rendering with duplicate occurrences
/// disambiguated by ordinal so equal plain values reconcile positionally.
fn movable_ids(items: &[Value], selector: Option<&Selector>) -> Result<Vec<String>> {
    match selector {
        Some(selector) => {
            let ids = select_ids(items, selector)?;
            reject_duplicates(&ids)?;
            Ok(ids)
        }
        None => {
            let mut counts: HashMap<String, usize> = HashMap::new();
            items
                .iter()
                .map(|item| {
                    if item.as_map().is_some() {
                        return Err(Error::shape(
                            "movable list of objects requires an identity selector",
                        ));
                    }
                    let base = item.to_string();
                    let n = counts.entry(base.clone()).or_insert(0);
                    let id = if *n == 0 { base } else { format!("{base}#{n}") };
                    *n += 1;
                    Ok(id)
                })
                .collect()
        }
    }
}

fn diff_movable_list(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    old: &[Value],
    new: &[Value],
    schema: Option<&Schema>,
    state_path: &PathBuf,
) -> Result<()> {
    let item_schema = schema.and_then(Schema::child_item);
    let selector = schema.and_then(Schema::selector);
    let old_ids = movable_ids(old, selector)?;
    let new_ids = movable_ids(new, selector)?;
    let old_index: HashMap<&str, usize> =
        old_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let new_set: HashSet<&str> = new_ids.iter().map(String::as_str).collect();

    // partition: kept ids with their old index, in proposed order
    let kept: Vec<(usize, &str)> = new_ids
        .iter()
        .filter_map(|id| old_index.get(id.as_str()).map(|&ix| (ix, id.as_str())))
        .collect();
    let removed: Vec<usize> = old_ids
        .iter()
        .enumerate()
        .filter(|(_, id)| !new_set.contains(id.as_str()))
        .map(|(i, _)| i)
        .collect();

    // the LIS over old indices, in proposed order, marks what stays put
    let old_positions: Vec<usize> = kept.iter().map(|(ix, _)| *ix).collect();
    let lis = longest_increasing_subsequence(&old_positions);
    let moved: HashSet<&str> = kept
        .iter()
        .enumerate()
        .filter(|(k, _)| !lis.contains(k))
        .map(|(_, (_, id))| *id)
        .collect();

    // deletes scan from the highest old index down
    for &ix in removed.iter().rev() {
        script.push(ChangeOp::ListDelete { container: cid, index: ix });
    }

    // simulate the stored list (kept elements only) to derive move indices
    // against the document's positions after the prior ops; elements are
    // placed right to left, each directly before its successor, so elements
    // on the LIS never move
    let mut sim: Vec<&str> = old_ids
        .iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(_, id)| id.as_str())
        .collect();
    let position = |sim: &[&str], id: &str| -> Result<usize> {
        sim.iter()
            .position(|s| *s == id)
            .ok_or_else(|| Error::internal(format!("lost track of element {id:?}")))
    };
    for p in (0..kept.len()).rev() {
        let id = kept[p].1;
        if !moved.contains(id) {
            continue;
        }
        let from = position(&sim, id)?;
        let to = match kept.get(p + 1) {
            Some((_, next)) => {
                let anchor = position(&sim, next)?;
                if from < anchor {
                    anchor - 1
                } else {
                    anchor
                }
            }
            None => sim.len() - 1,
        };
        if from == to {
            continue;
        }
        sim.remove(from);
        sim.insert(to, id);
        script.push(ChangeOp::ListMove { container: cid, from, to });
    }

    // inserts land at their final indices, in increasing order
    for (j, id) in new_ids.iter().enumerate() {
        if !old_index.contains_key(id.as_str()) {
            push_list_insert(ctx, script, cid, j, &new[j], item_schema, state_path, j);
        }
    }

    // content updates for kept elements, addressed at final positions
    for (j, id) in new_ids.iter().enumerate() {
        let Some(&old_ix) = old_index.get(id.as_str()) else {
            continue;
        };
        if old[old_ix] == new[j] {
            continue;
        }
        let old_kind = container_kind_of(&old[old_ix], item_schema, ctx.infer);
        let new_kind = container_kind_of(&new[j], item_schema, ctx.infer);
        let stored = ctx.doc.list_child(cid, old_ix);
        match (old_kind, new_kind, stored) {
            (Some(ok), Some(nk), Some(child)) if ok == nk && child.kind() == nk => {
                diff_container(
                    ctx, script, child, &old[old_ix], &new[j], item_schema, &state_path.child(j),
                )?;
            }
            (None, None, _) => {
                script.push(ChangeOp::ListSet { container: cid, index: j, value: new[j].clone() });
            }
            _ => match container_kind_of(&new[j], item_schema, ctx.infer) {
                Some(kind) => script.push(ChangeOp::ListSetContainer {
                    container: cid,
                    index: j,
                    kind,
                    value: new[j].clone(),
                    schema: item_schema.cloned(),
                    state_path: state_path.child(j),
                }),
                None => script.push(ChangeOp::ListSet {
                    container: cid,
                    index: j,
                    value: new[j].clone(),
                }),
            },
        }
    }
    Ok(())
}

/// Indices (into `seq`) of one longest strictly increasing subsequence,
/// O(n log n).
pub(crate) fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    if seq.is_empty() {
        return Vec::new();
    }
    let mut tails: Vec<usize> = Vec::new(); // indices of subsequence tails
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for i in 0..seq.len() {
        let pos = tails.partition_point(|&t| seq[t] < seq[i]);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cur = tails.last().copied();
    while let Some(i) = cur {
        out.push(i);
        cur = prev[i];
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lis_basics() {
        assert!(longest_increasing_subsequence(&[]).is_empty());
        assert_eq!(longest_increasing_subsequence(&[5]), vec![0]);
        // one LIS of [1,0,2,3] is 1,2,3 (or 0,2,3); length 3 either way
        let lis = longest_increasing_subsequence(&[1, 0, 2, 3]);
        assert_eq!(lis.len(), 3);
        let values: Vec<usize> = lis.iter().map(|&i| [1, 0, 2, 3][i]).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn lis_of_reversed_sequence_is_single() {
        assert_eq!(longest_increasing_subsequence(&[3, 2, 1, 0]).len(), 1);
    }

    #[test]
    fn rotation_leaves_all_but_one_in_place() {
        // [0,1,2,3] rotated to [1,0,2,3]: exactly one element moves
        let lis = longest_increasing_subsequence(&[1, 0, 2, 3]);
        assert_eq!(lis.len(), 3);
    }

    #[test]
    fn movable_ids_disambiguate_duplicates() {
        let items: Vec<Value> = vec![1.0.into(), 1.0.into(), 2.0.into()];
        let ids = movable_ids(&items, None).unwrap();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn movable_objects_without_selector_are_rejected() {
        let items: Vec<Value> = vec![Value::map()];
        assert!(movable_ids(&items, None).is_err());
    }
}
