use crate::change::{ChangeOp, ChangeScript, NodeRef};
use crate::diff::{diff_container, longest_increasing_subsequence, DiffCtx};
use crate::id::{ContainerId, TreeNodeId};
use crate::path::PathBuf;
use crate::schema::Schema;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

struct OldNode<'a> {
    depth: usize,
    value: &'a Value,
}

fn index_old<'a>(
    forest: &'a [Value],
    parent: Option<TreeNodeId>,
    depth: usize,
    out: &mut HashMap<TreeNodeId, OldNode<'a>>,
    order: &mut HashMap<Option<TreeNodeId>, Vec<TreeNodeId>>,
) -> Result<()> {
    let mut siblings = Vec::with_capacity(forest.len());
    for node in forest {
        let map = node
            .as_map()
            .ok_or_else(|| Error::shape("tree node is not an object"))?;
        let id: TreeNodeId = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::shape("stored tree node lacks an id"))?
            .parse()?;
        siblings.push(id);
        out.insert(id, OldNode { depth, value: node });
        match map.get("children") {
            None => {}
            Some(Value::List(children)) => {
                index_old(children, Some(id), depth + 1, out, order)?;
            }
            Some(_) => return Err(Error::shape("tree node children is not a sequence")),
        }
    }
    order.insert(parent, siblings);
    Ok(())
}

struct NewNode<'a> {
    key: NodeRef,
    value: &'a Value,
    path: PathBuf,
    children: Vec<usize>, // indices into the flat new-node table
}

#[allow(clippy::too_many_arguments)]
fn index_new<'a>(
    script: &mut ChangeScript,
    forest: &'a [Value],
    path: &PathBuf,
    known: &HashMap<TreeNodeId, OldNode<'a>>,
    nodes: &mut Vec<NewNode<'a>>,
    kept: &mut HashSet<TreeNodeId>,
) -> Result<Vec<usize>> {
    let mut level = Vec::with_capacity(forest.len());
    for (i, node) in forest.iter().enumerate() {
        let map = node
            .as_map()
            .ok_or_else(|| Error::shape("tree node is not an object"))?;
        let id = map.get("id").and_then(Value::as_str).unwrap_or("");
        let key = match id.parse::<TreeNodeId>() {
            Ok(parsed) if known.contains_key(&parsed) => {
                if !kept.insert(parsed) {
                    return Err(Error::DuplicateIdentity { id: id.to_owned() });
                }
                NodeRef::Existing(parsed)
            }
            // empty or unknown ids mean the document allocates one
            _ => NodeRef::Pending(script.alloc_slot()),
        };
        let node_path = path.child(i);
        let children = match map.get("children") {
            None => Vec::new(),
            Some(Value::List(children)) => index_new(
                script,
                children,
                &node_path.child("children"),
                known,
                nodes,
                kept,
            )?,
            Some(_) => return Err(Error::shape("tree node children is not a sequence")),
        };
        nodes.push(NewNode { key, value: node, path: node_path, children });
        level.push(nodes.len() - 1);
    }
    Ok(level)
}

/// Shadow of the document's tree, updated as operations are emitted so
/// every move and create addresses the position the document will actually
/// see at that point of the script.
#[derive(Default)]
struct Sim {
    parent: HashMap<NodeRef, Option<NodeRef>>,
    children: HashMap<Option<NodeRef>, Vec<NodeRef>>,
}

impl Sim {
    fn siblings(&self, parent: Option<NodeRef>) -> &[NodeRef] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    fn position(&self, key: NodeRef) -> Option<(Option<NodeRef>, usize)> {
        let parent = *self.parent.get(&key)?;
        let ix = self.siblings(parent).iter().position(|k| *k == key)?;
        Some((parent, ix))
    }

    fn insert(&mut self, parent: Option<NodeRef>, index: usize, key: NodeRef) {
        let siblings = self.children.entry(parent).or_default();
        let index = index.min(siblings.len());
        siblings.insert(index, key);
        self.parent.insert(key, parent);
    }

    fn remove(&mut self, key: NodeRef) -> Option<usize> {
        let (parent, ix) = self.position(key)?;
        self.children.get_mut(&parent).map(|s| s.remove(ix));
        self.parent.remove(&key);
        Some(ix)
    }
}

/// Structural diff of two forests of `{id, data, children}` nodes.
///
/// Deletes are emitted bottom-up, creates parent-before-child with deferred
/// id slots, and per-parent reorders move only the elements off the longest
/// increasing subsequence of surviving siblings. Data maps of surviving
/// nodes are diffed recursively at the end.
pub(crate) fn diff_tree(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    old: &Value,
    new: &Value,
    schema: Option<&Schema>,
    state_path: &PathBuf,
) -> Result<()> {
    let node_schema = schema.and_then(Schema::tree_node);
    let empty = Vec::new();
    let old_forest = old.as_list().unwrap_or(&empty);
    let new_forest = new
        .as_list()
        .ok_or_else(|| Error::shape(format!("expected a node sequence at {state_path}")))?;

    let mut old_nodes = HashMap::new();
    let mut old_order = HashMap::new();
    index_old(old_forest, None, 0, &mut old_nodes, &mut old_order)?;

    let mut new_nodes = Vec::new();
    let mut kept = HashSet::new();
    let roots = index_new(script, new_forest, state_path, &old_nodes, &mut new_nodes, &mut kept)?;

    let mut gone: Vec<(usize, TreeNodeId)> = old_nodes
        .iter()
        .filter(|(id, _)| !kept.contains(id))
        .map(|(id, info)| (info.depth, *id))
        .collect();
    gone.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut sim = Sim::default();
    for (parent, siblings) in &old_order {
        let parent = parent.map(NodeRef::Existing);
        for (i, id) in siblings.iter().enumerate() {
            sim.insert(parent, i, NodeRef::Existing(*id));
        }
    }

    reconcile_level(ctx, script, cid, None, &roots, &new_nodes, node_schema, &mut sim)?;

    // deletes run after the structural pass, deepest first: a surviving
    // node that escaped a vanishing subtree has already moved out, and
    // every delete target still exists when its op runs
    for (_, id) in &gone {
        script.push(ChangeOp::TreeDelete { tree: cid, target: *id });
        sim.remove(NodeRef::Existing(*id));
    }

    // data maps of surviving nodes
    for info in &new_nodes {
        let NodeRef::Existing(id) = info.key else {
            continue;
        };
        let old_data = old_nodes
            .get(&id)
            .and_then(|n| n.value.get("data"))
            .cloned()
            .unwrap_or_else(Value::map);
        let new_data = info.value.get("data").cloned().unwrap_or_else(Value::map);
        if old_data == new_data {
            continue;
        }
        let data_cid = ctx.doc.node_data_id(cid, id)?;
        diff_container(
            ctx,
            script,
            data_cid,
            &old_data,
            &new_data,
            node_schema,
            &info.path.child("data"),
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn reconcile_level(
    ctx: &DiffCtx,
    script: &mut ChangeScript,
    cid: ContainerId,
    parent: Option<NodeRef>,
    desired: &[usize],
    nodes: &[NewNode],
    node_schema: Option<&Schema>,
    sim: &mut Sim,
) -> Result<()> {
    // surviving children of this very parent keep their relative order
    // unless they left the longest increasing subsequence
    let staying: Vec<(usize, NodeRef)> = desired
        .iter()
        .filter_map(|&ix| {
            let key = nodes[ix].key;
            match sim.position(key) {
                Some((p, pos)) if p == parent => Some((pos, key)),
                _ => None,
            }
        })
        .collect();
    let positions: Vec<usize> = staying.iter().map(|(pos, _)| *pos).collect();
    let lis = longest_increasing_subsequence(&positions);
    let settled: HashSet<NodeRef> = lis.iter().map(|&k| staying[k].1).collect();

    // right to left: each element lands directly before its successor
    for (i, &ix) in desired.iter().enumerate().rev() {
        let info = &nodes[ix];
        let anchor = |sim: &Sim| -> usize {
            desired
                .get(i + 1)
                .and_then(|&next| sim.position(nodes[next].key))
                .map(|(_, pos)| pos)
                .unwrap_or_else(|| sim.siblings(parent).len())
        };
        match info.key {
            NodeRef::Pending(slot) => {
                let index = anchor(sim);
                script.push(ChangeOp::TreeCreate {
                    tree: cid,
                    slot,
                    parent,
                    index,
                    node: info.value.clone(),
                    schema: node_schema.cloned(),
                    state_path: info.path.clone(),
                });
                sim.insert(parent, index, info.key);
            }
            NodeRef::Existing(_) => {
                if settled.contains(&info.key) {
                    continue;
                }
                let came_from = sim.position(info.key);
                match came_from {
                    Some((p, pos)) if p == parent => {
                        sim.remove(info.key);
                        let index = anchor(sim);
                        if index == pos {
                            sim.insert(parent, pos, info.key);
                            continue;
                        }
                        script.push(ChangeOp::TreeMove {
                            tree: cid,
                            target: info.key,
                            parent,
                            index,
                        });
                        sim.insert(parent, index, info.key);
                    }
                    _ => {
                        sim.remove(info.key);
                        let index = anchor(sim);
                        script.push(ChangeOp::TreeMove {
                            tree: cid,
                            target: info.key,
                            parent,
                            index,
                        });
                        sim.insert(parent, index, info.key);
                    }
                }
            }
        }
    }

    for &ix in desired {
        let key = nodes[ix].key;
        let children = nodes[ix].children.clone();
        reconcile_level(ctx, script, cid, Some(key), &children, nodes, node_schema, sim)?;
    }
    Ok(())
}
