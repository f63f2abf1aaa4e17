use crate::applier::{apply_batch, NoEnv};
use crate::change::{ChangeOp, ChangeScript};
use crate::diff::{diff_container, DiffCtx, InferOptions};
use crate::event::{Diff, Event, EventBatch, EventBy, TreeOp};
use crate::id::TreeNodeId;
use crate::mirror::{Mirror, MirrorOptions};
use crate::registry::Registry;
use crate::schema::{Schema, Selector};
use crate::value::Value;
use crate::Document;
use fnv::FnvHashSet;
use indexmap::IndexMap;
use proptest::prelude::*;
use tracing_subscriber::EnvFilter;

fn test_doc() -> Document {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "warn".to_owned());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    Document::new()
}

fn root_schema() -> Schema {
    Schema::map([
        (
            "todos",
            Schema::map([]).catchall(Schema::map([
                ("id", Schema::string()),
                ("text", Schema::string()),
                ("completed", Schema::boolean()),
            ])),
        ),
        ("tags", Schema::list(Schema::string())),
        ("title", Schema::text()),
        ("count", Schema::counter()),
    ])
}

fn arb_word() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

fn arb_state() -> impl Strategy<Value = Value> {
    (
        prop::collection::btree_map("[0-9]{1,2}", (arb_word(), any::<bool>()), 0..6),
        prop::collection::vec(arb_word(), 0..5),
        arb_word(),
        -100i32..100,
    )
        .prop_map(|(todos, tags, title, count)| {
            let todos: IndexMap<String, Value> = todos
                .into_iter()
                .map(|(id, (text, completed))| {
                    let mut todo = IndexMap::new();
                    todo.insert("id".to_owned(), Value::String(id.clone()));
                    todo.insert("text".to_owned(), Value::String(text));
                    todo.insert("completed".to_owned(), Value::Bool(completed));
                    (id, Value::from(todo))
                })
                .collect();
            let mut root = IndexMap::new();
            root.insert("todos".to_owned(), todos.into());
            root.insert(
                "tags".to_owned(),
                Value::from(tags.into_iter().map(Value::String).collect::<Vec<_>>()),
            );
            root.insert("title".to_owned(), Value::String(title));
            root.insert("count".to_owned(), Value::Number(count as f64));
            root.into()
        })
}

fn strict() -> MirrorOptions {
    MirrorOptions { check_state_consistency: true, ..Default::default() }
}

proptest! {
    // accepted states survive an outbound cycle unchanged (modulo $cid),
    // and the document's normalized view agrees (consistency check on)
    #[test]
    fn outbound_round_trip(state in arb_state()) {
        let doc = test_doc();
        let mirror = Mirror::new(doc, root_schema(), strict()).unwrap();
        mirror.replace_state(state.clone()).unwrap();
        prop_assert_eq!(mirror.state().without_cid(), state.without_cid());
    }

    // proposing the current state is free: no commit, no state change
    #[test]
    fn idempotent_updates_produce_no_commit(state in arb_state()) {
        let doc = test_doc();
        let mirror = Mirror::new(doc.clone(), root_schema(), strict()).unwrap();
        mirror.replace_state(state).unwrap();
        let commits = doc.commit_count();
        let before = mirror.state();
        mirror.replace_state(before.clone()).unwrap();
        prop_assert_eq!(doc.commit_count(), commits);
        prop_assert_eq!(mirror.state(), before);
    }

    // any permutation of a movable list keeps every element's container
    #[test]
    fn permutation_preserves_identity(
        order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let schema = Schema::map([(
            "items",
            Schema::movable_list(
                Schema::map([("id", Schema::string())]),
                Selector::field("id"),
            ),
        )]);
        let doc = test_doc();
        let mirror = Mirror::new(doc.clone(), schema, strict()).unwrap();
        let item = |i: usize| -> Value {
            let mut m = IndexMap::new();
            m.insert("id".to_owned(), Value::String(format!("item-{i}")));
            m.into()
        };
        mirror
            .set_state(|s| {
                let items: Vec<Value> = (0..6).map(item).collect();
                s.make_map().unwrap().insert("items".into(), items.into());
            })
            .unwrap();
        let root = doc.root_id("items").unwrap();
        let before: Vec<_> = (0..6).map(|i| doc.list_child(root, i).unwrap()).collect();

        mirror
            .set_state(|s| {
                let items: Vec<Value> = order.iter().map(|&i| item(i)).collect();
                s.make_map().unwrap().insert("items".into(), items.into());
            })
            .unwrap();
        for (pos, &i) in order.iter().enumerate() {
            prop_assert_eq!(doc.list_child(root, pos).unwrap(), before[i]);
        }
    }

    // subtree deletes converge to the same state whether the batch lists
    // nodes bottom-up or top-down
    #[test]
    fn delete_order_converges(top_down in any::<bool>()) {
        let tree = crate::ContainerId::new(0, crate::ContainerKind::Tree);
        let state: Value = serde_json::json!({"tree": [
            {"id": "node:0", "data": {}, "children": [
                {"id": "node:1", "data": {}, "children": [
                    {"id": "node:2", "data": {}, "children": []}
                ]}
            ]}
        ]})
        .into();
        let mut ops = vec![
            TreeOp::Delete { target: TreeNodeId(0), old_parent: None, old_index: 0 },
            TreeOp::Delete { target: TreeNodeId(1), old_parent: Some(TreeNodeId(0)), old_index: 0 },
            TreeOp::Delete { target: TreeNodeId(2), old_parent: Some(TreeNodeId(1)), old_index: 0 },
        ];
        if !top_down {
            ops.reverse();
        }
        let events: Vec<Event> = ops
            .into_iter()
            .map(|op| Event {
                target: tree,
                path: ["tree"].into_iter().collect(),
                diff: Diff::Tree(vec![op]),
            })
            .collect();
        let batch = EventBatch { origin: None, by: EventBy::Local, events };
        let mut ignore = FnvHashSet::default();
        let next = apply_batch(&state, &batch, &NoEnv, &mut ignore);
        prop_assert_eq!(
            serde_json::Value::from(&next),
            serde_json::json!({"tree": []})
        );
        // applying the same batch again is harmless and deterministic
        let again = apply_batch(&next, &batch, &NoEnv, &mut ignore);
        prop_assert_eq!(next, again);
    }

    // rotating one element of a movable list plans exactly one move
    #[test]
    fn rotation_is_a_single_move(from in 0..6usize, to in 0..6usize) {
        prop_assume!(from != to);
        let doc = test_doc();
        let items = doc.get_movable_list("items").unwrap();
        for i in 0..6 {
            items.push(i as f64).unwrap();
        }
        doc.commit();

        let schema = Schema::movable_list_plain(Schema::number());
        let mut registry = Registry::new();
        registry.register(&doc, items.id(), Some(schema.clone()));

        let old: Vec<Value> = (0..6).map(|i| Value::Number(i as f64)).collect();
        let mut rotated = old.clone();
        let moved = rotated.remove(from);
        rotated.insert(to, moved);

        let ctx = DiffCtx { doc: &doc, registry: &registry, infer: InferOptions::default() };
        let mut script = ChangeScript::new();
        diff_container(
            &ctx,
            &mut script,
            items.id(),
            &Value::from(old),
            &Value::from(rotated),
            Some(&schema),
            &["items"].into_iter().collect(),
        )
        .unwrap();
        let moves = script
            .ops()
            .iter()
            .filter(|op| matches!(op, ChangeOp::ListMove { .. }))
            .count();
        prop_assert_eq!(moves, 1, "script: {:?}", script.ops());
        prop_assert_eq!(script.len(), 1);
    }
}
