use anyhow::Result;
use crdt_mirror::{
    ContainerKind, Diff, Document, Mirror, MirrorOptions, Schema, Selector, Store, TreeOp,
    Value,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn new_doc() -> Document {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "warn".to_owned());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    Document::new()
}

fn v(j: serde_json::Value) -> Value {
    j.into()
}

fn j(v: &Value) -> serde_json::Value {
    v.into()
}

fn strict() -> MirrorOptions {
    MirrorOptions { check_state_consistency: true, ..Default::default() }
}

fn todo_schema() -> Schema {
    Schema::map([(
        "todos",
        Schema::map([]).catchall(Schema::map([
            ("id", Schema::string()),
            ("text", Schema::string()),
            ("completed", Schema::boolean()),
        ])),
    )])
}

#[test]
fn map_basic_inbound() -> Result<()> {
    let doc = new_doc();
    let store = Store::new(doc.clone(), todo_schema())?;

    let todos = doc.get_map("todos")?;
    let one = doc.map(todos.insert_container("1", ContainerKind::Map)?)?;
    one.insert("id", "1")?;
    one.insert("text", "Buy milk")?;
    one.insert("completed", false)?;
    doc.commit();

    assert_eq!(
        j(&store.get_state()),
        json!({"todos": {"1": {"id": "1", "text": "Buy milk", "completed": false}}})
    );
    Ok(())
}

#[test]
fn list_by_id_shuffle_preserves_cids() -> Result<()> {
    let schema = Schema::map([(
        "items",
        Schema::list_with_id(
            Schema::map([("id", Schema::string().required())]),
            Selector::field("id"),
        ),
    )]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;
    let items = |ids: &[&str]| -> Value {
        v(json!(ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>()))
    };
    let set = |value: Value| {
        store.set_state(move |s| {
            s.make_map().unwrap().insert("items".into(), value);
        })
    };

    set(items(&["1"]))?;
    let root = doc.root_id("items").unwrap();
    let cid_of_one = |state: &Value| {
        let list = state.get("items").unwrap().as_list().unwrap().clone();
        let ix = list
            .iter()
            .position(|item| item.get("id").and_then(Value::as_str) == Some("1"))
            .unwrap();
        doc.list_child(root, ix).unwrap()
    };
    let original = cid_of_one(&store.get_state());

    set(items(&["0", "1", "2", "123"]))?;
    assert_eq!(cid_of_one(&store.get_state()), original);

    set(items(&["1", "0", "123", "2"]))?;
    assert_eq!(cid_of_one(&store.get_state()), original);

    set(items(&["1"]))?;
    assert_eq!(cid_of_one(&store.get_state()), original);
    assert_eq!(
        j(&store.get_state()),
        json!({"items": [{"id": "1"}]})
    );
    Ok(())
}

#[test]
fn movable_list_rotation_is_one_move_and_one_commit() -> Result<()> {
    let schema = Schema::map([(
        "items",
        Schema::movable_list(
            Schema::map([("id", Schema::string())]),
            Selector::field("id"),
        ),
    )]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;
    store.set_state(|s| {
        s.make_map().unwrap().insert(
            "items".into(),
            v(json!([{"id": "0"}, {"id": "1"}, {"id": "2"}, {"id": "3"}])),
        );
    })?;
    let root = doc.root_id("items").unwrap();
    let before: Vec<_> = (0..4).map(|i| doc.list_child(root, i).unwrap()).collect();
    let commits = doc.commit_count();

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let _sub = doc.subscribe(move |batch| sink.lock().push(batch.clone()));

    store.set_state(|s| {
        s.make_map().unwrap().insert(
            "items".into(),
            v(json!([{"id": "1"}, {"id": "0"}, {"id": "2"}, {"id": "3"}])),
        );
    })?;

    assert_eq!(doc.commit_count(), commits + 1);
    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    // one move surfaces as one delete run and one insert run on the list
    assert_eq!(batches[0].events.len(), 2);
    assert!(batches[0].events.iter().all(|e| matches!(e.diff, Diff::List(_))));

    // identity preserved: 0 and 1 swapped, 2 and 3 untouched
    assert_eq!(doc.list_child(root, 0).unwrap(), before[1]);
    assert_eq!(doc.list_child(root, 1).unwrap(), before[0]);
    assert_eq!(doc.list_child(root, 2).unwrap(), before[2]);
    assert_eq!(doc.list_child(root, 3).unwrap(), before[3]);
    Ok(())
}

#[test]
fn text_delta_inbound() -> Result<()> {
    let schema = Schema::map([("t", Schema::text())]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;
    store.set_state(|s| {
        s.make_map().unwrap().insert("t".into(), "Hello world".into());
    })?;

    let text = doc.get_text("t")?;
    text.delete(6, 5)?;
    text.insert(6, "there")?;
    doc.commit();

    assert_eq!(store.get_state().get("t").unwrap().as_str(), Some("Hello there"));
    Ok(())
}

#[test]
fn tree_create_then_move() -> Result<()> {
    let schema = Schema::map([("tree", Schema::tree(Schema::map([("title", Schema::string())])))]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;

    store.set_state(|s| {
        s.make_map().unwrap().insert(
            "tree".into(),
            v(json!([
                {"data": {"title": "A"}, "children": [
                    {"data": {"title": "A1"}, "children": []}
                ]},
                {"data": {"title": "B"}, "children": []}
            ])),
        );
    })?;

    // node ids allocated on create propagate into state
    let state = store.get_state();
    let forest = state.get("tree").unwrap().as_list().unwrap().clone();
    let id_of = |node: &Value| node.get("id").unwrap().as_str().unwrap().to_owned();
    let a = id_of(&forest[0]);
    let a1 = id_of(forest[0].get("children").unwrap().index(0).unwrap());
    let b = id_of(&forest[1]);
    assert!(!a.is_empty() && !a1.is_empty() && !b.is_empty());
    assert_eq!(forest[0].get("data").unwrap().get("title").unwrap().as_str(), Some("A"));

    // move A (with its subtree) under B: the document sees one move
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let _sub = doc.subscribe(move |batch| sink.lock().push(batch.clone()));
    let moved = {
        let mut b_node = forest[1].clone();
        let a_node = forest[0].clone();
        b_node
            .make_map()
            .unwrap()
            .insert("children".into(), Value::from(vec![a_node]));
        Value::from(vec![b_node])
    };
    store.set_state(move |s| {
        s.make_map().unwrap().insert("tree".into(), moved);
    })?;

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].events.len(), 1);
    match &batches[0].events[0].diff {
        Diff::Tree(ops) => {
            assert_eq!(ops.len(), 1);
            assert!(matches!(ops[0], TreeOp::Move { .. }));
        }
        other => panic!("expected a tree diff, got {other:?}"),
    }

    let state = store.get_state();
    assert_eq!(
        j(&state.get("tree").unwrap().without_cid()),
        json!([
            {"id": b, "data": {"title": "B"}, "children": [
                {"id": a, "data": {"title": "A"}, "children": [
                    {"id": a1, "data": {"title": "A1"}, "children": []}
                ]}
            ]}
        ])
    );
    Ok(())
}

#[test]
fn null_preservation() -> Result<()> {
    let schema = Schema::map([("m", Schema::map([("nested", Schema::map([]))]))]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;

    doc.get_map("m")?.insert("nested", Value::Null)?;
    doc.commit();
    assert!(store.get_state().get("m").unwrap().get("nested").unwrap().is_null());

    store.set_state(|s| {
        let m = s.make_map().unwrap().get_mut("m").unwrap();
        m.make_map().unwrap().insert("other".into(), 1.0.into());
    })?;

    let state = store.get_state();
    assert!(state.get("m").unwrap().get("nested").unwrap().is_null());
    assert_eq!(state.get("m").unwrap().get("other"), Some(&Value::Number(1.0)));
    let m = doc.get_map("m")?;
    assert_eq!(m.get_value("nested"), Some(Value::Null));
    Ok(())
}

#[test]
fn no_feedback_between_directions() -> Result<()> {
    let doc = new_doc();
    let store = Store::new(doc.clone(), todo_schema())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = store.subscribe(move |_, meta| sink.lock().push(meta.direction));

    store.set_state(|s| {
        s.make_map()
            .unwrap()
            .insert("todos".into(), v(json!({"1": {"id": "1"}})));
    })?;
    assert_eq!(*seen.lock(), vec![crdt_mirror::Direction::ToSource]);

    doc.get_map("todos")?.delete("1")?;
    doc.commit();
    assert_eq!(
        *seen.lock(),
        vec![crdt_mirror::Direction::ToSource, crdt_mirror::Direction::FromSource]
    );
    Ok(())
}

#[test]
fn cid_stamping_round_trip() -> Result<()> {
    let schema = Schema::map([(
        "todos",
        Schema::map([])
            .with_cid()
            .catchall(Schema::map([("id", Schema::string())]).with_cid()),
    )]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;

    store.set_state(|s| {
        s.make_map()
            .unwrap()
            .insert("todos".into(), v(json!({"1": {"id": "1"}})));
    })?;
    let state = store.get_state();
    let todos_cid = doc.root_id("todos").unwrap();
    assert_eq!(
        state.get("todos").unwrap().get("$cid").unwrap().as_str(),
        Some(todos_cid.to_string().as_str())
    );
    let child = doc.map_child(todos_cid, "1").unwrap();
    assert_eq!(
        state.get("todos").unwrap().get("1").unwrap().get("$cid").unwrap().as_str(),
        Some(child.to_string().as_str())
    );

    // inbound creation carries $cid too
    let two = doc.map(todos_cid)?.insert_container("2", ContainerKind::Map)?;
    doc.map(two)?.insert("id", "2")?;
    doc.commit();
    let state = store.get_state();
    assert_eq!(
        state.get("todos").unwrap().get("2").unwrap().get("$cid").unwrap().as_str(),
        Some(two.to_string().as_str())
    );
    Ok(())
}

#[test]
fn counter_and_tags() -> Result<()> {
    let schema = Schema::map([("count", Schema::counter()), ("tags", Schema::list(Schema::string()))]);
    let doc = new_doc();
    let store = Store::with_options(doc.clone(), schema, strict())?;
    let metas = Arc::new(Mutex::new(Vec::new()));
    let sink = metas.clone();
    let _sub = store.subscribe(move |_, meta| sink.lock().push(meta.tags.clone()));

    store.set_state_with_tags(["bump".to_owned()], |s| {
        let m = s.make_map().unwrap();
        m.insert("count".into(), 3.0.into());
        m.insert("tags".into(), v(json!(["a", "b"])));
    })?;
    assert_eq!(*metas.lock(), vec![vec!["bump".to_owned()]]);

    let counter = doc.get_counter("count")?;
    assert_eq!(counter.value(), 3.0);
    counter.increment(-1.0)?;
    doc.commit();
    assert_eq!(store.get_state().get("count").unwrap().as_number(), Some(2.0));
    Ok(())
}

#[test]
fn validation_policy() -> Result<()> {
    let schema = Schema::map([(
        "todos",
        Schema::map([]).catchall(Schema::map([("id", Schema::string().required())])),
    )]);
    // the engine's default is strict
    let doc = new_doc();
    let mirror = Mirror::new(doc, schema.clone(), MirrorOptions::default())?;
    let err = mirror
        .set_state(|s| {
            s.make_map()
                .unwrap()
                .insert("todos".into(), v(json!({"1": {"id": 7.0}})));
        })
        .unwrap_err();
    assert!(matches!(err, crdt_mirror::Error::Validation { .. }));
    assert_eq!(j(&mirror.state()), json!({"todos": {}}));

    // the store façade accepts and logs instead
    let doc = new_doc();
    let store = Store::new(doc, schema)?;
    store.set_state(|s| {
        s.make_map()
            .unwrap()
            .insert("todos".into(), v(json!({"1": {"id": 7.0}})));
    })?;
    assert_eq!(j(&store.get_state()), json!({"todos": {"1": {"id": 7.0}}}));
    Ok(())
}

#[test]
fn initial_state_overlay() -> Result<()> {
    let schema = Schema::map([
        ("title", Schema::text().default_value("untitled")),
        ("todos", Schema::map([])),
    ]);
    let doc = new_doc();
    let store = Store::with_initial_state(
        doc.clone(),
        schema,
        MirrorOptions { throw_on_validation_error: false, ..Default::default() },
        v(json!({"todos": {"1": {"id": "1"}}})),
    )?;
    assert_eq!(
        j(&store.get_state()),
        json!({"title": "untitled", "todos": {"1": {"id": "1"}}})
    );
    // the document was brought up to match
    assert_eq!(doc.get_text("title")?.value(), "untitled");
    assert!(doc.map_child(doc.root_id("todos").unwrap(), "1").is_some());
    Ok(())
}
