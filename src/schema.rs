use crate::id::ContainerKind;
use crate::value::{Value, CID_KEY};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// A pure function deriving a stable identity string from a list element.
#[derive(Clone)]
pub struct Selector(Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>);

impl Selector {
    /// Wraps a selector function.
    pub fn new(f: impl Fn(&Value) -> Option<String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A selector reading a string field of a map element.
    pub fn field(name: &'static str) -> Self {
        Self::new(move |v| v.get(name).and_then(Value::as_str).map(str::to_owned))
    }

    /// Applies the selector.
    pub fn select(&self, value: &Value) -> Option<String> {
        (self.0)(value)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Selector(..)")
    }
}

/// Schema of a map container.
#[derive(Clone, Debug, Default)]
pub struct MapSchema {
    /// Fixed field definitions.
    pub fields: IndexMap<String, Schema>,
    /// Schema applied to keys not covered by `fields`.
    pub catchall: Option<Box<Schema>>,
    /// Whether the mirrored object carries a `$cid` field.
    pub with_cid: bool,
}

/// Schema of a list or movable-list container.
#[derive(Clone, Debug)]
pub struct ListSchema {
    /// Schema of each element.
    pub item: Box<Schema>,
    /// Identity selector; mandatory for movable lists of map elements.
    pub selector: Option<Selector>,
}

/// Schema of a tree container.
#[derive(Clone, Debug)]
pub struct TreeSchema {
    /// Schema of each node's data map. Expected to be of map kind.
    pub node: Box<Schema>,
}

/// The variants a schema node can take.
#[derive(Clone, Debug)]
pub enum SchemaKind {
    /// String leaf.
    String,
    /// Finite number leaf.
    Number,
    /// Boolean leaf.
    Boolean,
    /// Accept anything, mirror nothing special.
    Ignore,
    /// Map container.
    Map(MapSchema),
    /// List container.
    List(ListSchema),
    /// Movable-list container.
    MovableList(ListSchema),
    /// Text container.
    Text,
    /// Tree container.
    Tree(TreeSchema),
    /// Counter container.
    Counter,
}

/// A recursive description of the mirrored state, binding state paths to
/// container kinds and primitive leaves.
#[derive(Clone, Debug)]
pub struct Schema {
    /// The node's variant.
    pub kind: SchemaKind,
    /// Whether the value must be present in a valid state.
    pub required: bool,
    /// Value synthesized into the default state.
    pub default_value: Option<Value>,
}

/// One validation finding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationIssue {
    /// Path of the offending value.
    pub path: String,
    /// Human-readable message.
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self { path: path.to_owned(), message: message.into() }
    }

    /// Renders as `path: message`.
    pub fn render(&self) -> String {
        format!("{}: {}", self.path, self.message)
    }
}

impl Schema {
    fn of(kind: SchemaKind) -> Self {
        Self { kind, required: false, default_value: None }
    }

    /// String leaf.
    pub fn string() -> Self {
        Self::of(SchemaKind::String)
    }

    /// Number leaf.
    pub fn number() -> Self {
        Self::of(SchemaKind::Number)
    }

    /// Boolean leaf.
    pub fn boolean() -> Self {
        Self::of(SchemaKind::Boolean)
    }

    /// Accepts anything.
    pub fn ignore() -> Self {
        Self::of(SchemaKind::Ignore)
    }

    /// Text container.
    pub fn text() -> Self {
        Self::of(SchemaKind::Text)
    }

    /// Counter container.
    pub fn counter() -> Self {
        Self::of(SchemaKind::Counter)
    }

    /// Map container with fixed fields.
    pub fn map<I: IntoIterator<Item = (&'static str, Schema)>>(fields: I) -> Self {
        Self::of(SchemaKind::Map(MapSchema {
            fields: fields.into_iter().map(|(k, s)| (k.to_owned(), s)).collect(),
            catchall: None,
            with_cid: false,
        }))
    }

    /// List container of `item` elements.
    pub fn list(item: Schema) -> Self {
        Self::of(SchemaKind::List(ListSchema { item: Box::new(item), selector: None }))
    }

    /// List container reconciled by identity.
    pub fn list_with_id(item: Schema, selector: Selector) -> Self {
        Self::of(SchemaKind::List(ListSchema {
            item: Box::new(item),
            selector: Some(selector),
        }))
    }

    /// Movable-list container reconciled by identity.
    pub fn movable_list(item: Schema, selector: Selector) -> Self {
        Self::of(SchemaKind::MovableList(ListSchema {
            item: Box::new(item),
            selector: Some(selector),
        }))
    }

    /// Movable-list container of plain values (identity derived from the
    /// values themselves).
    pub fn movable_list_plain(item: Schema) -> Self {
        Self::of(SchemaKind::MovableList(ListSchema { item: Box::new(item), selector: None }))
    }

    /// Tree container whose node data maps follow `node`.
    pub fn tree(node: Schema) -> Self {
        Self::of(SchemaKind::Tree(TreeSchema { node: Box::new(node) }))
    }

    /// Marks the value required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the value synthesized into the default state.
    pub fn default_value(mut self, v: impl Into<Value>) -> Self {
        self.default_value = Some(v.into());
        self
    }

    /// For map schemas: injects `$cid` into the mirrored object.
    pub fn with_cid(mut self) -> Self {
        if let SchemaKind::Map(m) = &mut self.kind {
            m.with_cid = true;
        }
        self
    }

    /// For map schemas: applies `value` to keys without a fixed definition.
    pub fn catchall(mut self, value: Schema) -> Self {
        if let SchemaKind::Map(m) = &mut self.kind {
            m.catchall = Some(Box::new(value));
        }
        self
    }

    /// The container kind this schema maps to, if it is container-typed.
    pub fn container_kind(&self) -> Option<ContainerKind> {
        Some(match &self.kind {
            SchemaKind::Map(_) => ContainerKind::Map,
            SchemaKind::List(_) => ContainerKind::List,
            SchemaKind::MovableList(_) => ContainerKind::MovableList,
            SchemaKind::Text => ContainerKind::Text,
            SchemaKind::Tree(_) => ContainerKind::Tree,
            SchemaKind::Counter => ContainerKind::Counter,
            _ => return None,
        })
    }

    /// Whether the mirrored object for this schema carries `$cid`.
    pub fn injects_cid(&self) -> bool {
        matches!(&self.kind, SchemaKind::Map(m) if m.with_cid)
    }

    /// The schema of a map child: its fixed field definition or the
    /// catchall.
    pub fn child_by_key(&self, key: &str) -> Option<&Schema> {
        match &self.kind {
            SchemaKind::Map(m) => m.fields.get(key).or(m.catchall.as_deref()),
            _ => None,
        }
    }

    /// The schema of a sequence element.
    pub fn child_item(&self) -> Option<&Schema> {
        match &self.kind {
            SchemaKind::List(l) | SchemaKind::MovableList(l) => Some(&l.item),
            _ => None,
        }
    }

    /// The schema of a tree node's data map.
    pub fn tree_node(&self) -> Option<&Schema> {
        match &self.kind {
            SchemaKind::Tree(t) => Some(&t.node),
            _ => None,
        }
    }

    /// The identity selector, for list kinds that carry one.
    pub fn selector(&self) -> Option<&Selector> {
        match &self.kind {
            SchemaKind::List(l) | SchemaKind::MovableList(l) => l.selector.as_ref(),
            _ => None,
        }
    }

    /// The neutral empty value of the schema's kind.
    pub fn neutral(&self) -> Value {
        match &self.kind {
            SchemaKind::String | SchemaKind::Text => Value::String(String::new()),
            SchemaKind::Number | SchemaKind::Counter => Value::Number(0.0),
            SchemaKind::Boolean => Value::Bool(false),
            SchemaKind::Ignore => Value::Null,
            SchemaKind::Map(_) => Value::map(),
            SchemaKind::List(_) | SchemaKind::MovableList(_) | SchemaKind::Tree(_) => {
                Value::list()
            }
        }
    }

    /// Synthesizes the default state: explicit defaults win, required
    /// values fall back to their neutral form, everything else is omitted.
    pub fn default_state(&self) -> Option<Value> {
        if let Some(v) = &self.default_value {
            return Some(v.clone());
        }
        if let SchemaKind::Map(m) = &self.kind {
            let mut out = IndexMap::new();
            for (k, s) in &m.fields {
                if let Some(v) = s.default_state() {
                    out.insert(k.clone(), v);
                }
            }
            if !out.is_empty() || self.required {
                return Some(Value::from(out));
            }
            return None;
        }
        if self.required {
            return Some(self.neutral());
        }
        None
    }

    /// Overlays defaults onto a stored value: a default replaces the
    /// neutral baseline, and map fields absent from the value are filled
    /// from their own defaults.
    pub fn apply_defaults(&self, current: &Value) -> Value {
        if let Some(default) = &self.default_value {
            if *current == self.neutral() {
                return default.clone();
            }
        }
        if let SchemaKind::Map(m) = &self.kind {
            if let Some(cur) = current.as_map() {
                let mut out = cur.clone();
                for (k, s) in &m.fields {
                    match cur.get(k) {
                        Some(v) => {
                            out.insert(k.clone(), s.apply_defaults(v));
                        }
                        None => {
                            if let Some(d) = s.default_state() {
                                out.insert(k.clone(), d);
                            }
                        }
                    }
                }
                return Value::from(out);
            }
        }
        current.clone()
    }

    /// Validates a proposed value, appending one issue per offending path.
    pub fn validate(&self, value: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.validate_at(value, "", &mut issues);
        issues
    }

    fn validate_at(&self, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        if value.is_null() {
            // explicit null is a valid value anywhere it is not required
            if self.required {
                issues.push(ValidationIssue::new(path, "required value is null"));
            }
            return;
        }
        match &self.kind {
            SchemaKind::Ignore => {}
            SchemaKind::String | SchemaKind::Text => {
                if value.as_str().is_none() {
                    issues.push(ValidationIssue::new(path, "expected a string"));
                }
            }
            SchemaKind::Number | SchemaKind::Counter => match value.as_number() {
                Some(n) if n.is_finite() => {}
                Some(_) => issues.push(ValidationIssue::new(path, "expected a finite number")),
                None => issues.push(ValidationIssue::new(path, "expected a number")),
            },
            SchemaKind::Boolean => {
                if value.as_bool().is_none() {
                    issues.push(ValidationIssue::new(path, "expected a boolean"));
                }
            }
            SchemaKind::Map(schema) => match value.as_map() {
                Some(map) => {
                    for (k, s) in &schema.fields {
                        let sub = format!("{path}/{k}");
                        match map.get(k) {
                            Some(v) => s.validate_at(v, &sub, issues),
                            None if s.required && s.default_value.is_none() => {
                                issues.push(ValidationIssue::new(&sub, "required field missing"))
                            }
                            None => {}
                        }
                    }
                    if let Some(catchall) = &schema.catchall {
                        for (k, v) in map {
                            if k == CID_KEY || schema.fields.contains_key(k) {
                                continue;
                            }
                            catchall.validate_at(v, &format!("{path}/{k}"), issues);
                        }
                    }
                }
                None => issues.push(ValidationIssue::new(path, "expected an object")),
            },
            SchemaKind::List(schema) | SchemaKind::MovableList(schema) => {
                match value.as_list() {
                    Some(list) => {
                        for (i, v) in list.iter().enumerate() {
                            schema.item.validate_at(v, &format!("{path}/{i}"), issues);
                        }
                    }
                    None => issues.push(ValidationIssue::new(path, "expected a sequence")),
                }
            }
            SchemaKind::Tree(schema) => match value.as_list() {
                Some(roots) => {
                    for (i, node) in roots.iter().enumerate() {
                        validate_tree_node(schema, node, &format!("{path}/{i}"), issues);
                    }
                }
                None => issues.push(ValidationIssue::new(path, "expected a node sequence")),
            },
        }
    }
}

fn validate_tree_node(
    schema: &TreeSchema,
    node: &Value,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(map) = node.as_map() else {
        issues.push(ValidationIssue::new(path, "expected a tree node object"));
        return;
    };
    if let Some(data) = map.get("data") {
        schema.node.validate_at(data, &format!("{path}/data"), issues);
    }
    match map.get("children") {
        Some(Value::List(children)) => {
            for (i, child) in children.iter().enumerate() {
                validate_tree_node(schema, child, &format!("{path}/children/{i}"), issues);
            }
        }
        Some(_) => issues.push(ValidationIssue::new(path, "children must be a sequence")),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todos_schema() -> Schema {
        Schema::map([(
            "todos",
            Schema::map([]).catchall(Schema::map([
                ("id", Schema::string().required()),
                ("text", Schema::string()),
                ("completed", Schema::boolean()),
            ])),
        )])
    }

    #[test]
    fn accepts_valid_state() {
        let schema = todos_schema();
        let state = json!({"todos": {"1": {"id": "1", "text": "milk", "completed": false}}});
        assert!(schema.validate(&state.into()).is_empty());
    }

    #[test]
    fn reports_offending_paths() {
        let schema = todos_schema();
        let state = json!({"todos": {"1": {"id": 7.0, "text": "milk"}}});
        let issues = schema.validate(&state.into());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/todos/1/id");
    }

    #[test]
    fn null_is_valid_unless_required() {
        let schema = Schema::map([("m", Schema::map([("nested", Schema::map([]))]))]);
        let state = json!({"m": {"nested": null}});
        assert!(schema.validate(&state.into()).is_empty());

        let schema = Schema::map([("m", Schema::map([]).required())]);
        let issues = schema.validate(&json!({"m": null}).into());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn default_state_synthesis() {
        let schema = Schema::map([
            ("title", Schema::string().default_value("untitled")),
            ("count", Schema::counter().required()),
            ("todos", Schema::map([])),
            ("tags", Schema::list(Schema::string()).required()),
        ]);
        let state = schema.default_state().unwrap();
        assert_eq!(
            serde_json::Value::from(&state),
            json!({"title": "untitled", "count": 0.0, "tags": []})
        );
    }

    #[test]
    fn ignores_cid_key_during_validation() {
        let schema = Schema::map([]).catchall(Schema::number());
        let state = json!({"$cid": "cid:1:map", "n": 1.0});
        assert!(schema.validate(&state.into()).is_empty());
    }
}
