use crate::id::{ContainerId, TreeNodeId};
use crate::path::PathBuf;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A value carried inside a diff: either a plain value or a reference to a
/// child container introduced at that position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventValue {
    /// Plain value, including the explicit null sentinel.
    Value(Value),
    /// A child container; its content arrives through its own events or is
    /// projected from the document when needed in bulk.
    Container(ContainerId),
}

/// One run of a sequence delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ListDelta {
    /// Keep the next `n` elements.
    Retain(usize),
    /// Drop the next `n` elements.
    Delete(usize),
    /// Insert elements at the cursor.
    Insert(Vec<EventValue>),
}

/// One run of a text delta. Lengths count characters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TextDelta {
    /// Keep the next `n` characters.
    Retain(usize),
    /// Drop the next `n` characters.
    Delete(usize),
    /// Insert a fragment at the cursor.
    Insert(String),
}

/// One structural tree operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TreeOp {
    /// A node came into existence under `parent` at `index`.
    Create {
        /// The new node.
        target: TreeNodeId,
        /// Parent node, `None` for a forest root.
        parent: Option<TreeNodeId>,
        /// Position among the parent's children.
        index: usize,
    },
    /// A node moved to `parent`/`index`.
    Move {
        /// The moved node.
        target: TreeNodeId,
        /// New parent, `None` for a forest root.
        parent: Option<TreeNodeId>,
        /// New position among the parent's children.
        index: usize,
        /// Previous parent.
        old_parent: Option<TreeNodeId>,
        /// Previous position.
        old_index: usize,
    },
    /// A node (and its subtree) left the tree.
    Delete {
        /// The removed node.
        target: TreeNodeId,
        /// Parent it was removed from.
        old_parent: Option<TreeNodeId>,
        /// Position it was removed from.
        old_index: usize,
    },
}

/// A typed diff applied at an event's path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Diff {
    /// Map entry updates; `None` means the key was deleted.
    Map {
        /// Per-key updates in delivery order.
        updated: IndexMap<String, Option<EventValue>>,
    },
    /// Sequence delta.
    List(Vec<ListDelta>),
    /// Text delta.
    Text(Vec<TextDelta>),
    /// Ordered structural tree operations.
    Tree(Vec<TreeOp>),
    /// Counter delta.
    Counter {
        /// Amount added to the current value.
        increment: f64,
    },
}

impl Diff {
    /// The neutral baseline a missing target is initialized to before the
    /// diff is applied.
    pub fn baseline(&self) -> Value {
        match self {
            Self::Map { .. } => Value::map(),
            Self::List(_) | Self::Tree(_) => Value::list(),
            Self::Text(_) => Value::String(String::new()),
            Self::Counter { .. } => Value::Number(0.0),
        }
    }
}

/// What produced a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventBy {
    /// A local commit.
    Local,
    /// An imported remote change.
    Import,
    /// A checkout to another version.
    Checkout,
}

/// One change event: a diff addressed at a container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The container the diff applies to.
    pub target: ContainerId,
    /// The container's path from the state root at emission time.
    pub path: PathBuf,
    /// The typed diff.
    pub diff: Diff,
}

/// A batch of events flushed by one commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Commit origin marker, if any.
    pub origin: Option<String>,
    /// What produced the batch.
    pub by: EventBy,
    /// Events in application order.
    pub events: Vec<Event>,
}
