//! # crdt-mirror
//!
//! A bidirectional bridge between a structured, JSON-like application state
//! and a document of typed containers (maps, lists, movable lists, text,
//! trees, counters). Application code observes and mutates state as plain
//! data; the document stays the source of truth.
//!
//! ## Reconciliation
//! The engine maintains equivalence between the two worlds:
//!
//! - **Inbound**: the document commits a batch of path-addressed events;
//!   the event applier folds the typed diffs into a structurally shared
//!   copy of the state and subscribers observe it as `from-source`.
//! - **Outbound**: a caller proposes a new state; the diff engine compares
//!   it against the current one and emits an ordered change script
//!   (insert, delete, move, set, container creation, tree create/move/
//!   delete). The script executes against the document within a single
//!   commit tagged `to-source`, which the inbound path filters so a cycle
//!   never feeds itself.
//!
//! ## Identity
//! Every container carries a stable [`ContainerId`]. Map schemas can ask
//! for a synthesized `$cid` field in the mirrored object; it makes
//! identity-based reconciliation possible across round trips and is never
//! written back to the document. Lists with an identity selector and
//! movable lists reconcile elements by id, so a surviving element keeps
//! its container across arbitrary permutations; movable-list reorders are
//! planned over a longest increasing subsequence so a one-element rotation
//! costs exactly one move.
//!
//! ## Trees
//! Tree state has the shape `{id, data, children}`. Node ids are assigned
//! by the document on creation: the change script carries deferred slots
//! that later operations in the same script resolve once the id exists,
//! and the assigned id is stamped back into the adopted state.
#![warn(missing_docs)]
mod applier;
mod change;
mod diff;
mod doc;
mod error;
mod event;
mod id;
mod mirror;
mod path;
#[cfg(test)]
mod props;
mod registry;
mod schema;
mod store;
mod tree;
mod value;

pub use crate::change::{ChangeOp, ChangeScript, NodeRef};
pub use crate::diff::InferOptions;
pub use crate::doc::{
    CounterRef, Document, ListRef, MapRef, MovableListRef, Subscription, TextRef, TreeRef,
};
pub use crate::error::{Error, Result};
pub use crate::event::{
    Diff, Event, EventBatch, EventBy, EventValue, ListDelta, TextDelta, TreeOp,
};
pub use crate::id::{ContainerId, ContainerKind, TreeNodeId};
pub use crate::mirror::{
    Direction, Mirror, MirrorOptions, StateSubscription, UpdateMeta, OUTBOUND_ORIGIN,
};
pub use crate::path::{resolve, PathBuf, Resolved, Segment};
pub use crate::registry::{ChildKey, Registry};
pub use crate::schema::{
    ListSchema, MapSchema, Schema, SchemaKind, Selector, TreeSchema, ValidationIssue,
};
pub use crate::store::Store;
pub use crate::value::{Value, ValueKind, CID_KEY};
