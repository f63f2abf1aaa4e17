use crate::id::ContainerId;

/// Errors surfaced by the mirror.
///
/// Caller-initiated faults propagate out of the `set_state` call site;
/// event-driven faults are handled locally by the engine and logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A proposed state violates the schema.
    #[error("validation failed: {}", messages.join("; "))]
    Validation {
        /// One message per offending path.
        messages: Vec<String>,
    },
    /// A path segment could not be navigated.
    #[error("unsupported path segment {segment} at {path}")]
    UnsupportedSegment {
        /// The offending segment, rendered.
        segment: String,
        /// The path up to and including the segment.
        path: String,
    },
    /// An outbound operation addressed a container that no longer exists.
    #[error("stale container reference {0}")]
    StaleReference(ContainerId),
    /// An identity selector produced the same id twice in a proposed state.
    #[error("duplicate identity {id:?} in proposed state")]
    DuplicateIdentity {
        /// The repeated id.
        id: String,
    },
    /// A value does not have the shape its position requires.
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    /// The adopted state differs from the document's normalized view.
    #[error("state diverged from the document after commit")]
    ConsistencyDivergence,
    /// An unexpected internal condition, surfaced with context.
    #[error("{0}")]
    Internal(String),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }
}
