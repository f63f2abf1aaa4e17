use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of a document container.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub enum ContainerKind {
    /// Unordered string-keyed mapping.
    Map,
    /// Ordered sequence.
    List,
    /// Ordered sequence with stable element identity across moves.
    MovableList,
    /// Collaborative plain text.
    Text,
    /// Ordered forest of nodes, each carrying a data map.
    Tree,
    /// Numeric accumulator.
    Counter,
}

impl ContainerKind {
    /// Stable lowercase name, used in rendered ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::List => "list",
            Self::MovableList => "mlist",
            Self::Text => "text",
            Self::Tree => "tree",
            Self::Counter => "counter",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "map" => Self::Map,
            "list" => Self::List,
            "mlist" => Self::MovableList,
            "text" => Self::Text,
            "tree" => Self::Tree,
            "counter" => Self::Counter,
            _ => return None,
        })
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable opaque identity of a container, minted by the document on
/// container creation and unchanged for the container's lifetime.
///
/// The rendered form (`cid:7:map`) round-trips through [`FromStr`], which is
/// how `$cid` fields stamped into mirrored state are read back.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct ContainerId {
    seq: u64,
    kind: ContainerKind,
}

impl ContainerId {
    pub(crate) fn new(seq: u64, kind: ContainerKind) -> Self {
        Self { seq, kind }
    }

    /// The container's kind.
    pub fn kind(self) -> ContainerKind {
        self.kind
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cid:{}:{}", self.seq, self.kind)
    }
}

impl FromStr for ContainerId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (tag, seq, kind) = (parts.next(), parts.next(), parts.next());
        match (tag, seq, kind) {
            (Some("cid"), Some(seq), Some(kind)) => {
                let seq = seq
                    .parse()
                    .map_err(|_| crate::Error::shape(format!("malformed container id {s:?}")))?;
                let kind = ContainerKind::parse(kind)
                    .ok_or_else(|| crate::Error::shape(format!("malformed container id {s:?}")))?;
                Ok(Self { seq, kind })
            }
            _ => Err(crate::Error::shape(format!("malformed container id {s:?}"))),
        }
    }
}

/// Identifier of a tree node, allocated by the document when the node is
/// created. Rendered as `node:<n>`; the rendered form is what tree-node
/// `id` fields in mirrored state hold.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct TreeNodeId(pub(crate) u64);

impl fmt::Display for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

impl FromStr for TreeNodeId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = s
            .strip_prefix("node:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| crate::Error::shape(format!("malformed tree node id {s:?}")))?;
        Ok(Self(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_roundtrip() {
        let id = ContainerId::new(17, ContainerKind::MovableList);
        assert_eq!(id.to_string(), "cid:17:mlist");
        assert_eq!(id.to_string().parse::<ContainerId>().unwrap(), id);
    }

    #[test]
    fn tree_node_id_roundtrip() {
        let id = TreeNodeId(3);
        assert_eq!(id.to_string(), "node:3");
        assert_eq!("node:3".parse::<TreeNodeId>().unwrap(), id);
        assert!("node:x".parse::<TreeNodeId>().is_err());
        assert!("cid:1:map".parse::<TreeNodeId>().is_err());
    }
}
