use smol_str::SmolStr;

use crate::types::{ContentType, NodeId};

/// Errors from local model mutations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {node} is not a {expected}")]
    WrongKind { node: NodeId, expected: &'static str },

    #[error("offset {offset} out of bounds for slot of length {len}")]
    OutOfBounds { offset: usize, len: usize },

    #[error("slot does not accept {0:?} content")]
    SchemaViolation(ContentType),

    #[error("component {0} is already attached to a slot")]
    AlreadyAttached(NodeId),

    #[error("state key `{0}` is reserved")]
    ReservedKey(SmolStr),
}
