//! Journal entries describing local model mutations.
//!
//! Every mutation made with a local [`Origin`] appends one [`ModelChange`].
//! Synchronizers drain the journal and replay it against the shared document.

use serde_json::Value;
use smol_str::SmolStr;

use crate::types::{FormatMap, NodeId};
use crate::value::LocalValue;

/// What drove a replayed mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplayKind {
    /// A change received from another peer.
    Remote,
    /// An undo or redo of our own history.
    History,
}

/// Who is performing a model mutation.
///
/// Local mutations are journaled; replayed ones are not, which is what keeps
/// remote changes from bouncing back to the shared document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Local { record: bool },
    Replay(ReplayKind),
}

impl Origin {
    /// A local edit that should land in undo history.
    pub const LOCAL: Origin = Origin::Local { record: true };
    /// A local edit that syncs but is not undoable.
    pub const UNTRACKED: Origin = Origin::Local { record: false };

    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local { .. })
    }
}

/// One step of a slot edit, applied at a running offset.
#[derive(Clone, Debug, PartialEq)]
pub enum ContentAction {
    /// Skip `len` code units, optionally applying formats to them.
    Retain {
        len: usize,
        formats: Option<FormatMap>,
    },
    InsertText {
        text: String,
        formats: FormatMap,
    },
    InsertComponent {
        component: NodeId,
        formats: FormatMap,
    },
    /// Remove `len` code units. `removed` lists embedded components that
    /// were part of the range.
    Delete {
        len: usize,
        removed: Vec<NodeId>,
    },
    SetAttribute {
        key: SmolStr,
        value: Value,
    },
    RemoveAttribute {
        key: SmolStr,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum MapAction {
    Set { key: SmolStr, value: LocalValue },
    Delete { key: SmolStr },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListSplice {
    pub index: usize,
    pub delete: usize,
    pub insert: Vec<LocalValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeOp {
    Content(Vec<ContentAction>),
    Map(MapAction),
    List(ListSplice),
}

/// A journaled local mutation of a single node.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelChange {
    pub node: NodeId,
    /// Whether the edit should be undoable.
    pub record: bool,
    pub op: ChangeOp,
}

impl ModelChange {
    pub fn is_content(&self) -> bool {
        matches!(self.op, ChangeOp::Content(_))
    }

    /// Embedded components removed by this change.
    pub fn removed_components(&self) -> impl Iterator<Item = NodeId> + '_ {
        let actions: &[ContentAction] = match &self.op {
            ChangeOp::Content(actions) => actions,
            _ => &[],
        };
        actions
            .iter()
            .flat_map(|a| -> &[NodeId] {
                match a {
                    ContentAction::Delete { removed, .. } => removed,
                    _ => &[],
                }
            })
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_constants() {
        assert!(Origin::LOCAL.is_local());
        assert!(Origin::UNTRACKED.is_local());
        assert!(!Origin::Replay(ReplayKind::Remote).is_local());
        assert_ne!(Origin::LOCAL, Origin::UNTRACKED);
    }

    #[test]
    fn test_removed_components() {
        let change = ModelChange {
            node: NodeId(1),
            record: true,
            op: ChangeOp::Content(vec![
                ContentAction::Retain {
                    len: 2,
                    formats: None,
                },
                ContentAction::Delete {
                    len: 3,
                    removed: vec![NodeId(7), NodeId(9)],
                },
            ]),
        };
        let removed: Vec<_> = change.removed_components().collect();
        assert_eq!(removed, vec![NodeId(7), NodeId(9)]);
    }
}
