//! Core model types: node handles, content types, positions and selections.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// Stable handle to a node in the document arena.
///
/// Handles are never reused within a `DocumentModel`, so a stale handle
/// fails to resolve instead of aliasing a newer node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inline formats applied to a run of content, keyed by formatter name.
///
/// In a format edit, a `Value::Null` entry means "remove this format".
pub type FormatMap = BTreeMap<SmolStr, Value>;

/// Block-level attributes of a slot.
pub type AttributeMap = BTreeMap<SmolStr, Value>;

/// Kinds of content a slot may accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    InlineComponent,
    BlockComponent,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::InlineComponent => "inline_component",
            ContentType::BlockComponent => "block_component",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentType::Text),
            "inline_component" => Some(ContentType::InlineComponent),
            "block_component" => Some(ContentType::BlockComponent),
            _ => None,
        }
    }
}

/// Where a slot's or component's content lives.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Backing {
    /// Content is stored inline in the owning document.
    #[default]
    Sync,
    /// Content lives in a separately loaded sub-document. `metadata` is
    /// enough to render a placeholder before the content arrives.
    Async { metadata: Value },
}

impl Backing {
    pub fn is_async(&self) -> bool {
        matches!(self, Backing::Async { .. })
    }

    pub fn metadata(&self) -> Option<&Value> {
        match self {
            Backing::Sync => None,
            Backing::Async { metadata } => Some(metadata),
        }
    }
}

/// A position inside a slot, in UTF-16 code units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPosition {
    pub slot: NodeId,
    pub offset: usize,
}

impl SlotPosition {
    pub fn new(slot: NodeId, offset: usize) -> Self {
        Self { slot, offset }
    }
}

/// Selection with anchor (start of drag) and head (cursor position).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub anchor: SlotPosition,
    pub head: SlotPosition,
}

impl Selection {
    pub fn new(anchor: SlotPosition, head: SlotPosition) -> Self {
        Self { anchor, head }
    }

    pub fn collapsed(at: SlotPosition) -> Self {
        Self {
            anchor: at,
            head: at,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Shift endpoints after `len` code units were inserted at `at` in `slot`.
    ///
    /// Endpoints at or after the insertion point move right; earlier ones
    /// stay put. Returns true if anything moved.
    pub fn shift_for_insert(&mut self, slot: NodeId, at: usize, len: usize) -> bool {
        let mut moved = false;
        for pos in [&mut self.anchor, &mut self.head] {
            if pos.slot == slot && pos.offset >= at {
                pos.offset += len;
                moved = true;
            }
        }
        moved && len > 0
    }

    /// Shift endpoints after `len` code units were deleted at `at` in `slot`.
    ///
    /// Endpoints inside the deleted range collapse to `at`, later endpoints
    /// move left by `len`.
    pub fn shift_for_delete(&mut self, slot: NodeId, at: usize, len: usize) -> bool {
        let mut moved = false;
        for pos in [&mut self.anchor, &mut self.head] {
            if pos.slot != slot || pos.offset <= at {
                continue;
            }
            let next = if pos.offset >= at + len {
                pos.offset - len
            } else {
                at
            };
            moved |= next != pos.offset;
            pos.offset = next;
        }
        moved
    }
}
