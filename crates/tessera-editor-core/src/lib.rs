//! tessera-editor-core: local document model for the tessera editor.
//!
//! This crate provides:
//! - `DocumentModel` - arena of slots, components and state containers
//! - `Slot` - text and embedded components with inline formats and attributes
//! - `ModelChange` - journal of local edits consumed by synchronizers
//! - Registry traits for components, formatters and attributes
//! - `UndoManager` trait for undo/redo primitives
//!
//! Nothing here knows about CRDTs; `tessera-editor-crdt` builds on it.

pub mod actions;
pub mod document;
pub mod error;
pub mod registry;
pub mod slot;
pub mod types;
pub mod undo;
pub mod value;

pub use actions::{
    ChangeOp, ContentAction, ListSplice, MapAction, ModelChange, Origin, ReplayKind,
};
pub use document::{
    Component, DocumentModel, JournalBatch, Notification, RESERVED_KEY_PREFIX, StateList,
    StateMap,
};
pub use error::ModelError;
pub use registry::{ComponentRegistry, ComponentSchema, FormatRegistry, Registry};
pub use slot::{FormatRange, OBJECT_REPLACEMENT, Run, RunContent, Slot, utf16_len};
pub use smol_str::SmolStr;
pub use types::{
    AttributeMap, Backing, ContentType, FormatMap, NodeId, Selection, SlotPosition,
};
pub use undo::UndoManager;
pub use value::{LocalValue, StateInit};
