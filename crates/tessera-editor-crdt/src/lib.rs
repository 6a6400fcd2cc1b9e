//! Loro-backed synchronization and undo history for tessera documents.
//!
//! This crate provides:
//! - `CollabEngine`: keeps a local `DocumentModel` and a shared `LoroDoc` in step
//! - Sub-document roots for async slots and components, via `SubModelLoader`
//! - `HistoryManager`: grouped, bounded undo/redo across roots
//! - `PresenceChannel`: selection sharing through a host presence transport

mod bridge;
mod config;
mod content;
mod convert;
mod engine;
mod error;
mod history;
mod loader;
mod origin;
mod presence;
mod root;
mod structure;

#[cfg(test)]
mod tests;

pub use config::{
    CaptureFilter, CollabConfig, DeletedItem, DeletedItemFilter, HistoryScope, RecordPolicy,
    TransactionFilters, TransactionInfo, content_only, record_hint,
};
pub use content::{EMBED_STYLE, PLACEHOLDER, PLACEHOLDER_STYLE};
pub use engine::{CollabEngine, Registries};
pub use error::SyncError;
pub use history::{Clock, HistoryManager, HistoryState, ManualClock, SystemClock};
pub use loader::{MemoryLoader, SubModel, SubModelLoad, SubModelLoader};
pub use origin::{
    LOCAL_ORIGIN_PREFIX, ORIGIN_TRACKED, ORIGIN_UNTRACKED, ReplayContext, is_own_echo,
};
pub use presence::{
    Collaborator, PeerState, PresenceChannel, PresenceTracker,
    PresenceTransport, RemoteCursor, RemoteSelection, SELECTION_FIELD, SelectionDescriptor,
};
pub use root::{ROOT_MAP, RootId, RootKey};

// Re-export Loro types that consumers need
pub use loro::{ExportMode, LoroDoc, VersionVector};
