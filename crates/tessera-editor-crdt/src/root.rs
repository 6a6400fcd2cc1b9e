//! Shared document roots.
//!
//! A root is one `LoroDoc`: the main document or a lazily loaded
//! sub-document. Each root buffers its change events in a queue that the
//! engine drains right after the operation that produced them, and may own
//! an undo primitive.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use loro::event::{Diff, DiffEvent, ListDiffItem};
use loro::{
    CommitOptions, ContainerID, EventTriggerKind, ExpandType, ExportMode, LoroDoc, StyleConfig,
    Subscription, TextDelta, UndoManager as LoroUndoManager, ValueOrContainer, VersionVector,
};
use smol_str::SmolStr;
use tessera_editor_core::UndoManager;

use crate::error::SyncError;
use crate::origin::ORIGIN_UNTRACKED;

/// Name of the root map holding the document tree in the main document.
pub const ROOT_MAP: &str = "root";

/// Index of a root within an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(pub(crate) u32);

impl RootId {
    pub const MAIN: RootId = RootId(0);
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root#{}", self.0)
    }
}

/// Host-facing name of a root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RootKey {
    Main,
    Sub(SmolStr),
}

impl RootKey {
    pub fn sub(key: impl Into<SmolStr>) -> Self {
        RootKey::Sub(key.into())
    }
}

/// One change event copied out of the backend callback.
#[derive(Clone, Debug)]
pub(crate) struct CapturedEvent {
    pub local: bool,
    pub origin: String,
    pub diffs: Vec<CapturedDiff>,
}

#[derive(Clone, Debug)]
pub(crate) struct CapturedDiff {
    pub target: ContainerID,
    pub change: DiffKind,
}

#[derive(Clone, Debug)]
pub(crate) enum DiffKind {
    Text(Vec<TextDelta>),
    Map(Vec<(String, Option<ValueOrContainer>)>),
    List(Vec<ListDiffItem>),
    Unsupported,
}

impl DiffKind {
    pub fn name(&self) -> &'static str {
        match self {
            DiffKind::Text(_) => "text",
            DiffKind::Map(_) => "map",
            DiffKind::List(_) => "list",
            DiffKind::Unsupported => "unsupported",
        }
    }
}

impl CapturedEvent {
    fn capture(event: &DiffEvent<'_>) -> Self {
        let diffs = event
            .events
            .iter()
            .map(|d| CapturedDiff {
                target: d.target.clone(),
                change: match &d.diff {
                    Diff::Text(deltas) => DiffKind::Text(deltas.clone()),
                    Diff::List(items) => DiffKind::List(items.clone()),
                    Diff::Map(delta) => {
                        let mut entries: Vec<_> = delta
                            .updated
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.clone()))
                            .collect();
                        entries.sort_by(|a, b| a.0.cmp(&b.0));
                        DiffKind::Map(entries)
                    }
                    _ => DiffKind::Unsupported,
                },
            })
            .collect();
        Self {
            local: matches!(event.triggered_by, EventTriggerKind::Local),
            origin: event.origin.to_string(),
            diffs,
        }
    }
}

/// Undo primitive for one root, wrapping Loro's undo manager.
pub(crate) struct LoroHistory {
    doc: LoroDoc,
    inner: LoroUndoManager,
    max_steps: usize,
}

impl LoroHistory {
    pub fn new(doc: &LoroDoc, max_steps: usize) -> Self {
        Self {
            doc: doc.clone(),
            inner: configured_undo(doc, max_steps),
            max_steps,
        }
    }
}

fn configured_undo(doc: &LoroDoc, max_steps: usize) -> LoroUndoManager {
    let mut undo = LoroUndoManager::new(doc);
    // grouping is done by the history manager
    undo.set_merge_interval(0);
    undo.set_max_undo_steps(max_steps);
    undo.add_exclude_origin_prefix(ORIGIN_UNTRACKED);
    undo
}

impl UndoManager for LoroHistory {
    fn can_undo(&self) -> bool {
        self.inner.can_undo()
    }

    fn can_redo(&self) -> bool {
        self.inner.can_redo()
    }

    fn undo(&mut self) -> bool {
        match self.inner.undo() {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!("undo failed: {}", e);
                false
            }
        }
    }

    fn redo(&mut self) -> bool {
        match self.inner.redo() {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!("redo failed: {}", e);
                false
            }
        }
    }

    fn clear_history(&mut self) {
        // Loro's UndoManager has no clear; a fresh one forgets everything
        self.inner = configured_undo(&self.doc, self.max_steps);
    }
}

pub(crate) struct SyncRoot {
    key: Option<SmolStr>,
    doc: LoroDoc,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    _subscription: Subscription,
    history: Option<LoroHistory>,
    embed_seq: u64,
}

impl SyncRoot {
    pub fn new(key: Option<SmolStr>, doc: LoroDoc, history_steps: Option<usize>) -> Self {
        doc.config_default_text_style(Some(StyleConfig {
            expand: ExpandType::None,
        }));
        let events = Arc::new(Mutex::new(Vec::new()));
        let queue = events.clone();
        let subscription = doc.subscribe_root(Arc::new(move |event: DiffEvent<'_>| {
            let captured = CapturedEvent::capture(&event);
            if let Ok(mut queue) = queue.lock() {
                queue.push(captured);
            }
        }));
        let history = history_steps.map(|steps| LoroHistory::new(&doc, steps));
        Self {
            key,
            doc,
            events,
            _subscription: subscription,
            history,
            embed_seq: 0,
        }
    }

    pub fn key(&self) -> Option<&SmolStr> {
        self.key.as_ref()
    }

    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn is_tracked(&self) -> bool {
        self.history.is_some()
    }

    pub fn history_mut(&mut self) -> Option<&mut LoroHistory> {
        self.history.as_mut()
    }

    pub fn drain_events(&self) -> Vec<CapturedEvent> {
        match self.events.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => Vec::new(),
        }
    }

    /// Commit pending operations. Returns true if the document changed
    /// since `before`.
    pub fn commit(&self, origin: &str, before: &VersionVector) -> bool {
        self.doc.commit_with(CommitOptions::new().origin(origin));
        self.doc.oplog_vv() != *before
    }

    /// Commit whatever is pending without tracking the version change.
    pub fn commit_pending(&self, origin: &str) {
        self.doc.commit_with(CommitOptions::new().origin(origin));
    }

    /// Unique key for an embedded component map.
    pub fn next_embed_key(&mut self) -> SmolStr {
        self.embed_seq += 1;
        SmolStr::new(format!("{}:{}", self.doc.peer_id(), self.embed_seq))
    }

    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>, SyncError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| SyncError::Export(e.to_string()))
    }

    /// Updates since `version`, or `None` if there is nothing new.
    pub fn export_updates_since(&self, version: &VersionVector) -> Result<Option<Vec<u8>>, SyncError> {
        if *version == self.doc.oplog_vv() {
            return Ok(None);
        }
        let updates = self
            .doc
            .export(ExportMode::Updates {
                from: Cow::Borrowed(version),
            })
            .map_err(|e| SyncError::Export(e.to_string()))?;
        Ok((!updates.is_empty()).then_some(updates))
    }

    pub fn import(&self, data: &[u8]) -> Result<(), SyncError> {
        self.doc
            .import(data)
            .map_err(|e| SyncError::Import(e.to_string()))?;
        Ok(())
    }
}

/// All roots known to an engine, addressable by id or key.
pub(crate) struct RootSet {
    roots: Vec<SyncRoot>,
    by_key: HashMap<SmolStr, RootId>,
}

impl RootSet {
    pub fn new(main: SyncRoot) -> Self {
        Self {
            roots: vec![main],
            by_key: HashMap::new(),
        }
    }

    pub fn add(&mut self, root: SyncRoot) -> RootId {
        let id = RootId(self.roots.len() as u32);
        if let Some(key) = root.key() {
            self.by_key.insert(key.clone(), id);
        }
        self.roots.push(root);
        id
    }

    pub fn get(&self, id: RootId) -> Option<&SyncRoot> {
        self.roots.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: RootId) -> Option<&mut SyncRoot> {
        self.roots.get_mut(id.0 as usize)
    }

    pub fn main(&self) -> &SyncRoot {
        &self.roots[0]
    }

    pub fn by_key(&self, key: &str) -> Option<RootId> {
        self.by_key.get(key).copied()
    }

    pub fn resolve(&self, key: &RootKey) -> Result<RootId, SyncError> {
        match key {
            RootKey::Main => Ok(RootId::MAIN),
            RootKey::Sub(key) => self
                .by_key(key)
                .ok_or_else(|| SyncError::UnknownRoot(key.clone())),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = RootId> + use<> {
        (0..self.roots.len() as u32).map(RootId)
    }

    pub fn versions(&self) -> Vec<VersionVector> {
        self.roots.iter().map(SyncRoot::version).collect()
    }

    pub fn version_of(versions: &[VersionVector], id: RootId) -> Option<&VersionVector> {
        versions.get(id.0 as usize)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncRoot> {
        self.roots.iter_mut()
    }
}
