//! The collaboration engine.
//!
//! Owns the local document model, the shared Loro roots, the identity bridge
//! between them and the undo history. Local edits are journaled by the model
//! and pushed to the shared document on [`CollabEngine::flush`]; shared
//! changes (remote updates, undo and redo) are replayed into the model.

use std::collections::{HashMap, HashSet};

use loro::cursor::Side;
use loro::{ContainerID, ContainerTrait, LoroDoc, VersionVector};
use serde_json::Value;
use smol_str::SmolStr;
use tessera_editor_core::{
    ChangeOp, ComponentRegistry, DocumentModel, FormatRegistry, LocalValue, ModelChange,
    ModelError, NodeId, ReplayKind, Selection, SlotPosition, UndoManager,
};

use crate::bridge::{Binding, IdentityBridge, Role, SharedNode};
use crate::config::{CollabConfig, HistoryScope, TransactionFilters, TransactionInfo};
use crate::content::{local_offset, shared_offset};
use crate::error::SyncError;
use crate::history::{
    Clock, HistoryManager, HistoryState, PositionAnchor, STEPS_PER_ENTRY, SelectionAnchor,
    SystemClock,
};
use crate::loader::{SubModelLoader, SubModelTarget};
use crate::origin::{ORIGIN_UNTRACKED, OriginGuard, ReplayContext, commit_origin, is_own_echo};
use crate::root::{CapturedDiff, DiffKind, ROOT_MAP, RootId, RootKey, RootSet, SyncRoot};

/// Both registries the engine consults, as one object.
pub trait Registries: ComponentRegistry + FormatRegistry {}

impl<T: ComponentRegistry + FormatRegistry> Registries for T {}

pub struct CollabEngine {
    pub(crate) model: DocumentModel,
    pub(crate) roots: RootSet,
    pub(crate) bridge: IdentityBridge,
    pub(crate) guard: OriginGuard,
    pub(crate) history: HistoryManager,
    pub(crate) config: CollabConfig,
    pub(crate) filters: TransactionFilters,
    pub(crate) registry: Box<dyn Registries>,
    pub(crate) loader: Option<Box<dyn SubModelLoader>>,
    pub(crate) clock: Box<dyn Clock>,
    /// Sub-documents the loader answered `Pending` for, by key.
    pub(crate) pending_loads: HashMap<SmolStr, SubModelTarget>,
    /// Nodes written to the shared document from their current state during
    /// this flush. Journal entries on them are already reflected.
    pub(crate) written: HashSet<NodeId>,
}

impl CollabEngine {
    pub fn new(config: CollabConfig, registry: impl Registries + 'static) -> Result<Self, SyncError> {
        Self::with_doc(LoroDoc::new(), config, registry)
    }

    /// Create an engine with a fixed Loro peer id.
    pub fn with_peer_id(
        peer: u64,
        config: CollabConfig,
        registry: impl Registries + 'static,
    ) -> Result<Self, SyncError> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer)?;
        Self::with_doc(doc, config, registry)
    }

    fn with_doc(
        doc: LoroDoc,
        config: CollabConfig,
        registry: impl Registries + 'static,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let steps = config.stack_size.saturating_mul(STEPS_PER_ENTRY);
        let main = SyncRoot::new(None, doc, Some(steps));
        tracing::debug!(
            stack_size = config.stack_size,
            scope = ?config.history_scope,
            "collab engine created"
        );
        Ok(Self {
            model: DocumentModel::new(),
            roots: RootSet::new(main),
            bridge: IdentityBridge::default(),
            guard: OriginGuard::default(),
            history: HistoryManager::new(config.stack_size, config.coalesce_window()),
            filters: TransactionFilters::for_scope(config.history_scope),
            config,
            registry: Box::new(registry),
            loader: None,
            clock: Box::new(SystemClock),
            pending_loads: HashMap::new(),
            written: HashSet::new(),
        })
    }

    pub fn with_loader(mut self, loader: impl SubModelLoader + 'static) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_filters(mut self, filters: TransactionFilters) -> Self {
        self.filters = filters;
        self
    }

    // === Accessors ===

    pub fn model(&self) -> &DocumentModel {
        &self.model
    }

    /// Mutable model access for local edits. Edits reach the shared document
    /// on the next [`flush`](Self::flush).
    pub fn model_mut(&mut self) -> &mut DocumentModel {
        &mut self.model
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// The main shared document.
    pub fn doc(&self) -> &LoroDoc {
        self.roots.main().doc()
    }

    pub fn sub_doc(&self, key: &str) -> Option<&LoroDoc> {
        let id = self.roots.by_key(key)?;
        self.roots.get(id).map(SyncRoot::doc)
    }

    /// Loro peer id of the main document, used as the presence peer id.
    pub fn peer_id(&self) -> u64 {
        self.doc().peer_id()
    }

    /// Primary shared container of a local node.
    pub fn shared_id(&self, node: NodeId) -> Option<ContainerID> {
        self.bridge
            .lookup_local(node)
            .map(|binding| binding.node.primary_id())
    }

    /// Local node a shared container in the main document belongs to.
    pub fn local_node(&self, id: &ContainerID) -> Option<NodeId> {
        self.bridge
            .lookup_shared(RootId::MAIN, id)
            .map(|(node, _)| node)
    }

    /// Number of local nodes paired with shared containers.
    pub fn bound_count(&self) -> usize {
        self.bridge.len()
    }

    // === Document setup ===

    /// Publish a locally built component as the document root.
    ///
    /// The initial write is not undoable.
    pub fn create_root(&mut self, component: NodeId) -> Result<(), SyncError> {
        if self.model.root().is_some() {
            return Err(SyncError::Config("engine already has a root component".into()));
        }
        if self.model.component(component).is_none() {
            return Err(ModelError::WrongKind {
                node: component,
                expected: "component",
            }
            .into());
        }
        let map = self.doc().get_map(ROOT_MAP);
        self.written.clear();
        let result = self.component_to_shared(RootId::MAIN, &map, component, None, 0);
        self.written.clear();
        for root in self.roots.iter_mut() {
            root.commit_pending(ORIGIN_UNTRACKED);
        }
        self.discard_echoes();
        result?;
        self.model.set_root(component)?;
        // the snapshot above already carries every edit made while building
        self.model.take_journal();
        tracing::debug!(%component, bound = self.bridge.len(), "root component published");
        Ok(())
    }

    /// Load a shared document snapshot and materialize its root component.
    pub fn join(&mut self, snapshot: &[u8]) -> Result<NodeId, SyncError> {
        if self.model.root().is_some() {
            return Err(SyncError::Config("engine already has a root component".into()));
        }
        let main = self.roots.main();
        main.import(snapshot)?;
        main.drain_events();
        let map = main.doc().get_map(ROOT_MAP);
        if map.is_empty() {
            return Err(SyncError::protocol("snapshot has no root component"));
        }
        let mut ctx = ReplayContext::new(ReplayKind::Remote);
        let root = self.component_from_shared(RootId::MAIN, &map, None, &mut ctx, 0)?;
        self.model.set_root(root)?;
        self.model.take_journal();
        tracing::debug!(%root, bound = self.bridge.len(), "joined shared document");
        Ok(root)
    }

    // === Local to shared ===

    /// Push journaled local edits to the shared document.
    ///
    /// Consecutive changes with the same record flag become one commit;
    /// recorded commits open or extend a history entry.
    pub fn flush(&mut self) -> Result<(), SyncError> {
        let batch = self.model.take_journal();
        if batch.changes.is_empty() {
            return Ok(());
        }
        let before = batch
            .selection_before
            .and_then(|selection| self.capture_selection(selection));
        self.guard.enqueue(batch.changes, &self.filters);
        self.written.clear();
        let result = self.flush_groups(before);
        self.written.clear();
        if result.is_err() {
            for root in self.roots.iter_mut() {
                root.commit_pending(ORIGIN_UNTRACKED);
            }
            self.discard_echoes();
        }
        self.sweep();
        result
    }

    fn flush_groups(&mut self, before: Option<SelectionAnchor>) -> Result<(), SyncError> {
        for group in self.guard.drain_groups() {
            let versions = self.roots.versions();
            let mut touched: Vec<RootId> = Vec::new();
            for change in &group.changes {
                if let Some(root) = self.push_change(change)? {
                    if !touched.contains(&root) {
                        touched.push(root);
                    }
                }
            }

            let record = group.record
                && self.filters.captures(&TransactionInfo {
                    changes: &group.changes,
                    roots: &touched,
                });
            let origin = commit_origin(record);
            let empty = VersionVector::default();
            let mut steps = Vec::new();
            for id in self.roots.ids() {
                let Some(root) = self.roots.get(id) else {
                    continue;
                };
                let before_vv = RootSet::version_of(&versions, id).unwrap_or(&empty);
                let root_origin = if touched.contains(&id) {
                    origin
                } else {
                    ORIGIN_UNTRACKED
                };
                let changed = root.commit(root_origin, before_vv);
                if changed && record && touched.contains(&id) && root.is_tracked() {
                    steps.push(id);
                }
            }
            self.drain_all(ReplayKind::Remote)?;

            if !steps.is_empty() {
                let after = self
                    .model
                    .selection()
                    .and_then(|selection| self.capture_selection(selection));
                let opened = self
                    .history
                    .record(self.clock.now(), &steps, before.clone(), after);
                tracing::trace!(opened, steps = steps.len(), "recorded history steps");
            }
        }
        Ok(())
    }

    /// Push one journal entry. Returns the root it was written to.
    fn push_change(
        &mut self,
        change: &ModelChange,
    ) -> Result<Option<RootId>, SyncError> {
        if self.written.contains(&change.node) {
            return Ok(None);
        }
        let Some(binding) = self.bridge.lookup_local(change.node).cloned() else {
            tracing::trace!(node = %change.node, "skipping change on unsynchronized node");
            return Ok(None);
        };
        match (&change.op, &binding.node) {
            (ChangeOp::Content(actions), SharedNode::Slot(handles)) => {
                self.push_content(binding.root, change.node, handles, actions)?
            }
            (ChangeOp::Map(action), SharedNode::Map(map)) => {
                self.push_map(binding.root, change.node, map, action)?
            }
            (ChangeOp::List(splice), SharedNode::List(list)) => {
                self.push_list(binding.root, change.node, list, splice)?
            }
            (op, _) => {
                return Err(SyncError::protocol(format!(
                    "{} change on node {} bound to a different container kind",
                    match op {
                        ChangeOp::Content(_) => "content",
                        ChangeOp::Map(_) => "map",
                        ChangeOp::List(_) => "list",
                    },
                    change.node
                )));
            }
        }
        Ok(Some(binding.root))
    }

    // === Shared to local ===

    /// Apply an update or snapshot from a peer to one root.
    ///
    /// Pending local edits are flushed first so offsets line up.
    pub fn apply_update(&mut self, key: &RootKey, data: &[u8]) -> Result<(), SyncError> {
        self.flush()?;
        let id = self.roots.resolve(key)?;
        let root = self
            .roots
            .get(id)
            .ok_or_else(|| SyncError::protocol(format!("{} missing", id)))?;
        root.import(data)?;
        let result = self.drain_root(id, ReplayKind::Remote);
        self.sweep();
        result
    }

    pub(crate) fn drain_all(&mut self, kind: ReplayKind) -> Result<(), SyncError> {
        for id in self.roots.ids() {
            self.drain_root(id, kind)?;
        }
        Ok(())
    }

    /// Replay every queued event of a root.
    ///
    /// During remote replay our own commits are skipped. History replay
    /// applies everything: the queue only holds the undo primitive's output.
    pub(crate) fn drain_root(&mut self, id: RootId, kind: ReplayKind) -> Result<(), SyncError> {
        let events = match self.roots.get(id) {
            Some(root) => root.drain_events(),
            None => return Ok(()),
        };
        for event in events {
            if kind == ReplayKind::Remote && event.local && is_own_echo(&event.origin) {
                continue;
            }
            let mut ctx = ReplayContext::new(kind);
            for diff in &event.diffs {
                self.replay_diff(id, diff, &mut ctx)?;
            }
        }
        Ok(())
    }

    fn discard_echoes(&mut self) {
        for id in self.roots.ids() {
            if let Some(root) = self.roots.get(id) {
                root.drain_events();
            }
        }
    }

    fn replay_diff(
        &mut self,
        root: RootId,
        diff: &CapturedDiff,
        ctx: &mut ReplayContext,
    ) -> Result<(), SyncError> {
        if ctx.is_fresh(&diff.target) {
            return Ok(());
        }
        let Some((node, role)) = self.bridge.lookup_shared(root, &diff.target) else {
            tracing::trace!(target = ?diff.target, "diff on unbound container");
            return Ok(());
        };
        match (role, &diff.change) {
            (Role::SlotContent, DiffKind::Text(deltas)) => {
                let Some(Binding {
                    node: SharedNode::Slot(handles),
                    ..
                }) = self.bridge.lookup_local(node).cloned()
                else {
                    return Ok(());
                };
                let depth = self.depth_of(node);
                self.replay_text(root, node, &handles, deltas, ctx, depth)
            }
            (Role::SlotAttrs, DiffKind::Map(entries)) => {
                self.replay_attributes(node, entries, ctx)
            }
            (Role::Map, DiffKind::Map(entries)) => self.replay_map(root, node, entries, ctx),
            (Role::List, DiffKind::List(items)) => self.replay_list(root, node, items, ctx),
            // embed maps are read when their replacement character arrives;
            // component fields never change after creation
            (Role::SlotEmbeds | Role::Component, DiffKind::Map(_)) => Ok(()),
            (role, change) => Err(SyncError::protocol(format!(
                "{} diff on {:?} container",
                change.name(),
                role
            ))),
        }
    }

    // === Export ===

    pub fn export_snapshot(&mut self, key: &RootKey) -> Result<Vec<u8>, SyncError> {
        self.flush()?;
        let id = self.roots.resolve(key)?;
        self.root(id)?.export_snapshot()
    }

    /// Updates since `version`, or `None` if there is nothing new.
    pub fn export_updates_since(
        &mut self,
        key: &RootKey,
        version: &VersionVector,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        self.flush()?;
        let id = self.roots.resolve(key)?;
        self.root(id)?.export_updates_since(version)
    }

    pub fn version(&self, key: &RootKey) -> Result<VersionVector, SyncError> {
        let id = self.roots.resolve(key)?;
        Ok(self.root(id)?.version())
    }

    fn root(&self, id: RootId) -> Result<&SyncRoot, SyncError> {
        self.roots
            .get(id)
            .ok_or_else(|| SyncError::protocol(format!("{} missing", id)))
    }

    // === History ===

    pub fn can_back(&self) -> bool {
        self.history.can_back()
    }

    pub fn can_forward(&self) -> bool {
        self.history.can_forward()
    }

    pub fn history_state(&self) -> HistoryState {
        self.history.state()
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    /// Close the open history group if its coalescing window has passed.
    pub fn poll_history(&mut self) {
        self.history.poll(self.clock.now());
    }

    pub fn clear_history(&mut self) {
        for root in self.roots.iter_mut() {
            if let Some(history) = root.history_mut() {
                history.clear_history();
            }
        }
        self.history.clear();
    }

    /// Undo the most recent history entry. Returns false if there is none.
    pub fn back(&mut self) -> Result<bool, SyncError> {
        self.flush()?;
        let Some(entry) = self.history.begin_back() else {
            return Ok(false);
        };
        let steps: Vec<RootId> = entry.steps.iter().rev().copied().collect();
        match self.replay_history(&steps, true) {
            Ok(()) => {
                self.sweep();
                self.restore_selection(entry.before.as_ref());
                self.history.end_back();
                Ok(true)
            }
            Err(e) => {
                self.history.abort();
                self.sweep();
                Err(e)
            }
        }
    }

    /// Redo the next history entry. Returns false if there is none.
    pub fn forward(&mut self) -> Result<bool, SyncError> {
        self.flush()?;
        let Some(entry) = self.history.begin_forward() else {
            return Ok(false);
        };
        match self.replay_history(&entry.steps, false) {
            Ok(()) => {
                self.sweep();
                self.restore_selection(entry.after.as_ref());
                self.history.end_forward();
                Ok(true)
            }
            Err(e) => {
                self.history.abort();
                self.sweep();
                Err(e)
            }
        }
    }

    fn replay_history(&mut self, steps: &[RootId], undo: bool) -> Result<(), SyncError> {
        for &id in steps {
            let Some(history) = self.roots.get_mut(id).and_then(SyncRoot::history_mut) else {
                tracing::warn!(%id, "history step for a root without undo tracking");
                continue;
            };
            let done = if undo { history.undo() } else { history.redo() };
            if !done {
                tracing::warn!(%id, undo, "undo primitive had nothing to replay");
            }
            self.drain_root(id, ReplayKind::History)?;
        }
        Ok(())
    }

    // === Selection anchors ===

    fn capture_selection(&self, selection: Selection) -> Option<SelectionAnchor> {
        Some(SelectionAnchor {
            anchor: self.capture_position(selection.anchor)?,
            head: self.capture_position(selection.head)?,
        })
    }

    fn capture_position(&self, position: SlotPosition) -> Option<PositionAnchor> {
        let binding = self.bridge.lookup_local(position.slot)?;
        let SharedNode::Slot(handles) = &binding.node else {
            return None;
        };
        let shared = shared_offset(&handles.content, position.offset);
        Some(PositionAnchor {
            root: binding.root,
            container: handles.content.id(),
            cursor: handles.content.get_cursor(shared, Side::Middle),
            offset: position.offset,
        })
    }

    fn resolve_position(&self, anchor: &PositionAnchor) -> Option<SlotPosition> {
        let (slot, role) = self.bridge.lookup_shared(anchor.root, &anchor.container)?;
        if role != Role::SlotContent {
            return None;
        }
        let Binding {
            node: SharedNode::Slot(handles),
            ..
        } = self.bridge.lookup_local(slot)?
        else {
            return None;
        };
        let doc = self.roots.get(anchor.root)?.doc();
        let offset = match anchor
            .cursor
            .as_ref()
            .and_then(|cursor| doc.get_cursor_pos(cursor).ok())
        {
            Some(found) => local_offset(&handles.content, found.current.pos),
            None => anchor.offset,
        };
        Some(SlotPosition::new(slot, offset.min(self.model.slot_len(slot))))
    }

    fn restore_selection(&mut self, anchor: Option<&SelectionAnchor>) {
        let Some(anchor) = anchor else {
            return;
        };
        match (
            self.resolve_position(&anchor.anchor),
            self.resolve_position(&anchor.head),
        ) {
            (Some(a), Some(h)) => self.model.set_selection(Some(Selection::new(a, h))),
            _ => tracing::debug!("history selection anchor no longer resolves"),
        }
    }

    // === Lifecycle ===

    /// Free detached local nodes and drop their bindings.
    pub(crate) fn sweep(&mut self) {
        for id in self.model.sweep() {
            self.forget(id);
        }
    }

    /// Free a value built during a replay that failed before attaching it.
    pub(crate) fn discard(&mut self, value: &LocalValue) {
        for id in self.model.discard(value) {
            self.forget(id);
        }
    }

    pub(crate) fn discard_node(&mut self, id: NodeId) {
        for freed in self.model.discard_node(id) {
            self.forget(freed);
        }
    }

    fn forget(&mut self, id: NodeId) {
        self.bridge.unbind(id);
        self.pending_loads.retain(|_, target| target.node() != id);
    }

    /// Nesting depth of a node below the root.
    pub(crate) fn depth_of(&self, node: NodeId) -> usize {
        let mut depth = 0;
        let mut current = node;
        while let Some(parent) = self.model.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    pub(crate) fn check_depth(&self, depth: usize) -> Result<(), SyncError> {
        if depth > self.config.max_depth {
            return Err(SyncError::DepthExceeded(self.config.max_depth));
        }
        Ok(())
    }

    /// Register a sub-document as a root. Undo tracks it only under
    /// multi-root history.
    pub(crate) fn add_sub_root(&mut self, key: SmolStr, doc: LoroDoc) -> RootId {
        let history = (self.config.history_scope == HistoryScope::MultiRoot)
            .then(|| self.config.stack_size.saturating_mul(STEPS_PER_ENTRY));
        let id = self.roots.add(SyncRoot::new(Some(key.clone()), doc, history));
        tracing::debug!(%id, %key, tracked = history.is_some(), "sub-document attached");
        id
    }

    /// Keys of sub-documents still waiting on the loader.
    pub fn pending_sub_models(&self) -> Vec<SmolStr> {
        let mut keys: Vec<SmolStr> = self.pending_loads.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// JSON snapshot of the local document, `Null` before a root exists.
    pub fn local_json(&self) -> Value {
        match self.model.root() {
            Some(root) => self.model.component_json(root),
            None => Value::Null,
        }
    }
}
