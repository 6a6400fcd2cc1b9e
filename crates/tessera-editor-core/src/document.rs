//! Arena-backed document model with a change journal.
//!
//! All nodes (slots, components, state maps and lists) live in one arena and
//! are addressed by [`NodeId`]. Parent links are tracked so removed subtrees
//! can be swept explicitly once synchronizers are done with them.
//!
//! Every mutation takes an [`Origin`]. Local origins validate their input and
//! append to the journal; replay origins clamp instead of failing and are
//! never journaled.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value, json};
use smol_str::SmolStr;

use crate::actions::{ChangeOp, ContentAction, ListSplice, MapAction, ModelChange, Origin};
use crate::error::ModelError;
use crate::registry::ComponentSchema;
use crate::slot::{RunContent, Slot};
use crate::types::{Backing, ContentType, FormatMap, NodeId, Selection, SlotPosition};
use crate::value::{LocalValue, StateInit};

/// State keys starting with this prefix are reserved for the sync layer.
pub const RESERVED_KEY_PREFIX: char = '$';

#[derive(Clone, Debug)]
pub struct Component {
    name: SmolStr,
    content_type: ContentType,
    backing: Backing,
    state: LocalValue,
}

impl Component {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn state(&self) -> &LocalValue {
        &self.state
    }
}

#[derive(Clone, Debug, Default)]
pub struct StateMap {
    entries: BTreeMap<SmolStr, LocalValue>,
}

impl StateMap {
    pub fn get(&self, key: &str) -> Option<&LocalValue> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SmolStr, &LocalValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StateList {
    items: Vec<LocalValue>,
}

impl StateList {
    pub fn items(&self) -> &[LocalValue] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Change notifications for the rendering layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    ContentChanged(NodeId),
    StateChanged(NodeId),
    SelectionChanged,
}

/// Journal contents drained by a synchronizer.
#[derive(Clone, Debug, Default)]
pub struct JournalBatch {
    pub changes: Vec<ModelChange>,
    /// Selection as it was before the first change of the batch.
    pub selection_before: Option<Selection>,
}

#[derive(Debug, Default)]
pub struct DocumentModel {
    next_id: u64,
    root: Option<NodeId>,
    slots: HashMap<NodeId, Slot>,
    components: HashMap<NodeId, Component>,
    maps: HashMap<NodeId, StateMap>,
    lists: HashMap<NodeId, StateList>,
    parents: HashMap<NodeId, NodeId>,
    journal: Vec<ModelChange>,
    batch_selection: Option<Option<Selection>>,
    selection: Option<Selection>,
    detached: Vec<NodeId>,
    notifications: Vec<Notification>,
}

impl DocumentModel {
    pub fn new() -> Self {
        Self::default()
    }

    // === Construction ===

    pub fn create_slot(&mut self, schema: Vec<ContentType>, backing: Backing) -> NodeId {
        let id = self.alloc();
        self.slots
            .insert(id, Slot::new(schema).with_backing(backing));
        id
    }

    pub fn create_map(&mut self, entries: Vec<(SmolStr, LocalValue)>) -> NodeId {
        let id = self.alloc();
        for (_, value) in &entries {
            self.adopt(value, id);
        }
        self.maps.insert(
            id,
            StateMap {
                entries: entries.into_iter().collect(),
            },
        );
        id
    }

    pub fn create_list(&mut self, items: Vec<LocalValue>) -> NodeId {
        let id = self.alloc();
        for value in &items {
            self.adopt(value, id);
        }
        self.lists.insert(id, StateList { items });
        id
    }

    pub fn create_component(
        &mut self,
        schema: &ComponentSchema,
        backing: Backing,
        state: LocalValue,
    ) -> NodeId {
        let id = self.alloc();
        self.adopt(&state, id);
        self.components.insert(
            id,
            Component {
                name: schema.name.clone(),
                content_type: schema.content_type,
                backing,
                state,
            },
        );
        id
    }

    /// Materialize a state description into arena nodes.
    pub fn build_state(&mut self, init: StateInit) -> LocalValue {
        match init {
            StateInit::Slot(id) => LocalValue::Slot(id),
            StateInit::Scalar(v) => LocalValue::Scalar(v),
            StateInit::Map(entries) => {
                let entries = entries
                    .into_iter()
                    .map(|(k, v)| (k, self.build_state(v)))
                    .collect();
                LocalValue::Map(self.create_map(entries))
            }
            StateInit::List(items) => {
                let items = items.into_iter().map(|v| self.build_state(v)).collect();
                LocalValue::List(self.create_list(items))
            }
        }
    }

    pub fn set_root(&mut self, component: NodeId) -> Result<(), ModelError> {
        if !self.components.contains_key(&component) {
            return Err(self.kind_error(component, "component"));
        }
        self.root = Some(component);
        Ok(())
    }

    // === Accessors ===

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn component(&self, id: NodeId) -> Option<&Component> {
        self.components.get(&id)
    }

    pub fn map(&self, id: NodeId) -> Option<&StateMap> {
        self.maps.get(&id)
    }

    pub fn list(&self, id: NodeId) -> Option<&StateList> {
        self.lists.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
            || self.components.contains_key(&id)
            || self.maps.contains_key(&id)
            || self.lists.contains_key(&id)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(&id).copied()
    }

    /// Length of a slot, or 0 if it does not exist.
    pub fn slot_len(&self, id: NodeId) -> usize {
        self.slots.get(&id).map(Slot::len).unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        self.slots.len() + self.components.len() + self.maps.len() + self.lists.len()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    /// Slots of a component in depth-first state order.
    pub fn component_slots(&self, component: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if let Some(c) = self.components.get(&component) {
            self.collect_slots(&c.state, &mut out);
        }
        out
    }

    fn collect_slots(&self, value: &LocalValue, out: &mut Vec<NodeId>) {
        match value {
            LocalValue::Slot(id) => out.push(*id),
            LocalValue::Map(id) => {
                if let Some(map) = self.maps.get(id) {
                    for v in map.entries.values() {
                        self.collect_slots(v, out);
                    }
                }
            }
            LocalValue::List(id) => {
                if let Some(list) = self.lists.get(id) {
                    for v in &list.items {
                        self.collect_slots(v, out);
                    }
                }
            }
            LocalValue::Scalar(_) => {}
        }
    }

    /// The component whose state (directly or through maps and lists)
    /// contains `slot`.
    pub fn owning_component(&self, slot: NodeId) -> Option<NodeId> {
        let mut current = self.parent(slot)?;
        loop {
            if self.components.contains_key(&current) {
                return Some(current);
            }
            if self.slots.contains_key(&current) {
                return None;
            }
            current = self.parent(current)?;
        }
    }

    // === Slot mutations ===

    pub fn insert_text(
        &mut self,
        origin: Origin,
        slot: NodeId,
        offset: usize,
        text: &str,
        formats: FormatMap,
    ) -> Result<(), ModelError> {
        let s = self.slot_mut(slot)?;
        if origin.is_local() {
            check_offset(offset, s.len())?;
            if !s.accepts(ContentType::Text) {
                return Err(ModelError::SchemaViolation(ContentType::Text));
            }
        }
        if text.is_empty() {
            return Ok(());
        }
        let at = s.insert_text(offset, text, formats.clone());
        self.notify(Notification::ContentChanged(slot));
        let action = ContentAction::InsertText {
            text: text.to_string(),
            formats,
        };
        self.record(origin, slot, ChangeOp::Content(with_retain(at, action)));
        Ok(())
    }

    pub fn insert_component(
        &mut self,
        origin: Origin,
        slot: NodeId,
        offset: usize,
        component: NodeId,
        formats: FormatMap,
    ) -> Result<(), ModelError> {
        let content_type = match self.components.get(&component) {
            Some(c) => c.content_type,
            None => return Err(self.kind_error(component, "component")),
        };
        if self.parents.contains_key(&component) {
            return Err(ModelError::AlreadyAttached(component));
        }
        let s = self.slot_mut(slot)?;
        if origin.is_local() {
            check_offset(offset, s.len())?;
            if !s.accepts(content_type) {
                return Err(ModelError::SchemaViolation(content_type));
            }
        }
        let at = s.insert_component(offset, component, formats.clone());
        self.parents.insert(component, slot);
        self.notify(Notification::ContentChanged(slot));
        let action = ContentAction::InsertComponent { component, formats };
        self.record(origin, slot, ChangeOp::Content(with_retain(at, action)));
        Ok(())
    }

    /// Delete a range. Returns embedded components that were removed; they
    /// stay in the arena until the next [`sweep`](Self::sweep).
    pub fn delete(
        &mut self,
        origin: Origin,
        slot: NodeId,
        offset: usize,
        len: usize,
    ) -> Result<Vec<NodeId>, ModelError> {
        let s = self.slot_mut(slot)?;
        if origin.is_local() {
            check_offset(offset.saturating_add(len), s.len())?;
        }
        let at = s.snap(offset);
        let (deleted, removed) = s.delete(offset, len);
        if deleted == 0 {
            return Ok(removed);
        }
        for component in &removed {
            self.detach(*component);
        }
        self.notify(Notification::ContentChanged(slot));
        let action = ContentAction::Delete {
            len: deleted,
            removed: removed.clone(),
        };
        self.record(origin, slot, ChangeOp::Content(with_retain(at, action)));
        Ok(removed)
    }

    /// Apply format edits to a range. `Null` values remove the format.
    pub fn format(
        &mut self,
        origin: Origin,
        slot: NodeId,
        offset: usize,
        len: usize,
        formats: FormatMap,
    ) -> Result<(), ModelError> {
        let s = self.slot_mut(slot)?;
        if origin.is_local() {
            check_offset(offset.saturating_add(len), s.len())?;
        }
        let start = s.snap(offset);
        let len = s.snap(offset.saturating_add(len)) - start;
        if len == 0 || formats.is_empty() {
            return Ok(());
        }
        s.format(start, len, &formats);
        self.notify(Notification::ContentChanged(slot));
        let action = ContentAction::Retain {
            len,
            formats: Some(formats),
        };
        self.record(origin, slot, ChangeOp::Content(with_retain(start, action)));
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        origin: Origin,
        slot: NodeId,
        key: impl Into<SmolStr>,
        value: Value,
    ) -> Result<(), ModelError> {
        let key = key.into();
        let s = self.slot_mut(slot)?;
        if s.attribute(&key) == Some(&value) {
            return Ok(());
        }
        s.set_attribute(key.clone(), value.clone());
        self.notify(Notification::ContentChanged(slot));
        self.record(
            origin,
            slot,
            ChangeOp::Content(vec![ContentAction::SetAttribute { key, value }]),
        );
        Ok(())
    }

    pub fn remove_attribute(
        &mut self,
        origin: Origin,
        slot: NodeId,
        key: &str,
    ) -> Result<(), ModelError> {
        let s = self.slot_mut(slot)?;
        if s.remove_attribute(key).is_none() {
            return Ok(());
        }
        self.notify(Notification::ContentChanged(slot));
        self.record(
            origin,
            slot,
            ChangeOp::Content(vec![ContentAction::RemoveAttribute { key: key.into() }]),
        );
        Ok(())
    }

    // === State mutations ===

    pub fn map_set(
        &mut self,
        origin: Origin,
        map: NodeId,
        key: impl Into<SmolStr>,
        value: LocalValue,
    ) -> Result<(), ModelError> {
        let key = key.into();
        if origin.is_local() && key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(ModelError::ReservedKey(key));
        }
        if !self.maps.contains_key(&map) {
            return Err(self.kind_error(map, "map"));
        }
        if let Some(child) = value.node() {
            if origin.is_local() && self.parents.contains_key(&child) {
                return Err(ModelError::AlreadyAttached(child));
            }
        }
        self.adopt(&value, map);
        let previous = self
            .maps
            .get_mut(&map)
            .and_then(|m| m.entries.insert(key.clone(), value.clone()));
        if let Some(old) = previous.as_ref().and_then(LocalValue::node) {
            if Some(old) != value.node() {
                self.detach(old);
            }
        }
        self.notify(Notification::StateChanged(map));
        self.record(origin, map, ChangeOp::Map(MapAction::Set { key, value }));
        Ok(())
    }

    pub fn map_delete(&mut self, origin: Origin, map: NodeId, key: &str) -> Result<(), ModelError> {
        let Some(m) = self.maps.get_mut(&map) else {
            return Err(self.kind_error(map, "map"));
        };
        let Some(old) = m.entries.remove(key) else {
            return Ok(());
        };
        if let Some(node) = old.node() {
            self.detach(node);
        }
        self.notify(Notification::StateChanged(map));
        self.record(
            origin,
            map,
            ChangeOp::Map(MapAction::Delete { key: key.into() }),
        );
        Ok(())
    }

    pub fn list_splice(
        &mut self,
        origin: Origin,
        list: NodeId,
        index: usize,
        delete: usize,
        insert: Vec<LocalValue>,
    ) -> Result<(), ModelError> {
        let len = match self.lists.get(&list) {
            Some(l) => l.items.len(),
            None => return Err(self.kind_error(list, "list")),
        };
        if origin.is_local() {
            check_offset(index.saturating_add(delete), len)?;
        }
        let index = index.min(len);
        let delete = delete.min(len - index);
        if delete == 0 && insert.is_empty() {
            return Ok(());
        }
        for value in &insert {
            self.adopt(value, list);
        }
        let removed: Vec<LocalValue> = match self.lists.get_mut(&list) {
            Some(l) => l
                .items
                .splice(index..index + delete, insert.iter().cloned())
                .collect(),
            None => Vec::new(),
        };
        for node in removed.iter().filter_map(LocalValue::node) {
            if !insert.iter().any(|v| v.node() == Some(node)) {
                self.detach(node);
            }
        }
        self.notify(Notification::StateChanged(list));
        self.record(
            origin,
            list,
            ChangeOp::List(ListSplice {
                index,
                delete,
                insert,
            }),
        );
        Ok(())
    }

    // === Selection ===

    pub fn set_selection(&mut self, selection: Option<Selection>) {
        if self.selection != selection {
            self.selection = selection;
            self.notify(Notification::SelectionChanged);
        }
    }

    pub fn shift_selection_for_insert(&mut self, slot: NodeId, at: usize, len: usize) {
        if let Some(selection) = self.selection.as_mut() {
            if selection.shift_for_insert(slot, at, len) {
                self.notify(Notification::SelectionChanged);
            }
        }
    }

    pub fn shift_selection_for_delete(&mut self, slot: NodeId, at: usize, len: usize) {
        if let Some(selection) = self.selection.as_mut() {
            if selection.shift_for_delete(slot, at, len) {
                self.notify(Notification::SelectionChanged);
            }
        }
    }

    // === Journal and lifecycle ===

    pub fn has_pending_changes(&self) -> bool {
        !self.journal.is_empty()
    }

    pub fn take_journal(&mut self) -> JournalBatch {
        let selection_before = self.batch_selection.take().flatten();
        JournalBatch {
            changes: std::mem::take(&mut self.journal),
            selection_before,
        }
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Free every detached subtree that was not re-attached since removal.
    ///
    /// Returns the ids of all freed nodes so callers can drop bindings.
    pub fn sweep(&mut self) -> Vec<NodeId> {
        let candidates = std::mem::take(&mut self.detached);
        let mut freed = Vec::new();
        for id in candidates {
            if self.parents.contains_key(&id) || Some(id) == self.root || !self.contains(id) {
                continue;
            }
            self.free_subtree(id, &mut freed);
        }
        if !freed.is_empty() {
            tracing::trace!(count = freed.len(), "swept detached nodes");
            self.drop_dangling_selection();
        }
        freed
    }

    /// Free a value that was built but never attached.
    pub fn discard(&mut self, value: &LocalValue) -> Vec<NodeId> {
        match value.node() {
            Some(id) => self.discard_node(id),
            None => Vec::new(),
        }
    }

    /// Free an unattached node of any kind and everything below it.
    pub fn discard_node(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut freed = Vec::new();
        if self.contains(id) {
            self.parents.remove(&id);
            self.free_subtree(id, &mut freed);
        }
        freed
    }

    fn free_subtree(&mut self, id: NodeId, freed: &mut Vec<NodeId>) {
        let children = self.children(id);
        self.slots.remove(&id);
        self.components.remove(&id);
        self.maps.remove(&id);
        self.lists.remove(&id);
        self.parents.remove(&id);
        freed.push(id);
        for child in children {
            self.free_subtree(child, freed);
        }
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        if let Some(slot) = self.slots.get(&id) {
            return slot.components().into_iter().map(|(_, c)| c).collect();
        }
        if let Some(component) = self.components.get(&id) {
            return component.state.node().into_iter().collect();
        }
        if let Some(map) = self.maps.get(&id) {
            return map.entries.values().filter_map(LocalValue::node).collect();
        }
        if let Some(list) = self.lists.get(&id) {
            return list.items.iter().filter_map(LocalValue::node).collect();
        }
        Vec::new()
    }

    fn drop_dangling_selection(&mut self) {
        let dangling = self.selection.is_some_and(|s| {
            !self.slots.contains_key(&s.anchor.slot) || !self.slots.contains_key(&s.head.slot)
        });
        if dangling {
            self.set_selection(None);
        }
    }

    // === Presence paths ===

    /// Encode a position as a path from the root component.
    ///
    /// The path alternates slot index within a component and component
    /// offset within a slot, ending with the offset in the innermost slot.
    pub fn path_of(&self, position: SlotPosition) -> Option<Vec<usize>> {
        self.slots.get(&position.slot)?;
        let mut path = vec![position.offset];
        let mut slot = position.slot;
        loop {
            let component = self.owning_component(slot)?;
            let index = self
                .component_slots(component)
                .iter()
                .position(|s| *s == slot)?;
            path.push(index);
            if Some(component) == self.root {
                break;
            }
            let parent_slot = self.parent(component)?;
            path.push(self.slots.get(&parent_slot)?.component_offset(component)?);
            slot = parent_slot;
        }
        path.reverse();
        Some(path)
    }

    /// Resolve a path produced by [`path_of`](Self::path_of), clamping the
    /// final offset to the slot length.
    pub fn resolve_path(&self, path: &[usize]) -> Option<SlotPosition> {
        let (&offset, rest) = path.split_last()?;
        let mut steps = rest.iter().copied();
        let mut component = self.root?;
        let mut slot = *self.component_slots(component).get(steps.next()?)?;
        while let Some(component_offset) = steps.next() {
            component = self.slots.get(&slot)?.component_at(component_offset)?;
            slot = *self.component_slots(component).get(steps.next()?)?;
        }
        let len = self.slots.get(&slot)?.len();
        Some(SlotPosition::new(slot, offset.min(len)))
    }

    // === Structural snapshot ===

    /// JSON rendering of a value and everything below it.
    pub fn to_json(&self, value: &LocalValue) -> Value {
        match value {
            LocalValue::Scalar(v) => v.clone(),
            LocalValue::Slot(id) => self.slot_json(*id),
            LocalValue::Map(id) => {
                let entries = self
                    .maps
                    .get(id)
                    .map(|m| {
                        m.entries
                            .iter()
                            .map(|(k, v)| (k.to_string(), self.to_json(v)))
                            .collect::<Map<_, _>>()
                    })
                    .unwrap_or_default();
                Value::Object(entries)
            }
            LocalValue::List(id) => Value::Array(
                self.lists
                    .get(id)
                    .map(|l| l.items.iter().map(|v| self.to_json(v)).collect())
                    .unwrap_or_default(),
            ),
        }
    }

    pub fn component_json(&self, id: NodeId) -> Value {
        match self.components.get(&id) {
            Some(c) => json!({
                "name": c.name.as_str(),
                "state": self.to_json(&c.state),
            }),
            None => Value::Null,
        }
    }

    fn slot_json(&self, id: NodeId) -> Value {
        let Some(slot) = self.slots.get(&id) else {
            return Value::Null;
        };
        let content: Vec<Value> = slot
            .runs()
            .iter()
            .map(|run| {
                let formats: Map<String, Value> = run
                    .formats
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect();
                match &run.content {
                    RunContent::Text(text) => json!({"insert": text, "formats": formats}),
                    RunContent::Component(c) => {
                        json!({"component": self.component_json(*c), "formats": formats})
                    }
                }
            })
            .collect();
        let attrs: Map<String, Value> = slot
            .attributes()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        json!({"content": content, "attrs": attrs})
    }

    // === Internals ===

    fn alloc(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    fn adopt(&mut self, value: &LocalValue, parent: NodeId) {
        if let Some(child) = value.node() {
            self.parents.insert(child, parent);
        }
    }

    fn detach(&mut self, node: NodeId) {
        self.parents.remove(&node);
        self.detached.push(node);
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut Slot, ModelError> {
        if !self.slots.contains_key(&id) {
            return Err(self.kind_error(id, "slot"));
        }
        self.slots.get_mut(&id).ok_or(ModelError::UnknownNode(id))
    }

    fn kind_error(&self, id: NodeId, expected: &'static str) -> ModelError {
        if self.contains(id) {
            ModelError::WrongKind { node: id, expected }
        } else {
            ModelError::UnknownNode(id)
        }
    }

    fn notify(&mut self, notification: Notification) {
        if self.notifications.last() != Some(&notification) {
            self.notifications.push(notification);
        }
    }

    fn record(&mut self, origin: Origin, node: NodeId, op: ChangeOp) {
        let Origin::Local { record } = origin else {
            return;
        };
        if self.batch_selection.is_none() {
            self.batch_selection = Some(self.selection);
        }
        self.journal.push(ModelChange { node, record, op });
    }
}

fn check_offset(offset: usize, len: usize) -> Result<(), ModelError> {
    if offset > len {
        return Err(ModelError::OutOfBounds { offset, len });
    }
    Ok(())
}

fn with_retain(at: usize, action: ContentAction) -> Vec<ContentAction> {
    let mut actions = Vec::with_capacity(2);
    if at > 0 {
        actions.push(ContentAction::Retain {
            len: at,
            formats: None,
        });
    }
    actions.push(action);
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ReplayKind;

    const REMOTE: Origin = Origin::Replay(ReplayKind::Remote);

    fn schema(name: &str, content_type: ContentType) -> ComponentSchema {
        ComponentSchema {
            name: name.into(),
            content_type,
        }
    }

    fn all_content() -> Vec<ContentType> {
        vec![
            ContentType::Text,
            ContentType::InlineComponent,
            ContentType::BlockComponent,
        ]
    }

    /// Root component with a single slot in state key `body`.
    fn doc_with_body() -> (DocumentModel, NodeId) {
        let mut model = DocumentModel::new();
        let body = model.create_slot(all_content(), Backing::Sync);
        let state = model.build_state(StateInit::map([("body", StateInit::Slot(body))]));
        let root = model.create_component(
            &schema("root", ContentType::BlockComponent),
            Backing::Sync,
            state,
        );
        model.set_root(root).unwrap();
        (model, body)
    }

    #[test]
    fn test_local_insert_journals_change() {
        let (mut model, body) = doc_with_body();
        model
            .insert_text(Origin::LOCAL, body, 0, "hello", FormatMap::new())
            .unwrap();
        model
            .insert_text(Origin::LOCAL, body, 5, "!", FormatMap::new())
            .unwrap();

        let batch = model.take_journal();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(
            batch.changes[1].op,
            ChangeOp::Content(vec![
                ContentAction::Retain {
                    len: 5,
                    formats: None
                },
                ContentAction::InsertText {
                    text: "!".into(),
                    formats: FormatMap::new()
                },
            ])
        );
        assert!(!model.has_pending_changes());
    }

    #[test]
    fn test_replay_is_not_journaled() {
        let (mut model, body) = doc_with_body();
        model
            .insert_text(REMOTE, body, 0, "remote", FormatMap::new())
            .unwrap();
        assert_eq!(model.slot(body).unwrap().text(), "remote");
        assert!(model.take_journal().changes.is_empty());
        assert_eq!(
            model.take_notifications(),
            vec![Notification::ContentChanged(body)]
        );
    }

    #[test]
    fn test_untracked_edit_is_journaled_without_record() {
        let (mut model, body) = doc_with_body();
        model
            .insert_text(Origin::UNTRACKED, body, 0, "x", FormatMap::new())
            .unwrap();
        let batch = model.take_journal();
        assert!(!batch.changes[0].record);
    }

    #[test]
    fn test_local_out_of_bounds_rejected_replay_clamped() {
        let (mut model, body) = doc_with_body();
        let err = model
            .insert_text(Origin::LOCAL, body, 3, "x", FormatMap::new())
            .unwrap_err();
        assert_eq!(err, ModelError::OutOfBounds { offset: 3, len: 0 });

        model.insert_text(REMOTE, body, 3, "x", FormatMap::new()).unwrap();
        assert_eq!(model.slot(body).unwrap().text(), "x");
    }

    #[test]
    fn test_schema_violation() {
        let mut model = DocumentModel::new();
        let slot = model.create_slot(vec![ContentType::InlineComponent], Backing::Sync);
        let err = model
            .insert_text(Origin::LOCAL, slot, 0, "x", FormatMap::new())
            .unwrap_err();
        assert_eq!(err, ModelError::SchemaViolation(ContentType::Text));
    }

    #[test]
    fn test_selection_before_batch_is_captured() {
        let (mut model, body) = doc_with_body();
        let before = Selection::collapsed(SlotPosition::new(body, 0));
        model.set_selection(Some(before));
        model
            .insert_text(Origin::LOCAL, body, 0, "ab", FormatMap::new())
            .unwrap();
        model.set_selection(Some(Selection::collapsed(SlotPosition::new(body, 2))));

        let batch = model.take_journal();
        assert_eq!(batch.selection_before, Some(before));
    }

    #[test]
    fn test_deleted_component_swept() {
        let (mut model, body) = doc_with_body();
        let inner = model.create_slot(vec![ContentType::Text], Backing::Sync);
        let state = model.build_state(StateInit::map([("text", StateInit::Slot(inner))]));
        let image = model.create_component(
            &schema("image", ContentType::InlineComponent),
            Backing::Sync,
            state,
        );
        model
            .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
            .unwrap();
        assert_eq!(model.parent(image), Some(body));

        let removed = model.delete(Origin::LOCAL, body, 0, 1).unwrap();
        assert_eq!(removed, vec![image]);
        // still addressable until swept
        assert!(model.component(image).is_some());

        let freed = model.sweep();
        assert!(freed.contains(&image));
        assert!(freed.contains(&inner));
        assert!(model.component(image).is_none());
        assert!(model.slot(inner).is_none());
    }

    #[test]
    fn test_reinserted_component_survives_sweep() {
        let (mut model, body) = doc_with_body();
        let state = model.build_state(StateInit::empty_map());
        let image = model.create_component(
            &schema("image", ContentType::InlineComponent),
            Backing::Sync,
            state,
        );
        model
            .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
            .unwrap();
        model.delete(Origin::LOCAL, body, 0, 1).unwrap();
        model
            .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
            .unwrap();
        assert!(model.sweep().is_empty());
        assert!(model.component(image).is_some());
    }

    #[test]
    fn test_attach_twice_rejected() {
        let (mut model, body) = doc_with_body();
        let state = model.build_state(StateInit::empty_map());
        let image = model.create_component(
            &schema("image", ContentType::InlineComponent),
            Backing::Sync,
            state,
        );
        model
            .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
            .unwrap();
        let err = model
            .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
            .unwrap_err();
        assert_eq!(err, ModelError::AlreadyAttached(image));
    }

    #[test]
    fn test_map_set_replaces_and_detaches() {
        let (mut model, _) = doc_with_body();
        let map = model.create_map(Vec::new());
        let first = model.build_state(StateInit::list([StateInit::Scalar(1.into())]));
        model.map_set(Origin::LOCAL, map, "items", first.clone()).unwrap();
        model
            .map_set(Origin::LOCAL, map, "items", LocalValue::Scalar(2.into()))
            .unwrap();
        let freed = model.sweep();
        assert_eq!(freed, vec![first.node().unwrap()]);
    }

    #[test]
    fn test_reserved_key_rejected() {
        let (mut model, _) = doc_with_body();
        let map = model.create_map(Vec::new());
        let err = model
            .map_set(Origin::LOCAL, map, "$kind", LocalValue::Scalar(1.into()))
            .unwrap_err();
        assert_eq!(err, ModelError::ReservedKey("$kind".into()));
    }

    #[test]
    fn test_list_splice() {
        let (mut model, _) = doc_with_body();
        let list = model.create_list(Vec::new());
        let items = (0..3).map(|i| LocalValue::Scalar(i.into())).collect();
        model.list_splice(Origin::LOCAL, list, 0, 0, items).unwrap();
        model.list_splice(Origin::LOCAL, list, 1, 1, Vec::new()).unwrap();
        assert_eq!(
            model.to_json(&LocalValue::List(list)),
            serde_json::json!([0, 2])
        );
        assert!(model.list_splice(Origin::LOCAL, list, 3, 0, Vec::new()).is_err());
    }

    #[test]
    fn test_path_roundtrip_nested() {
        let (mut model, body) = doc_with_body();
        model
            .insert_text(Origin::LOCAL, body, 0, "abc", FormatMap::new())
            .unwrap();
        let caption = model.create_slot(vec![ContentType::Text], Backing::Sync);
        let state = model.build_state(StateInit::map([
            ("alt", StateInit::Scalar("x".into())),
            ("caption", StateInit::Slot(caption)),
        ]));
        let figure = model.create_component(
            &schema("figure", ContentType::InlineComponent),
            Backing::Sync,
            state,
        );
        model
            .insert_component(Origin::LOCAL, body, 2, figure, FormatMap::new())
            .unwrap();
        model
            .insert_text(Origin::LOCAL, caption, 0, "hi", FormatMap::new())
            .unwrap();

        let pos = SlotPosition::new(caption, 1);
        let path = model.path_of(pos).unwrap();
        assert_eq!(path, vec![0, 2, 0, 1]);
        assert_eq!(model.resolve_path(&path), Some(pos));

        let root_pos = SlotPosition::new(body, 3);
        assert_eq!(model.path_of(root_pos), Some(vec![0, 3]));
        assert_eq!(model.resolve_path(&[0, 99]), Some(SlotPosition::new(body, 4)));
    }

    #[test]
    fn test_sweep_drops_dangling_selection() {
        let (mut model, body) = doc_with_body();
        let caption = model.create_slot(vec![ContentType::Text], Backing::Sync);
        let state = model.build_state(StateInit::map([("caption", StateInit::Slot(caption))]));
        let figure = model.create_component(
            &schema("figure", ContentType::InlineComponent),
            Backing::Sync,
            state,
        );
        model
            .insert_component(Origin::LOCAL, body, 0, figure, FormatMap::new())
            .unwrap();
        model.set_selection(Some(Selection::collapsed(SlotPosition::new(caption, 0))));
        model.delete(REMOTE, body, 0, 1).unwrap();
        model.sweep();
        assert_eq!(model.selection(), None);
    }
}
