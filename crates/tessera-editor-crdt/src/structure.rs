//! Structural synchronization: component, state map and state list
//! conversion in both directions.
//!
//! Shared layout, all plain Loro containers:
//!
//! - slot: map `{$kind: "slot", type, schema, content, attrs, embeds}`; an
//!   async slot stores `{metadata, subdoc}` instead and keeps `content`,
//!   `attrs` and `embeds` as root containers of the sub-document
//! - component: map `{$kind: "component", name, type, state}`; an async
//!   component stores `{metadata, subdoc}` and keeps its state in the
//!   sub-document's `state` root map
//! - state map: map `{$kind: "map", ..entries}`
//! - state list: list
//!
//! Conversion recurses through slots, components and state, bounded by the
//! configured depth limit.

use loro::{
    Container, ContainerTrait, LoroList, LoroMap, LoroText, LoroValue, TextDelta, ValueOrContainer,
};
use serde_json::{Map, Value, json};
use smol_str::SmolStr;
use loro::event::ListDiffItem;
use tessera_editor_core::{
    Backing, ContentType, ListSplice, LocalValue, MapAction, ModelError, NodeId,
    RESERVED_KEY_PREFIX, ReplayKind, RunContent,
};

use crate::bridge::{SharedNode, SlotHandles};
use crate::content::{EMBED_STYLE, PLACEHOLDER_STYLE, apply_formats, normalize_placeholder};
use crate::convert::{json_to_loro, loro_str, loro_to_json, map_entries, read_json, read_str};
use crate::engine::CollabEngine;
use crate::error::SyncError;
use crate::loader::{SubModelLoad, SubModelTarget};
use crate::origin::ReplayContext;
use crate::root::{ROOT_MAP, RootId};

pub(crate) const KIND_KEY: &str = "$kind";
const KIND_SLOT: &str = "slot";
const KIND_COMPONENT: &str = "component";
const KIND_MAP: &str = "map";
const TYPE_KEY: &str = "type";
const TYPE_SYNC: &str = "sync";
const TYPE_ASYNC: &str = "async";
const SCHEMA_KEY: &str = "schema";
const CONTENT_KEY: &str = "content";
const ATTRS_KEY: &str = "attrs";
const EMBEDS_KEY: &str = "embeds";
const NAME_KEY: &str = "name";
const STATE_KEY: &str = "state";
const METADATA_KEY: &str = "metadata";
const SUBDOC_KEY: &str = "subdoc";

impl CollabEngine {
    // === Local to shared ===

    fn write_into_map(
        &mut self,
        root: RootId,
        parent: &LoroMap,
        key: &str,
        value: &LocalValue,
        depth: usize,
    ) -> Result<(), SyncError> {
        match value {
            LocalValue::Scalar(v) => {
                parent.insert(key, json_to_loro(v))?;
            }
            LocalValue::Slot(id) => {
                let map = parent.insert_container(key, LoroMap::new())?;
                self.slot_to_shared(root, &map, *id, depth)?;
            }
            LocalValue::Map(id) => {
                let map = parent.insert_container(key, LoroMap::new())?;
                self.map_to_shared(root, &map, *id, depth)?;
            }
            LocalValue::List(id) => {
                let list = parent.insert_container(key, LoroList::new())?;
                self.list_to_shared(root, &list, *id, depth)?;
            }
        }
        Ok(())
    }

    fn write_into_list(
        &mut self,
        root: RootId,
        parent: &LoroList,
        index: usize,
        value: &LocalValue,
        depth: usize,
    ) -> Result<(), SyncError> {
        match value {
            LocalValue::Scalar(v) => {
                parent.insert(index, json_to_loro(v))?;
            }
            LocalValue::Slot(id) => {
                let map = parent.insert_container(index, LoroMap::new())?;
                self.slot_to_shared(root, &map, *id, depth)?;
            }
            LocalValue::Map(id) => {
                let map = parent.insert_container(index, LoroMap::new())?;
                self.map_to_shared(root, &map, *id, depth)?;
            }
            LocalValue::List(id) => {
                let list = parent.insert_container(index, LoroList::new())?;
                self.list_to_shared(root, &list, *id, depth)?;
            }
        }
        Ok(())
    }

    fn slot_to_shared(
        &mut self,
        root: RootId,
        map: &LoroMap,
        id: NodeId,
        depth: usize,
    ) -> Result<(), SyncError> {
        self.check_depth(depth)?;
        let slot = self.model.slot(id).ok_or(ModelError::UnknownNode(id))?;
        let schema: Vec<LoroValue> = slot
            .schema()
            .iter()
            .map(|t| LoroValue::from(t.as_str()))
            .collect();
        let backing = slot.backing().clone();

        map.insert(KIND_KEY, KIND_SLOT)?;
        map.insert(SCHEMA_KEY, schema)?;
        let (slot_root, handles) = match &backing {
            Backing::Sync => {
                map.insert(TYPE_KEY, TYPE_SYNC)?;
                let handles = SlotHandles {
                    content: map.insert_container(CONTENT_KEY, LoroText::new())?,
                    attrs: map.insert_container(ATTRS_KEY, LoroMap::new())?,
                    embeds: map.insert_container(EMBEDS_KEY, LoroMap::new())?,
                };
                (root, handles)
            }
            Backing::Async { metadata } => {
                let loader = self
                    .loader
                    .as_mut()
                    .ok_or(SyncError::UnsupportedSubModel("slot"))?;
                let sub = loader.create_by_slot(metadata)?;
                map.insert(TYPE_KEY, TYPE_ASYNC)?;
                map.insert(METADATA_KEY, json_to_loro(metadata))?;
                map.insert(SUBDOC_KEY, sub.key.as_str())?;
                let handles = sub_slot_handles(&sub.doc);
                (self.add_sub_root(sub.key, sub.doc), handles)
            }
        };
        self.write_slot_body(slot_root, handles, id, depth)
    }

    fn write_slot_body(
        &mut self,
        root: RootId,
        handles: SlotHandles,
        id: NodeId,
        depth: usize,
    ) -> Result<(), SyncError> {
        let slot = self.model.slot(id).ok_or(ModelError::UnknownNode(id))?.clone();
        let mut pos = 0;
        for run in slot.runs() {
            match &run.content {
                RunContent::Text(text) => {
                    handles.content.insert_utf16(pos, text)?;
                    apply_formats(&handles.content, pos, run.len(), &run.formats)?;
                }
                RunContent::Component(component) => {
                    self.insert_embed(root, &handles, pos, *component, &run.formats, depth + 1)?;
                }
            }
            pos += run.len();
        }
        for (key, value) in slot.attributes() {
            handles.attrs.insert(key, json_to_loro(value))?;
        }
        normalize_placeholder(&handles.content)?;
        self.bridge.bind(id, root, SharedNode::Slot(handles));
        self.written.insert(id);
        Ok(())
    }

    /// Write a component's fields into `map` and bind it.
    pub(crate) fn component_to_shared(
        &mut self,
        root: RootId,
        map: &LoroMap,
        id: NodeId,
        embed_key: Option<SmolStr>,
        depth: usize,
    ) -> Result<(), SyncError> {
        self.check_depth(depth)?;
        let component = self
            .model
            .component(id)
            .ok_or(ModelError::UnknownNode(id))?
            .clone();
        map.insert(KIND_KEY, KIND_COMPONENT)?;
        map.insert(NAME_KEY, component.name())?;
        match component.backing() {
            Backing::Sync => {
                map.insert(TYPE_KEY, TYPE_SYNC)?;
                self.write_into_map(root, map, STATE_KEY, component.state(), depth + 1)?;
            }
            Backing::Async { metadata } => {
                let LocalValue::Map(state) = component.state() else {
                    return Err(SyncError::protocol(format!(
                        "async component {} must keep its state in a map",
                        id
                    )));
                };
                let loader = self
                    .loader
                    .as_mut()
                    .ok_or(SyncError::UnsupportedSubModel("component"))?;
                let sub = loader.create_by_component(component.name(), metadata)?;
                map.insert(TYPE_KEY, TYPE_ASYNC)?;
                map.insert(METADATA_KEY, json_to_loro(metadata))?;
                map.insert(SUBDOC_KEY, sub.key.as_str())?;
                let state_map = sub.doc.get_map(STATE_KEY);
                let sub_root = self.add_sub_root(sub.key, sub.doc);
                self.map_to_shared(sub_root, &state_map, *state, depth + 1)?;
            }
        }
        self.bridge
            .bind(id, root, SharedNode::Component { map: map.clone(), embed_key });
        self.written.insert(id);
        Ok(())
    }

    fn map_to_shared(
        &mut self,
        root: RootId,
        shared: &LoroMap,
        id: NodeId,
        depth: usize,
    ) -> Result<(), SyncError> {
        self.check_depth(depth)?;
        let entries: Vec<(SmolStr, LocalValue)> = self
            .model
            .map(id)
            .ok_or(ModelError::UnknownNode(id))?
            .entries()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        shared.insert(KIND_KEY, KIND_MAP)?;
        for (key, value) in &entries {
            self.write_into_map(root, shared, key, value, depth + 1)?;
        }
        self.bridge.bind(id, root, SharedNode::Map(shared.clone()));
        self.written.insert(id);
        Ok(())
    }

    fn list_to_shared(
        &mut self,
        root: RootId,
        shared: &LoroList,
        id: NodeId,
        depth: usize,
    ) -> Result<(), SyncError> {
        self.check_depth(depth)?;
        let items = self
            .model
            .list(id)
            .ok_or(ModelError::UnknownNode(id))?
            .items()
            .to_vec();
        for (index, value) in items.iter().enumerate() {
            self.write_into_list(root, shared, index, value, depth + 1)?;
        }
        self.bridge.bind(id, root, SharedNode::List(shared.clone()));
        self.written.insert(id);
        Ok(())
    }

    pub(crate) fn push_map(
        &mut self,
        root: RootId,
        node: NodeId,
        shared: &LoroMap,
        action: &MapAction,
    ) -> Result<(), SyncError> {
        match action {
            MapAction::Set { key, value } => {
                let depth = self.depth_of(node) + 1;
                self.write_into_map(root, shared, key, value, depth)
            }
            MapAction::Delete { key } => {
                shared.delete(key)?;
                Ok(())
            }
        }
    }

    pub(crate) fn push_list(
        &mut self,
        root: RootId,
        node: NodeId,
        shared: &LoroList,
        splice: &ListSplice,
    ) -> Result<(), SyncError> {
        let index = splice.index.min(shared.len());
        let delete = splice.delete.min(shared.len() - index);
        if delete > 0 {
            shared.delete(index, delete)?;
        }
        let depth = self.depth_of(node) + 1;
        for (i, value) in splice.insert.iter().enumerate() {
            self.write_into_list(root, shared, index + i, value, depth)?;
        }
        Ok(())
    }

    // === Shared to local ===

    fn value_from_shared(
        &mut self,
        root: RootId,
        value: ValueOrContainer,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<LocalValue, SyncError> {
        match value {
            ValueOrContainer::Value(v) => Ok(LocalValue::Scalar(loro_to_json(&v))),
            ValueOrContainer::Container(Container::Map(map)) => {
                match read_str(&map, KIND_KEY).as_deref() {
                    Some(KIND_SLOT) => Ok(LocalValue::Slot(
                        self.slot_from_shared(root, &map, ctx, depth)?,
                    )),
                    Some(KIND_COMPONENT) => Err(SyncError::protocol(
                        "component stored directly in state",
                    )),
                    _ => Ok(LocalValue::Map(self.map_from_shared(root, &map, ctx, depth)?)),
                }
            }
            ValueOrContainer::Container(Container::List(list)) => {
                Ok(LocalValue::List(self.list_from_shared(root, &list, ctx, depth)?))
            }
            ValueOrContainer::Container(_) => Err(SyncError::protocol(
                "unsupported container kind in state",
            )),
        }
    }

    fn slot_from_shared(
        &mut self,
        root: RootId,
        map: &LoroMap,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<NodeId, SyncError> {
        self.check_depth(depth)?;
        ctx.mark_fresh(map.id());
        let schema: Vec<ContentType> = match map.get(SCHEMA_KEY) {
            Some(ValueOrContainer::Value(LoroValue::List(items))) => items
                .iter()
                .filter_map(|v| loro_str(v).and_then(|s| ContentType::parse(&s)))
                .collect(),
            _ => vec![ContentType::Text],
        };

        if read_str(map, TYPE_KEY).as_deref() == Some(TYPE_ASYNC) {
            let metadata = read_json(map, METADATA_KEY);
            let key = read_str(map, SUBDOC_KEY)
                .ok_or_else(|| SyncError::protocol("async slot without a sub-document key"))?;
            let id = self.model.create_slot(
                schema,
                Backing::Async {
                    metadata: metadata.clone(),
                },
            );
            let target = SubModelTarget::Slot(id);
            if let Err(e) = self.request_sub_model(key.into(), target, &metadata, None, depth, ctx)
            {
                self.discard(&LocalValue::Slot(id));
                return Err(e);
            }
            return Ok(id);
        }

        let handles = match (
            map.get(CONTENT_KEY),
            map.get(ATTRS_KEY),
            map.get(EMBEDS_KEY),
        ) {
            (
                Some(ValueOrContainer::Container(Container::Text(content))),
                Some(ValueOrContainer::Container(Container::Map(attrs))),
                Some(ValueOrContainer::Container(Container::Map(embeds))),
            ) => SlotHandles {
                content,
                attrs,
                embeds,
            },
            _ => return Err(SyncError::protocol("slot map is missing its containers")),
        };
        let id = self.model.create_slot(schema, Backing::Sync);
        if let Err(e) = self.read_slot_body(root, id, handles, ctx, depth) {
            self.discard(&LocalValue::Slot(id));
            return Err(e);
        }
        Ok(id)
    }

    /// Fill an empty local slot from its shared containers and bind it.
    fn read_slot_body(
        &mut self,
        root: RootId,
        id: NodeId,
        handles: SlotHandles,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<(), SyncError> {
        ctx.mark_fresh(handles.content.id());
        ctx.mark_fresh(handles.attrs.id());
        ctx.mark_fresh(handles.embeds.id());
        self.bridge.bind(id, root, SharedNode::Slot(handles.clone()));

        let delta = handles.content.to_delta();
        self.replay_text(root, id, &handles, &delta, ctx, depth)?;
        let attrs: Vec<(String, Option<ValueOrContainer>)> = map_entries(&handles.attrs)
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        self.replay_attributes(id, &attrs, ctx)
    }

    /// Build a local component from its shared map and bind it.
    pub(crate) fn component_from_shared(
        &mut self,
        root: RootId,
        map: &LoroMap,
        embed_key: Option<SmolStr>,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<NodeId, SyncError> {
        self.check_depth(depth)?;
        let name = read_str(map, NAME_KEY)
            .ok_or_else(|| SyncError::protocol("component map without a name"))?;
        let schema = self
            .registry
            .lookup_component(&name)
            .ok_or_else(|| SyncError::UnknownComponent(name.as_str().into()))?;
        ctx.mark_fresh(map.id());

        if read_str(map, TYPE_KEY).as_deref() == Some(TYPE_ASYNC) {
            let metadata = read_json(map, METADATA_KEY);
            let key = read_str(map, SUBDOC_KEY).ok_or_else(|| {
                SyncError::protocol("async component without a sub-document key")
            })?;
            let state = self.model.create_map(Vec::new());
            let id = self.model.create_component(
                &schema,
                Backing::Async {
                    metadata: metadata.clone(),
                },
                LocalValue::Map(state),
            );
            self.bridge.bind(
                id,
                root,
                SharedNode::Component {
                    map: map.clone(),
                    embed_key,
                },
            );
            let target = SubModelTarget::Component {
                component: id,
                state,
            };
            if let Err(e) =
                self.request_sub_model(key.into(), target, &metadata, Some(&name), depth, ctx)
            {
                self.discard_node(id);
                return Err(e);
            }
            return Ok(id);
        }

        let state = match map.get(STATE_KEY) {
            Some(value) => self.value_from_shared(root, value, ctx, depth + 1)?,
            None => LocalValue::Scalar(Value::Null),
        };
        let id = self.model.create_component(&schema, Backing::Sync, state);
        self.bridge.bind(
            id,
            root,
            SharedNode::Component {
                map: map.clone(),
                embed_key,
            },
        );
        Ok(id)
    }

    fn map_from_shared(
        &mut self,
        root: RootId,
        map: &LoroMap,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<NodeId, SyncError> {
        self.check_depth(depth)?;
        ctx.mark_fresh(map.id());
        let mut entries: Vec<(SmolStr, LocalValue)> = Vec::new();
        for (key, value) in map_entries(map) {
            if key.starts_with(RESERVED_KEY_PREFIX) {
                continue;
            }
            match self.value_from_shared(root, value, ctx, depth + 1) {
                Ok(value) => entries.push((key.into(), value)),
                Err(e) => {
                    for (_, built) in &entries {
                        self.discard(built);
                    }
                    return Err(e);
                }
            }
        }
        let id = self.model.create_map(entries);
        self.bridge.bind(id, root, SharedNode::Map(map.clone()));
        Ok(id)
    }

    fn list_from_shared(
        &mut self,
        root: RootId,
        list: &LoroList,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<NodeId, SyncError> {
        self.check_depth(depth)?;
        ctx.mark_fresh(list.id());
        let mut items = Vec::with_capacity(list.len());
        for index in 0..list.len() {
            let Some(value) = list.get(index) else {
                continue;
            };
            match self.value_from_shared(root, value, ctx, depth + 1) {
                Ok(value) => items.push(value),
                Err(e) => {
                    for built in &items {
                        self.discard(built);
                    }
                    return Err(e);
                }
            }
        }
        let id = self.model.create_list(items);
        self.bridge.bind(id, root, SharedNode::List(list.clone()));
        Ok(id)
    }

    /// Apply shared map changes to a local state map.
    pub(crate) fn replay_map(
        &mut self,
        root: RootId,
        node: NodeId,
        entries: &[(String, Option<ValueOrContainer>)],
        ctx: &mut ReplayContext,
    ) -> Result<(), SyncError> {
        let origin = ctx.origin();
        for (key, value) in entries {
            if key.starts_with(RESERVED_KEY_PREFIX) {
                continue;
            }
            match value {
                None => self.model.map_delete(origin, node, key)?,
                Some(value) => {
                    let depth = self.depth_of(node) + 1;
                    let value = self.value_from_shared(root, value.clone(), ctx, depth)?;
                    self.model.map_set(origin, node, key.as_str(), value)?;
                }
            }
        }
        Ok(())
    }

    /// Apply a shared list delta to a local state list.
    pub(crate) fn replay_list(
        &mut self,
        root: RootId,
        node: NodeId,
        items: &[ListDiffItem],
        ctx: &mut ReplayContext,
    ) -> Result<(), SyncError> {
        let origin = ctx.origin();
        let mut index = 0;
        for item in items {
            match item {
                ListDiffItem::Retain { retain } => index += retain,
                ListDiffItem::Delete { delete } => {
                    self.model
                        .list_splice(origin, node, index, *delete, Vec::new())?;
                }
                ListDiffItem::Insert { insert, .. } => {
                    let depth = self.depth_of(node) + 1;
                    let mut values = Vec::with_capacity(insert.len());
                    for value in insert {
                        match self.value_from_shared(root, value.clone(), ctx, depth) {
                            Ok(value) => values.push(value),
                            Err(e) => {
                                for built in &values {
                                    self.discard(built);
                                }
                                return Err(e);
                            }
                        }
                    }
                    let count = values.len();
                    self.model.list_splice(origin, node, index, 0, values)?;
                    index += count;
                }
            }
        }
        Ok(())
    }

    // === Sub-models ===

    fn request_sub_model(
        &mut self,
        key: SmolStr,
        target: SubModelTarget,
        metadata: &Value,
        component: Option<&str>,
        depth: usize,
        ctx: &mut ReplayContext,
    ) -> Result<(), SyncError> {
        if let Some(root) = self.roots.by_key(&key) {
            return self.attach_sub_model(root, target, depth, ctx);
        }
        let what = if component.is_some() { "component" } else { "slot" };
        let loader = self
            .loader
            .as_mut()
            .ok_or(SyncError::UnsupportedSubModel(what))?;
        let load = match component {
            Some(name) => loader.load_by_component(&key, name, metadata)?,
            None => loader.load_by_slot(&key, metadata)?,
        };
        match load {
            SubModelLoad::Ready(doc) => {
                let root = self.add_sub_root(key, doc);
                self.attach_sub_model(root, target, depth, ctx)
            }
            SubModelLoad::Pending => {
                tracing::debug!(%key, node = %target.node(), "sub-model pending");
                self.pending_loads.insert(key, target);
                Ok(())
            }
        }
    }

    /// Fill the local node waiting on a sub-document. `depth` is the
    /// nesting depth of that node.
    fn attach_sub_model(
        &mut self,
        root: RootId,
        target: SubModelTarget,
        depth: usize,
        ctx: &mut ReplayContext,
    ) -> Result<(), SyncError> {
        let doc = self
            .roots
            .get(root)
            .ok_or_else(|| SyncError::protocol(format!("{} missing", root)))?
            .doc()
            .clone();
        match target {
            SubModelTarget::Slot(slot) => {
                self.read_slot_body(root, slot, sub_slot_handles(&doc), ctx, depth)
            }
            SubModelTarget::Component { state, .. } => {
                let shared = doc.get_map(STATE_KEY);
                ctx.mark_fresh(shared.id());
                for (key, value) in map_entries(&shared) {
                    if key.starts_with(RESERVED_KEY_PREFIX) {
                        continue;
                    }
                    let value = self.value_from_shared(root, value, ctx, depth + 2)?;
                    self.model.map_set(ctx.origin(), state, key, value)?;
                }
                self.bridge.bind(state, root, SharedNode::Map(shared));
                Ok(())
            }
        }
    }

    /// Hand over a sub-document the loader answered `Pending` for.
    pub fn resolve_sub_model(&mut self, key: &str, doc: loro::LoroDoc) -> Result<(), SyncError> {
        self.flush()?;
        let target = self
            .pending_loads
            .remove(key)
            .ok_or_else(|| SyncError::UnknownRoot(key.into()))?;
        let root = self.add_sub_root(key.into(), doc);
        let depth = self.depth_of(target.node());
        let mut ctx = ReplayContext::new(ReplayKind::Remote);
        let result = self.attach_sub_model(root, target, depth, &mut ctx);
        self.sweep();
        result
    }

    // === Snapshot ===

    /// JSON snapshot of the shared document in the same shape as
    /// [`DocumentModel::component_json`](tessera_editor_core::DocumentModel::component_json).
    pub fn shared_json(&self) -> Value {
        let map = self.doc().get_map(ROOT_MAP);
        if map.is_empty() {
            return Value::Null;
        }
        self.component_json(&map)
    }

    fn component_json(&self, map: &LoroMap) -> Value {
        let name = read_str(map, NAME_KEY).unwrap_or_default();
        let state = if read_str(map, TYPE_KEY).as_deref() == Some(TYPE_ASYNC) {
            match self.sub_doc_of(map) {
                Some(doc) => self.map_json(&doc.get_map(STATE_KEY)),
                None => json!({}),
            }
        } else {
            match map.get(STATE_KEY) {
                Some(value) => self.value_json(value),
                None => Value::Null,
            }
        };
        json!({"name": name, "state": state})
    }

    fn value_json(&self, value: ValueOrContainer) -> Value {
        match value {
            ValueOrContainer::Value(v) => loro_to_json(&v),
            ValueOrContainer::Container(Container::Map(map)) => {
                match read_str(&map, KIND_KEY).as_deref() {
                    Some(KIND_SLOT) => self.slot_json(&map),
                    Some(KIND_COMPONENT) => self.component_json(&map),
                    _ => self.map_json(&map),
                }
            }
            ValueOrContainer::Container(Container::List(list)) => Value::Array(
                (0..list.len())
                    .filter_map(|i| list.get(i))
                    .map(|v| self.value_json(v))
                    .collect(),
            ),
            ValueOrContainer::Container(_) => Value::Null,
        }
    }

    fn map_json(&self, map: &LoroMap) -> Value {
        Value::Object(
            map_entries(map)
                .into_iter()
                .filter(|(k, _)| !k.starts_with(RESERVED_KEY_PREFIX))
                .map(|(k, v)| (k, self.value_json(v)))
                .collect(),
        )
    }

    fn slot_json(&self, map: &LoroMap) -> Value {
        let handles = if read_str(map, TYPE_KEY).as_deref() == Some(TYPE_ASYNC) {
            match self.sub_doc_of(map) {
                Some(doc) => sub_slot_handles(doc),
                None => return json!({"content": [], "attrs": {}}),
            }
        } else {
            match (map.get(CONTENT_KEY), map.get(ATTRS_KEY), map.get(EMBEDS_KEY)) {
                (
                    Some(ValueOrContainer::Container(Container::Text(content))),
                    Some(ValueOrContainer::Container(Container::Map(attrs))),
                    Some(ValueOrContainer::Container(Container::Map(embeds))),
                ) => SlotHandles {
                    content,
                    attrs,
                    embeds,
                },
                _ => return Value::Null,
            }
        };

        let mut content: Vec<(Option<Value>, String, Map<String, Value>)> = Vec::new();
        for delta in handles.content.to_delta() {
            let TextDelta::Insert { insert, attributes } = delta else {
                continue;
            };
            let attributes = attributes.unwrap_or_default();
            if attributes.contains_key(PLACEHOLDER_STYLE) {
                continue;
            }
            let mut formats = Map::new();
            for (key, value) in &attributes {
                if key != EMBED_STYLE && !matches!(value, LoroValue::Null) {
                    formats.insert(key.clone(), loro_to_json(value));
                }
            }
            if let Some(key) = attributes.get(EMBED_STYLE).and_then(loro_str) {
                let component = match handles.embeds.get(&key) {
                    Some(ValueOrContainer::Container(Container::Map(m))) => self.component_json(&m),
                    _ => Value::Null,
                };
                content.push((Some(component), String::new(), formats));
                continue;
            }
            if insert.is_empty() {
                continue;
            }
            if let Some((None, text, previous)) = content.last_mut() {
                if *previous == formats {
                    text.push_str(&insert);
                    continue;
                }
            }
            content.push((None, insert, formats));
        }
        let content: Vec<Value> = content
            .into_iter()
            .map(|(component, text, formats)| match component {
                Some(component) => json!({"component": component, "formats": formats}),
                None => json!({"insert": text, "formats": formats}),
            })
            .collect();
        let attrs: Map<String, Value> = map_entries(&handles.attrs)
            .into_iter()
            .filter_map(|(k, v)| match v {
                ValueOrContainer::Value(v) => Some((k, loro_to_json(&v))),
                ValueOrContainer::Container(_) => None,
            })
            .collect();
        json!({"content": content, "attrs": attrs})
    }

    fn sub_doc_of(&self, map: &LoroMap) -> Option<&loro::LoroDoc> {
        self.sub_doc(&read_str(map, SUBDOC_KEY)?)
    }
}

fn sub_slot_handles(doc: &loro::LoroDoc) -> SlotHandles {
    SlotHandles {
        content: doc.get_text(CONTENT_KEY),
        attrs: doc.get_map(ATTRS_KEY),
        embeds: doc.get_map(EMBEDS_KEY),
    }
}
