//! Slot content synchronization.
//!
//! A slot's text lives in a `LoroText`. Embedded components are a single
//! U+FFFC character carrying the `$embed` style, whose value is the key of
//! the component's map in the slot's embed map. A slot with no content holds
//! exactly one zero-width placeholder, marked with the `$placeholder` style,
//! so the text stays anchorable. Local offsets never count it.
//!
//! Local offsets and shared edits use UTF-16 code units. Loro reports text
//! deltas and cursor positions in Unicode scalar values, so replay and
//! anchoring convert by walking the shared text.

use std::collections::HashMap;

use loro::{ContainerTrait, LoroMap, LoroText, LoroValue, TextDelta, ValueOrContainer};
use tessera_editor_core::{ContentAction, FormatMap, NodeId, OBJECT_REPLACEMENT, utf16_len};

use crate::bridge::{Binding, Role, SharedNode, SlotHandles};
use crate::config::DeletedItem;
use crate::convert::{json_to_loro, loro_str, loro_to_json};
use crate::engine::CollabEngine;
use crate::error::SyncError;
use crate::origin::ReplayContext;
use crate::root::RootId;

/// Stands in for the content of an empty slot.
pub const PLACEHOLDER: char = '\u{200B}';
/// Style key linking an embed character to its component map.
pub const EMBED_STYLE: &str = "$embed";
/// Style key marking the placeholder. A `U+200B` without it is content.
pub const PLACEHOLDER_STYLE: &str = "$placeholder";

/// One character of a slot's shared text.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SharedChar {
    pub ch: char,
    pub placeholder: bool,
}

/// Characters of a shared text with their placeholder flag.
pub(crate) fn shared_chars(text: &LoroText) -> Vec<SharedChar> {
    let mut out = Vec::new();
    for delta in text.to_delta() {
        if let TextDelta::Insert { insert, attributes } = delta {
            let placeholder = attributes.as_ref().is_some_and(is_placeholder_style);
            out.extend(insert.chars().map(|ch| SharedChar { ch, placeholder }));
        }
    }
    out
}

fn is_placeholder_style<S: std::hash::BuildHasher>(
    attributes: &HashMap<String, LoroValue, S>,
) -> bool {
    matches!(attributes.get(PLACEHOLDER_STYLE), Some(LoroValue::Bool(true)))
}

impl CollabEngine {
    /// Replay one local content edit against the slot's shared text.
    pub(crate) fn push_content(
        &mut self,
        root: RootId,
        slot: NodeId,
        handles: &SlotHandles,
        actions: &[ContentAction],
    ) -> Result<(), SyncError> {
        let content = &handles.content;
        normalize_placeholder(content)?;
        let mut pos = 0usize;
        for action in actions {
            match action {
                ContentAction::Retain { len, formats } => {
                    if let Some(formats) = formats {
                        apply_formats(content, pos, *len, formats)?;
                    }
                    pos += len;
                }
                ContentAction::InsertText { text, formats } => {
                    let at = pos.min(content.len_utf16());
                    let len = utf16_len(text);
                    content.insert_utf16(at, text)?;
                    set_formats_exact(content, at, len, formats)?;
                    pos = at + len;
                }
                ContentAction::InsertComponent { component, formats } => {
                    let at = pos.min(content.len_utf16());
                    let depth = self.depth_of(slot) + 1;
                    self.insert_embed(root, handles, at, *component, formats, depth)?;
                    pos = at + 1;
                }
                ContentAction::Delete { len, removed } => {
                    self.release_embeds(handles, removed)?;
                    let at = pos.min(content.len_utf16());
                    let len = (*len).min(content.len_utf16() - at);
                    if len > 0 {
                        content.delete_utf16(at, len)?;
                    }
                }
                ContentAction::SetAttribute { key, value } => {
                    handles.attrs.insert(key, json_to_loro(value))?;
                }
                ContentAction::RemoveAttribute { key } => {
                    handles.attrs.delete(key)?;
                }
            }
        }
        normalize_placeholder(content)
    }

    /// Write a component into the slot's embed map and insert its
    /// replacement character at `at`.
    pub(crate) fn insert_embed(
        &mut self,
        root: RootId,
        handles: &SlotHandles,
        at: usize,
        component: NodeId,
        formats: &FormatMap,
        depth: usize,
    ) -> Result<(), SyncError> {
        let key = self
            .roots
            .get_mut(root)
            .ok_or_else(|| SyncError::protocol(format!("{} missing", root)))?
            .next_embed_key();
        let map = handles
            .embeds
            .insert_container(key.as_str(), LoroMap::new())?;
        self.component_to_shared(root, &map, component, Some(key.clone()), depth)?;

        let content = &handles.content;
        content.insert_utf16(at, OBJECT_REPLACEMENT.encode_utf8(&mut [0; 4]))?;
        set_formats_exact(content, at, 1, formats)?;
        content.mark_utf16(at..at + 1, EMBED_STYLE, key.as_str())?;
        Ok(())
    }

    /// Drop the shared maps of deleted embeds the host wants gone. Others are
    /// kept so an undo on any peer can bring them back.
    fn release_embeds(&self, handles: &SlotHandles, removed: &[NodeId]) -> Result<(), SyncError> {
        for &component in removed {
            let Some(Binding {
                node:
                    SharedNode::Component {
                        embed_key: Some(key),
                        ..
                    },
                ..
            }) = self.bridge.lookup_local(component)
            else {
                continue;
            };
            let name = self
                .model
                .component(component)
                .map(|c| c.name())
                .unwrap_or_default();
            if self.filters.drops_deleted(&DeletedItem { component, name }) {
                tracing::debug!(%component, %key, "dropping deleted embed");
                handles.embeds.delete(key)?;
            }
        }
        Ok(())
    }

    /// Replay a shared text delta into the local slot.
    ///
    /// Delta offsets are Unicode scalar values and count placeholders; local
    /// offsets are UTF-16 units of visible content. Retained and inserted
    /// ranges are read from the current shared text. Deleted ranges are
    /// measured in the local slot, which still holds them, after accounting
    /// for deleted placeholders by comparing placeholder counts before and
    /// after the change.
    pub(crate) fn replay_text(
        &mut self,
        root: RootId,
        slot: NodeId,
        handles: &SlotHandles,
        deltas: &[TextDelta],
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<(), SyncError> {
        let chars = shared_chars(&handles.content);
        let old_local_chars = self
            .model
            .slot(slot)
            .map(|s| s.text().chars().count())
            .unwrap_or_default();

        let mut inserted = 0usize;
        let mut inserted_placeholders = 0usize;
        let mut deleted = 0usize;
        for delta in deltas {
            match delta {
                TextDelta::Insert { insert, attributes } => {
                    let count = insert.chars().count();
                    inserted += count;
                    if attributes.as_ref().is_some_and(is_placeholder_style) {
                        inserted_placeholders += count;
                    }
                }
                TextDelta::Delete { delete } => deleted += delete,
                _ => {}
            }
        }
        let old_len = (chars.len() + deleted).saturating_sub(inserted);
        let old_placeholders = old_len.saturating_sub(old_local_chars);
        let new_placeholders = chars.iter().filter(|c| c.placeholder).count();
        let mut placeholder_budget =
            (old_placeholders + inserted_placeholders).saturating_sub(new_placeholders);

        let origin = ctx.origin();
        let mut shared_pos = 0usize;
        let mut local_pos = 0usize;
        for delta in deltas {
            match delta {
                TextDelta::Retain { retain, attributes } => {
                    let start = shared_pos.min(chars.len());
                    let end = (shared_pos + retain).min(chars.len());
                    let real = visible_units(&chars[start..end]);
                    if let Some(attributes) = attributes {
                        let formats = self.known_formats(attributes);
                        if real > 0 && !formats.is_empty() {
                            self.model.format(origin, slot, local_pos, real, formats)?;
                        }
                    }
                    shared_pos += retain;
                    local_pos += real;
                }
                TextDelta::Insert { insert, attributes } => {
                    let count = insert.chars().count();
                    shared_pos += count;
                    if attributes.as_ref().is_some_and(is_placeholder_style) {
                        continue;
                    }
                    let formats = attributes
                        .as_ref()
                        .map(|a| self.known_formats(a))
                        .unwrap_or_default();
                    let embed = attributes
                        .as_ref()
                        .and_then(|a| a.get(EMBED_STYLE))
                        .and_then(loro_str);
                    let at = local_pos.min(self.model.slot_len(slot));
                    if let Some(key) = embed {
                        let component = self.embed_from_shared(root, handles, &key, ctx, depth + 1)?;
                        self.model
                            .insert_component(origin, slot, at, component, formats)?;
                        if ctx.adjusts_selection() {
                            self.model.shift_selection_for_insert(slot, at, 1);
                        }
                        local_pos = at + 1;
                    } else {
                        let len = utf16_len(insert);
                        if len > 0 {
                            self.model.insert_text(origin, slot, at, insert, formats)?;
                            if ctx.adjusts_selection() {
                                self.model.shift_selection_for_insert(slot, at, len);
                            }
                        }
                        local_pos = at + len;
                    }
                }
                TextDelta::Delete { delete } => {
                    let skipped = placeholder_budget.min(*delete);
                    placeholder_budget -= skipped;
                    let at = local_pos.min(self.model.slot_len(slot));
                    let len = self
                        .model
                        .slot(slot)
                        .map(|s| units_after(&s.text(), at, delete - skipped))
                        .unwrap_or_default();
                    if len > 0 {
                        self.model.delete(origin, slot, at, len)?;
                        if ctx.adjusts_selection() {
                            self.model.shift_selection_for_delete(slot, at, len);
                        }
                    }
                }
                #[allow(unreachable_patterns)]
                _ => {
                    return Err(SyncError::protocol(format!(
                        "unsupported text delta on slot {}",
                        slot
                    )));
                }
            }
        }
        Ok(())
    }

    /// Local component for an embed key, reusing a bound component that is
    /// currently detached (a delete being undone within the same replay).
    fn embed_from_shared(
        &mut self,
        root: RootId,
        handles: &SlotHandles,
        key: &str,
        ctx: &mut ReplayContext,
        depth: usize,
    ) -> Result<NodeId, SyncError> {
        let Some(ValueOrContainer::Container(loro::Container::Map(map))) = handles.embeds.get(key)
        else {
            return Err(SyncError::protocol(format!(
                "embed `{}` has no component map",
                key
            )));
        };
        if let Some((node, Role::Component)) = self.bridge.lookup_shared(root, &map.id()) {
            if self.model.component(node).is_some() && self.model.parent(node).is_none() {
                return Ok(node);
            }
        }
        self.component_from_shared(root, &map, Some(key.into()), ctx, depth)
    }

    /// Shared format attributes the local registry knows, as local formats.
    /// `Null` values mean the format was removed.
    fn known_formats(&self, attributes: &HashMap<String, LoroValue, impl std::hash::BuildHasher>) -> FormatMap {
        attributes
            .iter()
            .filter(|(key, _)| key.as_str() != EMBED_STYLE && self.registry.has_formatter(key))
            .map(|(key, value)| (key.as_str().into(), loro_to_json(value)))
            .collect()
    }

    /// Apply shared attribute changes to a local slot, dropping unknown keys.
    pub(crate) fn replay_attributes(
        &mut self,
        slot: NodeId,
        entries: &[(String, Option<ValueOrContainer>)],
        ctx: &ReplayContext,
    ) -> Result<(), SyncError> {
        for (key, value) in entries {
            if !self.registry.has_attribute(key) {
                tracing::trace!(%key, "dropping unknown attribute");
                continue;
            }
            match value {
                None => self.model.remove_attribute(ctx.origin(), slot, key)?,
                Some(ValueOrContainer::Value(v)) => {
                    self.model
                        .set_attribute(ctx.origin(), slot, key.as_str(), loro_to_json(v))?
                }
                Some(ValueOrContainer::Container(_)) => {
                    tracing::warn!(%key, "ignoring container stored as a slot attribute")
                }
            }
        }
        Ok(())
    }
}

/// Keep the placeholder only while the text has no real content.
pub(crate) fn normalize_placeholder(text: &LoroText) -> Result<(), SyncError> {
    let chars = shared_chars(text);
    if chars.iter().any(|c| !c.placeholder) {
        let mut units = 0;
        let mut positions = Vec::new();
        for c in &chars {
            if c.placeholder {
                positions.push(units);
            }
            units += c.ch.len_utf16();
        }
        for at in positions.into_iter().rev() {
            text.delete_utf16(at, 1)?;
        }
    } else if chars.is_empty() {
        text.insert_utf16(0, PLACEHOLDER.encode_utf8(&mut [0; 4]))?;
        text.mark_utf16(0..1, PLACEHOLDER_STYLE, true)?;
    } else if chars.len() > 1 {
        text.delete_utf16(1, chars.len() - 1)?;
    }
    Ok(())
}

/// Apply local formats to a shared range. `Null` removes the style.
pub(crate) fn apply_formats(
    text: &LoroText,
    at: usize,
    len: usize,
    formats: &FormatMap,
) -> Result<(), SyncError> {
    let end = (at + len).min(text.len_utf16());
    if at >= end {
        return Ok(());
    }
    for (key, value) in formats {
        if key.as_str() == EMBED_STYLE || key.as_str() == PLACEHOLDER_STYLE {
            continue;
        }
        if value.is_null() {
            text.unmark_utf16(at..end, key)?;
        } else {
            text.mark_utf16(at..end, key, json_to_loro(value))?;
        }
    }
    Ok(())
}

/// Make freshly inserted text carry exactly `formats`, removing any style
/// it inherited from a surrounding range.
fn set_formats_exact(
    text: &LoroText,
    at: usize,
    len: usize,
    formats: &FormatMap,
) -> Result<(), SyncError> {
    if len == 0 {
        return Ok(());
    }
    for key in styles_at(text, at) {
        if !formats.contains_key(key.as_str()) {
            text.unmark_utf16(at..at + len, &key)?;
        }
    }
    apply_formats(text, at, len, formats)
}

/// Style keys on the character at UTF-16 offset `pos`.
fn styles_at(text: &LoroText, pos: usize) -> Vec<String> {
    let mut offset = 0;
    for delta in text.to_delta() {
        if let TextDelta::Insert { insert, attributes } = delta {
            let len = utf16_len(&insert);
            if pos < offset + len {
                return attributes
                    .map(|a| a.into_iter().map(|(k, _)| k).collect())
                    .unwrap_or_default();
            }
            offset += len;
        }
    }
    Vec::new()
}

/// UTF-16 length of the visible characters in `chars`.
fn visible_units(chars: &[SharedChar]) -> usize {
    chars
        .iter()
        .filter(|c| !c.placeholder)
        .map(|c| c.ch.len_utf16())
        .sum()
}

/// UTF-16 length of the `count` characters starting at unit offset `at`.
fn units_after(text: &str, at: usize, count: usize) -> usize {
    let mut seen = 0;
    let mut units = 0;
    let mut taken = 0;
    for c in text.chars() {
        if taken == count {
            break;
        }
        if seen >= at {
            units += c.len_utf16();
            taken += 1;
        }
        seen += c.len_utf16();
    }
    units
}

/// Shared index, in Unicode scalar values, of the visible position `local`
/// given in UTF-16 units.
pub(crate) fn shared_offset(text: &LoroText, local: usize) -> usize {
    let chars = shared_chars(text);
    let mut seen = 0;
    for (i, c) in chars.iter().enumerate() {
        if c.placeholder {
            continue;
        }
        if seen >= local {
            return i;
        }
        seen += c.ch.len_utf16();
    }
    chars.len()
}

/// Local UTF-16 offset of a shared index: visible units before it.
pub(crate) fn local_offset(text: &LoroText, shared: usize) -> usize {
    let chars = shared_chars(text);
    visible_units(&chars[..shared.min(chars.len())])
}
