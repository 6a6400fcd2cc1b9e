//! Slot content: runs of text and embedded components with inline formats.
//!
//! Offsets are measured in UTF-16 code units. An offset that falls inside a
//! surrogate pair rounds down to the start of that character. An embedded
//! component occupies one position. Runs are kept normalized: no empty text runs, and no
//! two adjacent text runs with identical formats.

use serde_json::Value;
use smol_str::SmolStr;

use crate::types::{AttributeMap, Backing, ContentType, FormatMap, NodeId};

/// Character used when a slot's text is rendered with components inline.
pub const OBJECT_REPLACEMENT: char = '\u{FFFC}';

#[derive(Clone, Debug, PartialEq)]
pub enum RunContent {
    Text(String),
    Component(NodeId),
}

/// A contiguous piece of slot content sharing one set of formats.
#[derive(Clone, Debug, PartialEq)]
pub struct Run {
    pub content: RunContent,
    pub formats: FormatMap,
}

impl Run {
    pub fn len(&self) -> usize {
        match &self.content {
            RunContent::Text(text) => utf16_len(text),
            RunContent::Component(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A maximal range carrying one format key with one value.
#[derive(Clone, Debug, PartialEq)]
pub struct FormatRange {
    pub key: SmolStr,
    pub value: Value,
    pub start: usize,
    pub end: usize,
}

#[derive(Clone, Debug)]
pub struct Slot {
    schema: Vec<ContentType>,
    backing: Backing,
    runs: Vec<Run>,
    attributes: AttributeMap,
    len: usize,
}

impl Slot {
    pub fn new(schema: Vec<ContentType>) -> Self {
        Self {
            schema,
            backing: Backing::Sync,
            runs: Vec::new(),
            attributes: AttributeMap::new(),
            len: 0,
        }
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn schema(&self) -> &[ContentType] {
        &self.schema
    }

    pub fn accepts(&self, content_type: ContentType) -> bool {
        self.schema.contains(&content_type)
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Plain text with embedded components rendered as U+FFFC.
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.len);
        for run in &self.runs {
            match &run.content {
                RunContent::Text(text) => out.push_str(text),
                RunContent::Component(_) => out.push(OBJECT_REPLACEMENT),
            }
        }
        out
    }

    /// Embedded components with their offsets, in document order.
    pub fn components(&self) -> Vec<(usize, NodeId)> {
        let mut offset = 0;
        let mut out = Vec::new();
        for run in &self.runs {
            if let RunContent::Component(id) = run.content {
                out.push((offset, id));
            }
            offset += run.len();
        }
        out
    }

    pub fn component_at(&self, offset: usize) -> Option<NodeId> {
        self.components()
            .into_iter()
            .find(|(at, _)| *at == offset)
            .map(|(_, id)| id)
    }

    pub fn component_offset(&self, component: NodeId) -> Option<usize> {
        self.components()
            .into_iter()
            .find(|(_, id)| *id == component)
            .map(|(at, _)| at)
    }

    /// Formats in effect at the character starting at `offset`.
    pub fn formats_at(&self, offset: usize) -> Option<&FormatMap> {
        let mut start = 0;
        for run in &self.runs {
            let end = start + run.len();
            if offset < end {
                return Some(&run.formats);
            }
            start = end;
        }
        None
    }

    /// Every format as maximal ranges, ordered by start then key.
    pub fn format_ranges(&self) -> Vec<FormatRange> {
        let mut open: Vec<FormatRange> = Vec::new();
        let mut closed = Vec::new();
        let mut offset = 0;
        for run in &self.runs {
            let (keep, ended): (Vec<_>, Vec<_>) = open
                .into_iter()
                .partition(|r| run.formats.get(&r.key) == Some(&r.value));
            closed.extend(ended.into_iter().map(|mut r| {
                r.end = offset;
                r
            }));
            open = keep;
            for (key, value) in &run.formats {
                if !open.iter().any(|r| &r.key == key) {
                    open.push(FormatRange {
                        key: key.clone(),
                        value: value.clone(),
                        start: offset,
                        end: offset,
                    });
                }
            }
            offset += run.len();
        }
        closed.extend(open.into_iter().map(|mut r| {
            r.end = offset;
            r
        }));
        closed.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.key.cmp(&b.key)));
        closed
    }

    /// The nearest character boundary at or before `offset`, clamped to the
    /// slot.
    pub fn snap(&self, offset: usize) -> usize {
        let offset = offset.min(self.len);
        let mut start = 0;
        for run in &self.runs {
            let len = run.len();
            if offset < start + len {
                return match &run.content {
                    RunContent::Text(text) => start + floor_boundary(text, offset - start).1,
                    RunContent::Component(_) => start,
                };
            }
            start += len;
        }
        offset
    }

    /// Insert text at `offset` (clamped). Returns the offset actually used.
    pub(crate) fn insert_text(&mut self, offset: usize, text: &str, formats: FormatMap) -> usize {
        let offset = self.snap(offset);
        if text.is_empty() {
            return offset;
        }
        let index = self.split_at(offset);
        self.runs.insert(
            index,
            Run {
                content: RunContent::Text(text.to_string()),
                formats: strip_nulls(formats),
            },
        );
        self.len += utf16_len(text);
        self.normalize();
        offset
    }

    pub(crate) fn insert_component(
        &mut self,
        offset: usize,
        component: NodeId,
        formats: FormatMap,
    ) -> usize {
        let offset = self.snap(offset);
        let index = self.split_at(offset);
        self.runs.insert(
            index,
            Run {
                content: RunContent::Component(component),
                formats: strip_nulls(formats),
            },
        );
        self.len += 1;
        self.normalize();
        offset
    }

    /// Delete `len` code units at `offset`, clamped to the slot.
    ///
    /// Returns the number of code units removed and the embedded components
    /// that were inside the range.
    pub(crate) fn delete(&mut self, offset: usize, len: usize) -> (usize, Vec<NodeId>) {
        let start = self.snap(offset);
        let end = self.snap(offset.saturating_add(len));
        if start >= end {
            return (0, Vec::new());
        }
        let a = self.split_at(start);
        let b = self.split_at(end);
        let removed = self
            .runs
            .drain(a..b)
            .filter_map(|run| match run.content {
                RunContent::Component(id) => Some(id),
                RunContent::Text(_) => None,
            })
            .collect();
        self.len -= end - start;
        self.normalize();
        (end - start, removed)
    }

    /// Apply format edits to a range. `Null` values remove the key.
    pub(crate) fn format(&mut self, offset: usize, len: usize, formats: &FormatMap) {
        let start = self.snap(offset);
        let end = self.snap(offset.saturating_add(len));
        if start >= end || formats.is_empty() {
            return;
        }
        let a = self.split_at(start);
        let b = self.split_at(end);
        for run in &mut self.runs[a..b] {
            for (key, value) in formats {
                if value.is_null() {
                    run.formats.remove(key);
                } else {
                    run.formats.insert(key.clone(), value.clone());
                }
            }
        }
        self.normalize();
    }

    pub(crate) fn set_attribute(&mut self, key: SmolStr, value: Value) -> Option<Value> {
        self.attributes.insert(key, value)
    }

    pub(crate) fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Ensure a run boundary at `offset` and return the index of the run
    /// starting there (or `runs.len()` at the end). `offset` must be a
    /// character boundary.
    fn split_at(&mut self, offset: usize) -> usize {
        let mut start = 0;
        for index in 0..self.runs.len() {
            if start == offset {
                return index;
            }
            let len = self.runs[index].len();
            if offset < start + len {
                let run = &mut self.runs[index];
                let RunContent::Text(text) = &mut run.content else {
                    // components have length one, so offset == start above
                    return index;
                };
                let (byte, _) = floor_boundary(text, offset - start);
                let tail = text.split_off(byte);
                let formats = run.formats.clone();
                self.runs.insert(
                    index + 1,
                    Run {
                        content: RunContent::Text(tail),
                        formats,
                    },
                );
                return index + 1;
            }
            start += len;
        }
        self.runs.len()
    }

    fn normalize(&mut self) {
        let mut merged: Vec<Run> = Vec::with_capacity(self.runs.len());
        for run in self.runs.drain(..) {
            if let RunContent::Text(text) = &run.content {
                if text.is_empty() {
                    continue;
                }
            }
            if let Some(last) = merged.last_mut() {
                if last.formats == run.formats {
                    if let (RunContent::Text(a), RunContent::Text(b)) =
                        (&mut last.content, &run.content)
                    {
                        a.push_str(b);
                        continue;
                    }
                }
            }
            merged.push(run);
        }
        self.runs = merged;
    }
}

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Byte index and UTF-16 offset of the last character boundary at or
/// before `units` code units into `text`.
fn floor_boundary(text: &str, units: usize) -> (usize, usize) {
    let mut seen = 0;
    for (byte, c) in text.char_indices() {
        if seen + c.len_utf16() > units {
            return (byte, seen);
        }
        seen += c.len_utf16();
    }
    (text.len(), seen)
}

fn strip_nulls(mut formats: FormatMap) -> FormatMap {
    formats.retain(|_, v| !v.is_null());
    formats
}
