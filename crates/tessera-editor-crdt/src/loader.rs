//! Sub-model loading for async slots and components.
//!
//! Async content lives in its own `LoroDoc`. The host decides where those
//! documents come from; the engine only asks for a fresh one when async
//! content is authored locally, and for an existing one when it arrives
//! from a peer.

use std::collections::HashMap;

use loro::LoroDoc;
use serde_json::Value;
use smol_str::SmolStr;
use tessera_editor_core::NodeId;

use crate::error::SyncError;

/// A freshly created sub-document and the key peers will load it by.
pub struct SubModel {
    pub key: SmolStr,
    pub doc: LoroDoc,
}

/// Outcome of a load request.
pub enum SubModelLoad {
    Ready(LoroDoc),
    /// The host will deliver the document later through
    /// [`CollabEngine::resolve_sub_model`](crate::CollabEngine::resolve_sub_model).
    Pending,
}

pub trait SubModelLoader {
    fn create_by_slot(&mut self, metadata: &Value) -> Result<SubModel, SyncError>;

    fn create_by_component(&mut self, name: &str, metadata: &Value)
    -> Result<SubModel, SyncError>;

    fn load_by_slot(&mut self, key: &str, metadata: &Value) -> Result<SubModelLoad, SyncError>;

    fn load_by_component(
        &mut self,
        key: &str,
        name: &str,
        metadata: &Value,
    ) -> Result<SubModelLoad, SyncError>;
}

/// Local node waiting for a sub-document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubModelTarget {
    Slot(NodeId),
    /// `state` is the component's state map, which the sub-document backs.
    Component { component: NodeId, state: NodeId },
}

impl SubModelTarget {
    pub fn node(&self) -> NodeId {
        match self {
            SubModelTarget::Slot(slot) => *slot,
            SubModelTarget::Component { component, .. } => *component,
        }
    }
}

/// Loader that serves published snapshots from memory.
///
/// Created documents get keys `<prefix><n>`; a peer can load them once the
/// owner's snapshot has been [`publish`](Self::publish)ed.
#[derive(Default)]
pub struct MemoryLoader {
    prefix: SmolStr,
    next: u64,
    published: HashMap<SmolStr, Vec<u8>>,
    deferred: bool,
}

impl MemoryLoader {
    pub fn new(prefix: impl Into<SmolStr>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Answer every load with `Pending`.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    pub fn publish(&mut self, key: impl Into<SmolStr>, snapshot: Vec<u8>) {
        self.published.insert(key.into(), snapshot);
    }

    fn create(&mut self) -> SubModel {
        self.next += 1;
        SubModel {
            key: SmolStr::new(format!("{}{}", self.prefix, self.next)),
            doc: LoroDoc::new(),
        }
    }

    fn load(&self, key: &str) -> Result<SubModelLoad, SyncError> {
        if self.deferred {
            return Ok(SubModelLoad::Pending);
        }
        let Some(snapshot) = self.published.get(key) else {
            tracing::debug!(key, "sub-model not published yet");
            return Ok(SubModelLoad::Pending);
        };
        let doc = LoroDoc::new();
        doc.import(snapshot)
            .map_err(|e| SyncError::Import(e.to_string()))?;
        Ok(SubModelLoad::Ready(doc))
    }
}

impl SubModelLoader for MemoryLoader {
    fn create_by_slot(&mut self, _metadata: &Value) -> Result<SubModel, SyncError> {
        Ok(self.create())
    }

    fn create_by_component(
        &mut self,
        _name: &str,
        _metadata: &Value,
    ) -> Result<SubModel, SyncError> {
        Ok(self.create())
    }

    fn load_by_slot(&mut self, key: &str, _metadata: &Value) -> Result<SubModelLoad, SyncError> {
        self.load(key)
    }

    fn load_by_component(
        &mut self,
        key: &str,
        _name: &str,
        _metadata: &Value,
    ) -> Result<SubModelLoad, SyncError> {
        self.load(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_created_keys_use_prefix() {
        let mut loader = MemoryLoader::new("peer-a/");
        let first = loader.create_by_slot(&json!({})).unwrap();
        let second = loader.create_by_component("chart", &json!({})).unwrap();
        assert_eq!(first.key, "peer-a/1");
        assert_eq!(second.key, "peer-a/2");
    }

    #[test]
    fn test_load_published_snapshot() {
        let source = LoroDoc::new();
        source.get_text("content").insert(0, "hi").unwrap();
        source.commit();

        let mut loader = MemoryLoader::new("b/");
        assert!(matches!(
            loader.load_by_slot("a/1", &json!({})).unwrap(),
            SubModelLoad::Pending
        ));
        loader.publish("a/1", source.export(loro::ExportMode::Snapshot).unwrap());
        let SubModelLoad::Ready(doc) = loader.load_by_slot("a/1", &json!({})).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(doc.get_text("content").to_string(), "hi");
    }

    #[test]
    fn test_deferred_loader_always_pending() {
        let mut loader = MemoryLoader::new("x/").deferred();
        loader.publish("k", Vec::new());
        assert!(matches!(
            loader.load_by_component("k", "chart", &json!(null)).unwrap(),
            SubModelLoad::Pending
        ));
    }
}
