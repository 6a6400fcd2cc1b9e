//! Identity bridge between local nodes and shared containers.
//!
//! Each synchronized local node is paired with exactly one shared container
//! set, and each shared container maps back to exactly one local node. Both
//! directions are hash lookups. Entries hold container handles only; the
//! local node is owned by the model arena and the bridge is cleaned up when
//! the arena sweeps it.

use std::collections::HashMap;

use loro::{ContainerID, ContainerTrait, LoroList, LoroMap, LoroText};
use smol_str::SmolStr;
use tessera_editor_core::NodeId;

use crate::root::RootId;

/// Containers backing one slot.
#[derive(Clone, Debug)]
pub(crate) struct SlotHandles {
    pub content: LoroText,
    pub attrs: LoroMap,
    pub embeds: LoroMap,
}

#[derive(Clone, Debug)]
pub(crate) enum SharedNode {
    Slot(SlotHandles),
    /// `embed_key` is the component's key in its parent slot's embed map.
    Component {
        map: LoroMap,
        embed_key: Option<SmolStr>,
    },
    Map(LoroMap),
    List(LoroList),
}

impl SharedNode {
    /// Containers whose events route back to this node, with their role.
    fn keys(&self) -> Vec<(ContainerID, Role)> {
        match self {
            SharedNode::Slot(handles) => vec![
                (handles.content.id(), Role::SlotContent),
                (handles.attrs.id(), Role::SlotAttrs),
                (handles.embeds.id(), Role::SlotEmbeds),
            ],
            SharedNode::Component { map, .. } => vec![(map.id(), Role::Component)],
            SharedNode::Map(map) => vec![(map.id(), Role::Map)],
            SharedNode::List(list) => vec![(list.id(), Role::List)],
        }
    }

    /// Primary container id used to identify the node externally.
    pub fn primary_id(&self) -> ContainerID {
        match self {
            SharedNode::Slot(handles) => handles.content.id(),
            SharedNode::Component { map, .. } => map.id(),
            SharedNode::Map(map) => map.id(),
            SharedNode::List(list) => list.id(),
        }
    }
}

/// What a shared container is to the local node it routes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    SlotContent,
    SlotAttrs,
    SlotEmbeds,
    Component,
    Map,
    List,
}

#[derive(Clone, Debug)]
pub(crate) struct Binding {
    pub root: RootId,
    pub node: SharedNode,
}

#[derive(Debug, Default)]
pub(crate) struct IdentityBridge {
    by_local: HashMap<NodeId, Binding>,
    by_shared: HashMap<(RootId, ContainerID), (NodeId, Role)>,
}

impl IdentityBridge {
    /// Pair a local node with its shared containers, replacing any previous
    /// pairing of either side.
    pub fn bind(&mut self, local: NodeId, root: RootId, shared: SharedNode) {
        self.unbind(local);
        let keys = shared.keys();
        for (id, _) in &keys {
            if let Some((previous, _)) = self.lookup_shared(root, id) {
                tracing::warn!(%previous, %local, "shared container rebound to a new node");
                self.unbind(previous);
            }
        }
        for (id, role) in keys {
            self.by_shared.insert((root, id), (local, role));
        }
        self.by_local.insert(local, Binding { root, node: shared });
    }

    pub fn lookup_local(&self, local: NodeId) -> Option<&Binding> {
        self.by_local.get(&local)
    }

    pub fn lookup_shared(&self, root: RootId, id: &ContainerID) -> Option<(NodeId, Role)> {
        self.by_shared.get(&(root, id.clone())).copied()
    }

    pub fn unbind(&mut self, local: NodeId) -> Option<Binding> {
        let binding = self.by_local.remove(&local)?;
        for (id, _) in binding.node.keys() {
            self.by_shared.remove(&(binding.root, id));
        }
        Some(binding)
    }

    pub fn unbind_shared(&mut self, root: RootId, id: &ContainerID) -> Option<Binding> {
        let (local, _) = self.lookup_shared(root, id)?;
        self.unbind(local)
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }
}
