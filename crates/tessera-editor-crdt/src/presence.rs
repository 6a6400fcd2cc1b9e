//! Presence for collaborative editing sessions.
//!
//! The local selection is published as a path-based descriptor through a
//! host transport. Peer states coming back are tracked per peer with an
//! assigned colour and resolved against the local model on demand.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tessera_editor_core::{DocumentModel, Selection, SlotPosition};
use web_time::{Duration, Instant};

use crate::error::SyncError;

/// Transport field the selection descriptor is published under.
pub const SELECTION_FIELD: &str = "selection";

/// Selection endpoints encoded with [`DocumentModel::path_of`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionDescriptor {
    pub anchor: Vec<usize>,
    pub head: Vec<usize>,
}

impl SelectionDescriptor {
    pub fn encode(model: &DocumentModel, selection: Selection) -> Option<Self> {
        Some(Self {
            anchor: model.path_of(selection.anchor)?,
            head: model.path_of(selection.head)?,
        })
    }

    pub fn resolve(&self, model: &DocumentModel) -> Option<Selection> {
        Some(Selection::new(
            model.resolve_path(&self.anchor)?,
            model.resolve_path(&self.head)?,
        ))
    }
}

/// One peer's presence state as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub peer: u64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub selection: Option<SelectionDescriptor>,
}

/// Host side of the presence transport.
pub trait PresenceTransport {
    fn set_local_state_field(&mut self, key: &str, value: serde_json::Value);
}

/// A remote collaborator's cursor state.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub selection: SelectionDescriptor,
    /// Assigned colour (RGBA).
    pub color: u32,
    pub updated_at: Instant,
}

#[derive(Debug, Clone)]
pub struct Collaborator {
    pub peer: u64,
    pub display_name: String,
    pub color: u32,
    pub cursor: Option<RemoteCursor>,
}

/// A remote selection resolved against the live model.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSelection {
    pub peer: u64,
    pub display_name: String,
    pub color: u32,
    pub anchor: SlotPosition,
    pub head: SlotPosition,
}

/// RGBA selection colours handed out to peers in order.
const PEER_COLORS: [u32; 8] = [
    0xFF6B6BFF, 0x4ECDC4FF, 0xFFE66DFF, 0x95E1D3FF, 0xF38181FF, 0xAA96DAFF, 0xFCBF49FF,
    0x2EC4B6FF,
];

/// Collaborators currently present, keyed by peer id.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    collaborators: HashMap<u64, Collaborator>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_collaborator(&mut self, peer: u64, display_name: String) {
        let color = self.free_color();
        self.collaborators.insert(
            peer,
            Collaborator {
                peer,
                display_name,
                color,
                cursor: None,
            },
        );
    }

    pub fn remove_collaborator(&mut self, peer: u64) -> Option<Collaborator> {
        self.collaborators.remove(&peer)
    }

    /// Replace a collaborator's cursor; `None` clears it.
    pub fn update_cursor(&mut self, peer: u64, selection: Option<SelectionDescriptor>) {
        if let Some(collab) = self.collaborators.get_mut(&peer) {
            collab.cursor = selection.map(|selection| RemoteCursor {
                selection,
                color: collab.color,
                updated_at: Instant::now(),
            });
        }
    }

    pub fn collaborators(&self) -> impl Iterator<Item = &Collaborator> {
        self.collaborators.values()
    }

    pub fn cursors(&self) -> impl Iterator<Item = (&Collaborator, &RemoteCursor)> {
        self.collaborators
            .values()
            .filter_map(|c| c.cursor.as_ref().map(|cursor| (c, cursor)))
    }

    pub fn get(&self, peer: u64) -> Option<&Collaborator> {
        self.collaborators.get(&peer)
    }

    pub fn contains(&self, peer: u64) -> bool {
        self.collaborators.contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    /// First palette colour no present peer holds. Once all are taken,
    /// colours repeat by peer count.
    fn free_color(&self) -> u32 {
        PEER_COLORS
            .iter()
            .copied()
            .find(|color| self.collaborators.values().all(|c| c.color != *color))
            .unwrap_or(PEER_COLORS[self.collaborators.len() % PEER_COLORS.len()])
    }

    /// Clear cursors last updated more than `max_age` before `now`. The
    /// collaborators themselves stay.
    pub fn prune_stale_cursors(&mut self, now: Instant, max_age: Duration) {
        let stale = |cursor: &RemoteCursor| now.saturating_duration_since(cursor.updated_at) > max_age;
        for collab in self.collaborators.values_mut() {
            if collab.cursor.as_ref().is_some_and(stale) {
                tracing::trace!(peer = collab.peer, "dropping stale cursor");
                collab.cursor = None;
            }
        }
    }
}

/// Publishes the local selection and tracks everyone else's.
#[derive(Debug)]
pub struct PresenceChannel {
    local_peer: u64,
    tracker: PresenceTracker,
    published: Option<Option<SelectionDescriptor>>,
}

impl PresenceChannel {
    pub fn new(local_peer: u64) -> Self {
        Self {
            local_peer,
            tracker: PresenceTracker::new(),
            published: None,
        }
    }

    pub fn local_peer(&self) -> u64 {
        self.local_peer
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    /// Publish the model's selection if it changed since the last call.
    ///
    /// Returns the descriptor now in effect; a selection that cannot be
    /// encoded is published as `null`.
    pub fn publish(
        &mut self,
        model: &DocumentModel,
        transport: &mut dyn PresenceTransport,
    ) -> Result<Option<SelectionDescriptor>, SyncError> {
        let descriptor = model
            .selection()
            .and_then(|s| SelectionDescriptor::encode(model, s));
        if self.published.as_ref() == Some(&descriptor) {
            return Ok(descriptor);
        }
        let value = serde_json::to_value(&descriptor)
            .map_err(|e| SyncError::Export(format!("presence descriptor: {}", e)))?;
        transport.set_local_state_field(SELECTION_FIELD, value);
        tracing::trace!(peer = self.local_peer, "published local selection");
        self.published = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Apply the full set of peer states from the transport.
    ///
    /// Peers missing from `states` have left and are removed. Our own state
    /// is ignored.
    pub fn on_state_change(&mut self, states: &[PeerState]) {
        let present: Vec<u64> = states
            .iter()
            .map(|s| s.peer)
            .filter(|p| *p != self.local_peer)
            .collect();
        let gone: Vec<u64> = self
            .tracker
            .collaborators()
            .map(|c| c.peer)
            .filter(|p| !present.contains(p))
            .collect();
        for peer in gone {
            self.tracker.remove_collaborator(peer);
        }

        for state in states.iter().filter(|s| s.peer != self.local_peer) {
            if !self.tracker.contains(state.peer) {
                let name = state
                    .display_name
                    .clone()
                    .unwrap_or_else(|| format!("peer {}", state.peer));
                self.tracker.add_collaborator(state.peer, name);
            }
            let unchanged = self
                .tracker
                .get(state.peer)
                .and_then(|c| c.cursor.as_ref())
                .map(|c| &c.selection)
                == state.selection.as_ref();
            if !unchanged {
                self.tracker.update_cursor(state.peer, state.selection.clone());
            }
        }
    }

    /// Remote selections resolved against `model`. Descriptors that no
    /// longer resolve are skipped.
    pub fn remote_selections(&self, model: &DocumentModel) -> Vec<RemoteSelection> {
        let mut out: Vec<RemoteSelection> = self
            .tracker
            .cursors()
            .filter_map(|(collab, cursor)| {
                let resolved = cursor.selection.resolve(model)?;
                Some(RemoteSelection {
                    peer: collab.peer,
                    display_name: collab.display_name.clone(),
                    color: cursor.color,
                    anchor: resolved.anchor,
                    head: resolved.head,
                })
            })
            .collect();
        out.sort_by_key(|s| s.peer);
        out
    }

    pub fn prune_stale(&mut self, now: Instant, max_age: Duration) {
        self.tracker.prune_stale_cursors(now, max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_editor_core::{
        Backing, ComponentSchema, ContentType, Origin, StateInit,
    };

    #[derive(Default)]
    struct RecordingTransport {
        fields: Vec<(String, serde_json::Value)>,
    }

    impl PresenceTransport for RecordingTransport {
        fn set_local_state_field(&mut self, key: &str, value: serde_json::Value) {
            self.fields.push((key.to_string(), value));
        }
    }

    fn paragraph_doc() -> (DocumentModel, tessera_editor_core::NodeId) {
        let mut model = DocumentModel::new();
        let slot = model.create_slot(vec![ContentType::Text], Backing::Sync);
        let state = model.build_state(StateInit::map([("body", StateInit::Slot(slot))]));
        let schema = ComponentSchema {
            name: "paragraph".into(),
            content_type: ContentType::BlockComponent,
        };
        let root = model.create_component(&schema, Backing::Sync, state);
        model.set_root(root).unwrap();
        model
            .insert_text(Origin::LOCAL, slot, 0, "hello", Default::default())
            .unwrap();
        (model, slot)
    }

    #[test]
    fn test_color_assignment_cycles() {
        let mut tracker = PresenceTracker::new();
        for peer in 0..10 {
            tracker.add_collaborator(peer, format!("User{}", peer));
        }
        assert_eq!(tracker.get(0).unwrap().color, tracker.get(8).unwrap().color);
        assert_ne!(tracker.get(0).unwrap().color, tracker.get(1).unwrap().color);
    }

    #[test]
    fn test_prune_stale_cursors() {
        let mut tracker = PresenceTracker::new();
        tracker.add_collaborator(7, "Alice".into());
        tracker.update_cursor(
            7,
            Some(SelectionDescriptor {
                anchor: vec![0, 1],
                head: vec![0, 1],
            }),
        );
        let later = Instant::now() + Duration::from_millis(10);
        tracker.prune_stale_cursors(Instant::now(), Duration::from_secs(60));
        assert!(tracker.get(7).unwrap().cursor.is_some());
        tracker.prune_stale_cursors(later, Duration::from_millis(1));
        assert!(tracker.get(7).unwrap().cursor.is_none());
        assert!(tracker.contains(7));
    }

    #[test]
    fn test_departed_peer_color_is_reused() {
        let mut tracker = PresenceTracker::new();
        tracker.add_collaborator(1, "Alice".into());
        tracker.add_collaborator(2, "Bob".into());
        let alice = tracker.get(1).unwrap().color;
        tracker.remove_collaborator(1);
        tracker.add_collaborator(3, "Carol".into());
        assert_eq!(tracker.get(3).unwrap().color, alice);
        assert_ne!(tracker.get(3).unwrap().color, tracker.get(2).unwrap().color);
    }

    #[test]
    fn test_publish_only_on_change() {
        let (mut model, slot) = paragraph_doc();
        let mut channel = PresenceChannel::new(1);
        let mut transport = RecordingTransport::default();

        model.set_selection(Some(Selection::collapsed(SlotPosition::new(slot, 2))));
        let descriptor = channel.publish(&model, &mut transport).unwrap().unwrap();
        assert_eq!(descriptor.anchor, vec![0, 2]);
        channel.publish(&model, &mut transport).unwrap();
        assert_eq!(transport.fields.len(), 1);
        assert_eq!(transport.fields[0].0, SELECTION_FIELD);
        assert_eq!(transport.fields[0].1, json!({"anchor": [0, 2], "head": [0, 2]}));

        model.set_selection(None);
        channel.publish(&model, &mut transport).unwrap();
        assert_eq!(transport.fields.len(), 2);
        assert_eq!(transport.fields[1].1, serde_json::Value::Null);
    }

    #[test]
    fn test_state_change_ignores_self_and_drops_departed() {
        let (model, slot) = paragraph_doc();
        let mut channel = PresenceChannel::new(1);
        let sel = SelectionDescriptor {
            anchor: vec![0, 1],
            head: vec![0, 9],
        };
        channel.on_state_change(&[
            PeerState {
                peer: 1,
                display_name: None,
                selection: Some(sel.clone()),
            },
            PeerState {
                peer: 2,
                display_name: Some("Bob".into()),
                selection: Some(sel.clone()),
            },
        ]);
        assert_eq!(channel.tracker().len(), 1);

        let remote = channel.remote_selections(&model);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].display_name, "Bob");
        assert_eq!(remote[0].anchor, SlotPosition::new(slot, 1));
        // head clamps to the slot length
        assert_eq!(remote[0].head, SlotPosition::new(slot, 5));

        channel.on_state_change(&[]);
        assert!(channel.tracker().is_empty());
    }

    #[test]
    fn test_peer_state_deserializes_from_transport_json() {
        let state: PeerState =
            serde_json::from_value(json!({"peer": 4, "selection": {"anchor": [0, 0], "head": [0, 3]}}))
                .unwrap();
        assert_eq!(state.display_name, None);
        assert_eq!(state.selection.unwrap().head, vec![0, 3]);
    }
}
