//! Update-origin guard.
//!
//! Local journal entries are queued here and handed out as commit groups.
//! Commits are tagged with an origin string so the engine can recognise its
//! own echoes when the backend reports them back. Everything that is not an
//! echo is replayed under a [`ReplayContext`].

use std::collections::{HashSet, VecDeque};

use loro::ContainerID;
use tessera_editor_core::{ModelChange, Origin, ReplayKind};

use crate::config::TransactionFilters;

/// Prefix shared by every commit origin this engine produces.
pub const LOCAL_ORIGIN_PREFIX: &str = "tessera:local";
/// Origin of commits that should be undoable.
pub const ORIGIN_TRACKED: &str = "tessera:local";
/// Origin of commits that sync but stay out of undo history.
pub const ORIGIN_UNTRACKED: &str = "tessera:local-untracked";

/// True if an event with this origin was produced by our own commits.
pub fn is_own_echo(origin: &str) -> bool {
    origin.starts_with(LOCAL_ORIGIN_PREFIX)
}

pub(crate) fn commit_origin(record: bool) -> &'static str {
    if record {
        ORIGIN_TRACKED
    } else {
        ORIGIN_UNTRACKED
    }
}

/// Consecutive journal entries that share a record flag.
#[derive(Debug)]
pub(crate) struct ChangeGroup {
    pub record: bool,
    pub changes: Vec<ModelChange>,
}

#[derive(Debug, Default)]
pub(crate) struct OriginGuard {
    pending: VecDeque<ModelChange>,
}

impl OriginGuard {
    /// Queue journal entries, letting the record policy decide undoability.
    pub fn enqueue(&mut self, changes: Vec<ModelChange>, filters: &TransactionFilters) {
        for mut change in changes {
            change.record = filters.records(&change);
            self.pending.push_back(change);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain the queue, grouping runs of equal record flags.
    pub fn drain_groups(&mut self) -> Vec<ChangeGroup> {
        let mut groups: Vec<ChangeGroup> = Vec::new();
        for change in self.pending.drain(..) {
            match groups.last_mut() {
                Some(group) if group.record == change.record => group.changes.push(change),
                _ => groups.push(ChangeGroup {
                    record: change.record,
                    changes: vec![change],
                }),
            }
        }
        groups
    }
}

/// Explicit context for replaying shared changes into the local model.
#[derive(Debug)]
pub struct ReplayContext {
    kind: ReplayKind,
    fresh: HashSet<ContainerID>,
}

impl ReplayContext {
    pub fn new(kind: ReplayKind) -> Self {
        Self {
            kind,
            fresh: HashSet::new(),
        }
    }

    pub fn kind(&self) -> ReplayKind {
        self.kind
    }

    /// Origin to pass to model mutations made during this replay.
    pub fn origin(&self) -> Origin {
        Origin::Replay(self.kind)
    }

    /// Remote edits move the local selection; our own undo/redo does not.
    pub fn adjusts_selection(&self) -> bool {
        self.kind == ReplayKind::Remote
    }

    /// Mark a container as materialized from its current state in this replay.
    /// Diffs targeting it in the same batch are already reflected.
    pub(crate) fn mark_fresh(&mut self, id: ContainerID) {
        self.fresh.insert(id);
    }

    pub(crate) fn is_fresh(&self, id: &ContainerID) -> bool {
        self.fresh.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_editor_core::{ChangeOp, DocumentModel, MapAction};

    fn change(record: bool) -> ModelChange {
        ModelChange {
            node: DocumentModel::new().create_list(Vec::new()),
            record,
            op: ChangeOp::Map(MapAction::Delete { key: "k".into() }),
        }
    }

    #[test]
    fn test_echo_detection() {
        assert!(is_own_echo(ORIGIN_TRACKED));
        assert!(is_own_echo(ORIGIN_UNTRACKED));
        assert!(!is_own_echo(""));
        assert!(!is_own_echo("undo"));
        // the untracked origin must not be excluded when tracked is
        assert!(!ORIGIN_TRACKED.starts_with(ORIGIN_UNTRACKED));
    }

    #[test]
    fn test_groups_split_on_record_flag() {
        let mut guard = OriginGuard::default();
        let filters = TransactionFilters::default();
        guard.enqueue(
            vec![change(true), change(true), change(false), change(true)],
            &filters,
        );
        let groups = guard.drain_groups();
        let shape: Vec<_> = groups.iter().map(|g| (g.record, g.changes.len())).collect();
        assert_eq!(shape, vec![(true, 2), (false, 1), (true, 1)]);
        assert!(guard.is_empty());
    }

    #[test]
    fn test_replay_context_selection_policy() {
        assert!(ReplayContext::new(ReplayKind::Remote).adjusts_selection());
        assert!(!ReplayContext::new(ReplayKind::History).adjusts_selection());
        assert_eq!(
            ReplayContext::new(ReplayKind::History).origin(),
            Origin::Replay(ReplayKind::History)
        );
    }
}
