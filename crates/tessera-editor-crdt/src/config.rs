//! Engine configuration and host-supplied filters.

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_editor_core::{ModelChange, NodeId};
use web_time::Duration;

use crate::error::SyncError;
use crate::root::RootId;

/// Which documents participate in undo history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryScope {
    /// Only the main document is tracked.
    #[default]
    SingleRoot,
    /// The main document and every loaded sub-document are tracked.
    MultiRoot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Maximum number of undo entries kept.
    pub stack_size: usize,
    /// Edits closer together than this are merged into one undo entry.
    pub coalesce_window_ms: u64,
    pub history_scope: HistoryScope,
    /// Deepest slot/component nesting accepted from the shared document.
    pub max_depth: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            stack_size: 500,
            coalesce_window_ms: 500,
            history_scope: HistoryScope::SingleRoot,
            max_depth: 64,
        }
    }
}

impl CollabConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.stack_size == 0 {
            return Err(SyncError::Config("stack_size must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(SyncError::Config("max_depth must be at least 1".into()));
        }
        Ok(())
    }

    /// Parse from TOML, substituting `$NAME` environment references first.
    pub fn from_toml_str(source: &str) -> Result<Self, SyncError> {
        let mut source = source.to_string();
        for (k, v) in env::vars() {
            source = source.replace(&format!("${}", k), &v);
        }
        let config: CollabConfig = toml::from_str(&source)
            .map_err(|e| SyncError::Config(format!("error parsing config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Summary of a local commit offered to the capture filter.
#[derive(Debug)]
pub struct TransactionInfo<'a> {
    pub changes: &'a [ModelChange],
    pub roots: &'a [RootId],
}

/// An embedded component removed by a local delete.
#[derive(Debug)]
pub struct DeletedItem<'a> {
    pub component: NodeId,
    pub name: &'a str,
}

pub type RecordPolicy = Box<dyn Fn(&ModelChange) -> bool>;
pub type CaptureFilter = Box<dyn Fn(&TransactionInfo<'_>) -> bool>;
pub type DeletedItemFilter = Box<dyn Fn(&DeletedItem<'_>) -> bool>;

/// Host hooks deciding what lands in history and what is kept on delete.
pub struct TransactionFilters {
    /// Return false to keep a recorded commit out of undo history.
    pub should_capture_transaction: Option<CaptureFilter>,
    /// Return true to drop a deleted component's shared data. By default it
    /// is kept so remote peers can still undo the deletion.
    pub should_filter_deleted_item: Option<DeletedItemFilter>,
    /// Decides whether a journaled change is undoable.
    pub record_policy: RecordPolicy,
}

impl TransactionFilters {
    /// Default filters for a history scope.
    ///
    /// Single-root history honours each change's record hint. Multi-root
    /// history only records content edits: state structure may span
    /// sub-documents that peers load independently.
    pub fn for_scope(scope: HistoryScope) -> Self {
        let record_policy: RecordPolicy = match scope {
            HistoryScope::SingleRoot => Box::new(record_hint),
            HistoryScope::MultiRoot => Box::new(content_only),
        };
        Self {
            should_capture_transaction: None,
            should_filter_deleted_item: None,
            record_policy,
        }
    }

    pub(crate) fn records(&self, change: &ModelChange) -> bool {
        (self.record_policy)(change)
    }

    pub(crate) fn captures(&self, info: &TransactionInfo<'_>) -> bool {
        self.should_capture_transaction
            .as_ref()
            .is_none_or(|f| f(info))
    }

    pub(crate) fn drops_deleted(&self, item: &DeletedItem<'_>) -> bool {
        self.should_filter_deleted_item
            .as_ref()
            .is_some_and(|f| f(item))
    }
}

impl Default for TransactionFilters {
    fn default() -> Self {
        Self::for_scope(HistoryScope::SingleRoot)
    }
}

impl fmt::Debug for TransactionFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFilters")
            .field(
                "should_capture_transaction",
                &self.should_capture_transaction.is_some(),
            )
            .field(
                "should_filter_deleted_item",
                &self.should_filter_deleted_item.is_some(),
            )
            .finish_non_exhaustive()
    }
}

/// Record exactly what the edit asked for.
pub fn record_hint(change: &ModelChange) -> bool {
    change.record
}

/// Record content edits only; structural state changes sync but are not undoable.
pub fn content_only(change: &ModelChange) -> bool {
    change.record && change.is_content()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_editor_core::{ChangeOp, MapAction};

    fn map_change(record: bool) -> ModelChange {
        ModelChange {
            node: tessera_editor_core::DocumentModel::new().create_map(Vec::new()),
            record,
            op: ChangeOp::Map(MapAction::Delete { key: "k".into() }),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CollabConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coalesce_window(), Duration::from_millis(500));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CollabConfig::from_toml_str(
            r#"
            stack_size = 20
            history_scope = "multi_root"
            "#,
        )
        .unwrap();
        assert_eq!(config.stack_size, 20);
        assert_eq!(config.history_scope, HistoryScope::MultiRoot);
        assert_eq!(config.max_depth, 64);
    }

    #[test]
    fn test_zero_stack_rejected() {
        let err = CollabConfig::from_toml_str("stack_size = 0").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_scope_record_policies() {
        let single = TransactionFilters::for_scope(HistoryScope::SingleRoot);
        let multi = TransactionFilters::for_scope(HistoryScope::MultiRoot);
        assert!(single.records(&map_change(true)));
        assert!(!single.records(&map_change(false)));
        assert!(!multi.records(&map_change(true)));
    }

    #[test]
    fn test_default_filters_capture_and_keep() {
        let filters = TransactionFilters::default();
        assert!(filters.captures(&TransactionInfo {
            changes: &[],
            roots: &[],
        }));
        assert!(!filters.drops_deleted(&DeletedItem {
            component: tessera_editor_core::DocumentModel::new().create_map(Vec::new()),
            name: "image",
        }));
    }
}
