//! State values held by components and nested state containers.

use serde_json::Value;
use smol_str::SmolStr;

use crate::types::NodeId;

/// A value inside component state.
///
/// Container variants hold arena handles; scalars are plain JSON values.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalValue {
    Slot(NodeId),
    Map(NodeId),
    List(NodeId),
    Scalar(Value),
}

impl LocalValue {
    /// The arena node this value refers to, if it is a container.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            LocalValue::Slot(id) | LocalValue::Map(id) | LocalValue::List(id) => Some(*id),
            LocalValue::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            LocalValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LocalValue::Slot(_) => "slot",
            LocalValue::Map(_) => "map",
            LocalValue::List(_) => "list",
            LocalValue::Scalar(_) => "scalar",
        }
    }
}

/// Description of state to materialize into the arena.
///
/// Hosts build component state with this and hand it to
/// [`DocumentModel::build_state`](crate::DocumentModel::build_state).
/// JSON arrays and objects become state lists and maps.
#[derive(Clone, Debug, PartialEq)]
pub enum StateInit {
    Slot(NodeId),
    Map(Vec<(SmolStr, StateInit)>),
    List(Vec<StateInit>),
    Scalar(Value),
}

impl StateInit {
    pub fn map<K: Into<SmolStr>>(entries: impl IntoIterator<Item = (K, StateInit)>) -> Self {
        StateInit::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list(items: impl IntoIterator<Item = StateInit>) -> Self {
        StateInit::List(items.into_iter().collect())
    }

    pub fn empty_map() -> Self {
        StateInit::Map(Vec::new())
    }
}

impl From<Value> for StateInit {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => StateInit::List(items.into_iter().map(StateInit::from).collect()),
            Value::Object(entries) => StateInit::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (SmolStr::from(k), StateInit::from(v)))
                    .collect(),
            ),
            other => StateInit::Scalar(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_object_becomes_map() {
        let init = StateInit::from(json!({"title": "x", "tags": ["a", "b"]}));
        let StateInit::Map(entries) = init else {
            panic!("expected map");
        };
        assert_eq!(entries.len(), 2);
        let tags = entries.iter().find(|(k, _)| k == "tags").map(|(_, v)| v);
        assert_eq!(
            tags,
            Some(&StateInit::List(vec![
                StateInit::Scalar(json!("a")),
                StateInit::Scalar(json!("b")),
            ]))
        );
    }

    #[test]
    fn test_scalar_has_no_node() {
        assert_eq!(LocalValue::Scalar(json!(3)).node(), None);
        assert_eq!(LocalValue::Slot(NodeId(4)).node(), Some(NodeId(4)));
    }
}
