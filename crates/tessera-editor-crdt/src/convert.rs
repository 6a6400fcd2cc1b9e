//! Conversions between JSON scalars and Loro values, plus map readers.

use std::collections::HashMap;

use loro::{LoroMap, LoroValue, ValueOrContainer};
use serde_json::{Number, Value};

pub(crate) fn json_to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Null => LoroValue::Null,
        Value::Bool(b) => LoroValue::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LoroValue::from(i),
            None => LoroValue::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => LoroValue::from(s.as_str()),
        Value::Array(items) => LoroValue::from(items.iter().map(json_to_loro).collect::<Vec<_>>()),
        Value::Object(entries) => LoroValue::from(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_loro(v)))
                .collect::<HashMap<String, LoroValue>>(),
        ),
    }
}

pub(crate) fn loro_to_json(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::I64(i) => Value::from(*i),
        LoroValue::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::List(items) => Value::Array(items.iter().map(loro_to_json).collect()),
        LoroValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), loro_to_json(v)))
                .collect(),
        ),
        // binary and container references have no scalar form
        _ => Value::Null,
    }
}

pub(crate) fn loro_str(value: &LoroValue) -> Option<String> {
    match value {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

/// String stored under `key`, if it is a plain string value.
pub(crate) fn read_str(map: &LoroMap, key: &str) -> Option<String> {
    match map.get(key)? {
        ValueOrContainer::Value(v) => loro_str(&v),
        ValueOrContainer::Container(_) => None,
    }
}

/// Scalar stored under `key` as JSON, `Null` if absent.
pub(crate) fn read_json(map: &LoroMap, key: &str) -> Value {
    match map.get(key) {
        Some(ValueOrContainer::Value(v)) => loro_to_json(&v),
        _ => Value::Null,
    }
}

/// Every entry of a map, sorted by key.
pub(crate) fn map_entries(map: &LoroMap) -> Vec<(String, ValueOrContainer)> {
    let mut entries = Vec::new();
    map.for_each(|key, value| entries.push((key.to_string(), value)));
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}
