//! Utilities over heterogeneous JSON trees (annotations, exception
//! contexts, memos).

use serde_json::{Map, Value};

/// Recursively merge `other` into `object`.  Object members merge
/// member-wise; anything else is replaced.
pub fn update_recursive(object: &mut Value, other: &Value) {
    let Value::Object(other_map) = other else {
        *object = other.clone();
        return;
    };
    if !object.is_object() {
        *object = other.clone();
        return;
    }
    if let Value::Object(map) = object {
        for (key, value) in other_map {
            match (map.get_mut(key), value) {
                (Some(dst @ Value::Object(_)), Value::Object(_)) => update_recursive(dst, value),
                _ => {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Merge `other` into `object[key]`, creating the intermediate object as
/// needed.
pub fn path_update(object: &mut Value, key: &str, other: &Value) {
    if !object.is_object() {
        *object = Value::Object(Map::new());
    }
    if let Value::Object(map) = object {
        let slot = map
            .entry(key.to_string())
            .or_insert(Value::Object(Map::new()));
        update_recursive(slot, other);
    }
}

/// Recursively drop null object members, pruning sub-objects that end up
/// empty.
pub fn clear_null(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|_, v| {
            clear_null(v);
            match v {
                Value::Null => false,
                Value::Object(m) => !m.is_empty(),
                _ => true,
            }
        });
    }
}
