use std::collections::BTreeMap;

use serde_json::Value;

/// Input or output properties of a resource. Ordered so that snapshots
/// serialize deterministically.
pub type PropertyMap = BTreeMap<String, Value>;

/// Build a `PropertyMap` from a JSON object. Anything else yields an empty map.
pub fn from_json(value: Value) -> PropertyMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => PropertyMap::new(),
    }
}

/// Keys whose values differ between `old` and `new` (including added and
/// removed keys), in key order.
pub fn changed_keys(old: &PropertyMap, new: &PropertyMap) -> Vec<String> {
    let mut keys: Vec<String> = old
        .iter()
        .filter(|(k, v)| new.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.extend(
        new.keys()
            .filter(|k| !old.contains_key(*k))
            .cloned(),
    );
    keys.sort();
    keys
}
