//! Server-side mirror of a device's object tree.
//!
//! ```text
//! { "<oid>": { "<iid>": { "<rid>": value, ... }, ... }, ... }
//! ```

use crate::path::{PathKind, ResourcePath};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Nested oid → iid → rid map of resource values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTree(Map<String, Value>);

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces one instance with a freshly read set of resources.
    pub fn init(&mut self, oid: &str, iid: &str, resources: Map<String, Value>) {
        let object = self
            .0
            .entry(oid.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !object.is_object() {
            *object = Value::Object(Map::new());
        }
        if let Value::Object(instances) = object {
            instances.insert(iid.to_string(), Value::Object(resources));
        }
    }

    /// Loads every instance of an object from a read payload
    /// shaped `{ "<iid>": { "<rid>": value } }`.
    ///
    /// Returns the number of instances loaded.
    pub fn init_object(&mut self, oid: &str, payload: &Value) -> usize {
        let Some(instances) = payload.as_object() else {
            return 0;
        };
        let mut loaded = 0;
        for (iid, resources) in instances {
            if let Some(resources) = resources.as_object() {
                self.init(oid, iid, resources.clone());
                loaded += 1;
            }
        }
        loaded
    }

    /// Looks up the value at `path`.
    pub fn get(&self, path: &ResourcePath) -> Option<&Value> {
        let mut segments = path.segments().iter();
        let first = segments.next()?;
        let mut node = self.0.get(first)?;
        for segment in segments {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    /// Deep-merges a nested patch into the tree.
    pub fn apply_patch(&mut self, patch: &Value) {
        if let Value::Object(fields) = patch {
            for (key, value) in fields {
                merge_into(self.0.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }

    /// Returns the whole tree as a JSON value.
    pub fn dump(&self) -> Value {
        Value::Object(self.0.clone())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds the minimal nested patch that places `value` at `path`.
    ///
    /// Returns `None` for a null value or a root/heartbeat path.
    pub fn patch_for(path: &ResourcePath, value: &Value) -> Option<Value> {
        if value.is_null() || path.is_heartbeat() || path.kind() == PathKind::Root {
            return None;
        }

        let patch = path
            .segments()
            .iter()
            .rev()
            .fold(value.clone(), |inner, segment| {
                let mut level = Map::new();
                level.insert(segment.clone(), inner);
                Value::Object(level)
            });

        debug!(path = %path, "Built resource patch");
        Some(patch)
    }
}

/// Recursive merge: objects merge key by key, anything else replaces.
pub fn merge_into(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_fields), Value::Object(patch_fields)) => {
            for (key, value) in patch_fields {
                merge_into(
                    target_fields.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
        (target, patch) => {
            *target = patch.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_for_resource() {
        let path = ResourcePath::parse("/3303/0/5700").unwrap();
        let patch = ResourceTree::patch_for(&path, &json!(21.5)).unwrap();
        assert_eq!(patch, json!({"3303": {"0": {"5700": 21.5}}}));
    }

    #[test]
    fn test_patch_for_null_is_none() {
        let path = ResourcePath::parse("/3/0").unwrap();
        assert!(ResourceTree::patch_for(&path, &Value::Null).is_none());
        assert!(ResourceTree::patch_for(&ResourcePath::heartbeat(), &json!(1)).is_none());
    }

    #[test]
    fn test_apply_patch_merges_deeply() {
        let mut tree = ResourceTree::new();
        let mut resources = Map::new();
        resources.insert("0".to_string(), json!("acme"));
        resources.insert("1".to_string(), json!("model-x"));
        tree.init("3", "0", resources);

        tree.apply_patch(&json!({"3": {"0": {"1": "model-y"}}}));

        let path = ResourcePath::parse("/3/0/0").unwrap();
        assert_eq!(tree.get(&path), Some(&json!("acme")));
        let path = ResourcePath::parse("/3/0/1").unwrap();
        assert_eq!(tree.get(&path), Some(&json!("model-y")));
    }

    #[test]
    fn test_init_object_from_read_payload() {
        let mut tree = ResourceTree::new();
        let loaded = tree.init_object("1", &json!({"0": {"1": 86400}, "1": {"1": 300}}));
        assert_eq!(loaded, 2);
        let path = ResourcePath::parse("/1/1/1").unwrap();
        assert_eq!(tree.get(&path), Some(&json!(300)));
    }
}
