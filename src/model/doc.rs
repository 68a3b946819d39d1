//! Raw document representation
//!
//! Documents are schemaless JSON objects with a handful of well-known fields.
//! The store never interprets attributes beyond those fields, so a `Doc` is a
//! thin wrapper over a JSON map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Ref, Timestamp};
use crate::error::{Result, SyncError};

pub const ID: &str = "_id";
pub const CLASS: &str = "_class";
pub const SPACE: &str = "space";
pub const MODIFIED_ON: &str = "modifiedOn";
pub const MODIFIED_BY: &str = "modifiedBy";
pub const CREATED_BY: &str = "createdBy";
pub const CREATED_ON: &str = "createdOn";
pub const ATTACHED_TO: &str = "attachedTo";
pub const ATTACHED_TO_CLASS: &str = "attachedToClass";
pub const COLLECTION: &str = "collection";
pub const LOOKUP: &str = "$lookup";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Doc(pub Map<String, Value>);

impl Doc {
    pub fn new(id: &str, class: &str, space: &str) -> Self {
        let mut map = Map::new();
        map.insert(ID.to_string(), Value::String(id.to_string()));
        map.insert(CLASS.to_string(), Value::String(class.to_string()));
        map.insert(SPACE.to_string(), Value::String(space.to_string()));
        Doc(map)
    }

    /// Wrap a JSON value; anything but an object is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Doc(map)),
            other => Err(SyncError::Store(format!("document must be an object, got {}", other))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field(ID)
    }

    pub fn class(&self) -> Option<&str> {
        self.str_field(CLASS)
    }

    pub fn space(&self) -> Option<&str> {
        self.str_field(SPACE)
    }

    pub fn created_by(&self) -> Option<&str> {
        self.str_field(CREATED_BY)
    }

    pub fn modified_by(&self) -> Option<&str> {
        self.str_field(MODIFIED_BY)
    }

    pub fn attached_to_class(&self) -> Option<&str> {
        self.str_field(ATTACHED_TO_CLASS)
    }

    pub fn modified_on(&self) -> Timestamp {
        self.0.get(MODIFIED_ON).and_then(Value::as_i64).unwrap_or(0)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Resolve a possibly dotted attribute path (`a.b.c`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        set_path(&mut self.0, key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Stable content hash used by backup chunking and domain hashes.
    ///
    /// `serde_json::Map` keeps keys sorted, so the encoding is canonical.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.0).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Approximate encoded size in bytes
    pub fn size(&self) -> usize {
        serde_json::to_vec(&self.0).map(|b| b.len()).unwrap_or(0)
    }

    /// Apply update operations of a `TxUpdateDoc`.
    ///
    /// Plain keys are assigned; `$inc`, `$push`, `$pull` and `$unset` take a
    /// map of attribute paths.
    pub fn apply_update(&mut self, operations: &Map<String, Value>) {
        for (key, value) in operations {
            match key.as_str() {
                "$inc" => {
                    for (attr, delta) in value.as_object().into_iter().flatten() {
                        let current = self.get(attr).and_then(Value::as_f64).unwrap_or(0.0);
                        let delta = delta.as_f64().unwrap_or(0.0);
                        self.set(attr, number(current + delta));
                    }
                }
                "$push" => {
                    for (attr, item) in value.as_object().into_iter().flatten() {
                        let mut items = self
                            .get(attr)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        items.push(item.clone());
                        self.set(attr, Value::Array(items));
                    }
                }
                "$pull" => {
                    for (attr, item) in value.as_object().into_iter().flatten() {
                        if let Some(items) = self.get(attr).and_then(Value::as_array).cloned() {
                            let kept = items.into_iter().filter(|v| v != item).collect();
                            self.set(attr, Value::Array(kept));
                        }
                    }
                }
                "$unset" => {
                    for attr in value.as_object().into_iter().flatten().map(|(k, _)| k) {
                        unset_path(&mut self.0, attr);
                    }
                }
                _ => self.set(key, value.clone()),
            }
        }
    }

    /// Mixin attributes are stored under the mixin id.
    pub fn apply_mixin(&mut self, mixin: &str, attributes: &Map<String, Value>) {
        let entry = self
            .0
            .entry(mixin.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(target) = entry {
            for (k, v) in attributes {
                target.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn touch(&mut self, modified_by: &Ref, modified_on: Timestamp) {
        self.0.insert(MODIFIED_BY.to_string(), Value::String(modified_by.clone()));
        self.0.insert(MODIFIED_ON.to_string(), Value::from(modified_on));
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

fn unset_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = map.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod doc_tests {
    use super::*;
    use serde_json::json;

    fn ops(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_well_known_fields() {
        let mut doc = Doc::new("d1", "tracker:class:Issue", "space-1");
        doc.set(CREATED_BY, json!("alice"));

        assert_eq!(doc.id(), Some("d1"));
        assert_eq!(doc.class(), Some("tracker:class:Issue"));
        assert_eq!(doc.space(), Some("space-1"));
        assert_eq!(doc.created_by(), Some("alice"));
        assert_eq!(doc.attached_to_class(), None);
    }

    #[test]
    fn test_apply_update_operators() {
        let mut doc = Doc::new("d1", "c", "s");
        doc.set("count", json!(1));
        doc.set("labels", json!(["a", "b"]));

        doc.apply_update(&ops(json!({
            "title": "Hello",
            "$inc": { "count": 2 },
            "$push": { "labels": "c" },
            "$pull": { "labels": "a" },
        })));

        assert_eq!(doc.get("title"), Some(&json!("Hello")));
        assert_eq!(doc.get("count"), Some(&json!(3)));
        assert_eq!(doc.get("labels"), Some(&json!(["b", "c"])));

        doc.apply_update(&ops(json!({ "$unset": { "title": "" } })));
        assert_eq!(doc.get("title"), None);
    }

    #[test]
    fn test_dotted_paths() {
        let mut doc = Doc::new("d1", "c", "s");
        doc.set("settings.theme.color", json!("dark"));
        assert_eq!(doc.get("settings.theme.color"), Some(&json!("dark")));
        assert_eq!(doc.get("settings.missing"), None);
    }

    #[test]
    fn test_apply_mixin() {
        let mut doc = Doc::new("d1", "c", "s");
        doc.apply_mixin("crm:mixin:Customer", &ops(json!({ "tier": "gold" })));
        doc.apply_mixin("crm:mixin:Customer", &ops(json!({ "since": 2020 })));
        assert_eq!(doc.get("crm:mixin:Customer.tier"), Some(&json!("gold")));
        assert_eq!(doc.get("crm:mixin:Customer.since"), Some(&json!(2020)));
    }

    #[test]
    fn test_content_hash_is_key_order_independent() {
        let a = Doc::from_value(json!({ "_id": "x", "a": 1, "b": 2 })).unwrap();
        let b = Doc::from_value(json!({ "b": 2, "a": 1, "_id": "x" })).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let c = Doc::from_value(json!({ "_id": "x", "a": 1, "b": 3 })).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        assert!(Doc::from_value(json!([1, 2])).is_err());
    }
}
