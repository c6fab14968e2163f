//! # Entity and Mutation
//! Values are JSON trees shared behind an `Arc`, so handing a value to an observer or keeping it in
//! a cache snapshot never copies it. A `null` value means "nothing stored here".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

#[derive(Clone, Default, PartialEq)]
pub struct Entity(Arc<Value>);

impl Entity {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Looks up a nested child by `/`-separated key, e.g. `"author/name"`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self.value(), |node, segment| node.get(segment))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Value> for Entity {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl serde::Serialize for Entity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Entity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Entity::new)
    }
}

/// Remote revision stamp. Only ever produced by the remote store.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Client-assigned sequence number of a local write.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct LocalSeq(pub u64);

impl fmt::Display for LocalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Overwrite the whole value at the path.
    Replace { value: Value },
    /// Update individual children. Keys are relative paths (`"a/b"` reaches a nested child) and a
    /// `null` value removes that child.
    Patch { fields: BTreeMap<String, Value> },
    Delete,
}

impl Mutation {
    pub fn replace(value: impl Into<Value>) -> Self {
        Mutation::Replace {
            value: value.into(),
        }
    }

    pub fn patch<K: Into<String>, V: Into<Value>>(fields: impl IntoIterator<Item = (K, V)>) -> Self {
        Mutation::Patch {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn apply(&self, base: &Entity) -> Entity {
        match self {
            Mutation::Replace { value } => Entity::new(value.clone()),
            Mutation::Delete => Entity::null(),
            Mutation::Patch { fields } => {
                let mut root = match base.value() {
                    Value::Object(map) => Value::Object(map.clone()),
                    _ => Value::Object(Map::new()),
                };
                for (key, value) in fields {
                    let segments: Vec<&str> =
                        key.split('/').filter(|segment| !segment.is_empty()).collect();
                    set_at(&mut root, &segments, value.clone());
                }
                if is_empty(&root) {
                    return Entity::null();
                }
                Entity::new(root)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Replace { .. } => "replace",
            Mutation::Patch { .. } => "patch",
            Mutation::Delete => "delete",
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn set_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    if rest.is_empty() {
        if value.is_null() {
            map.remove(*first);
        } else {
            map.insert((*first).to_string(), value);
        }
        return;
    }

    let child = map.entry((*first).to_string()).or_insert(Value::Null);
    set_at(child, rest, value);
    if is_empty(child) {
        map.remove(*first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_and_delete() {
        let base = Entity::new(json!({"title": "Hello"}));
        assert_eq!(Mutation::replace("Hi").apply(&base), Entity::new(json!("Hi")));
        assert!(Mutation::Delete.apply(&base).is_null());
    }

    #[test]
    fn patch_merges_and_removes() {
        let base = Entity::new(json!({"name": "Asha", "visits": 2, "risk": "low"}));
        let patched = Mutation::patch([("visits", json!(3)), ("risk", Value::Null)]).apply(&base);
        assert_eq!(patched, Entity::new(json!({"name": "Asha", "visits": 3})));
    }

    #[test]
    fn patch_nested_keys() {
        let base = Entity::new(json!({"author": {"name": "a", "id": 1}}));
        let patched =
            Mutation::patch([("author/name", json!("b")), ("meta/tags/0", json!("x"))]).apply(&base);
        assert_eq!(
            patched,
            Entity::new(json!({"author": {"name": "b", "id": 1}, "meta": {"tags": {"0": "x"}}}))
        );
        assert_eq!(patched.get_str("author/name"), Some("b"));
    }

    #[test]
    fn patch_over_scalar_starts_fresh() {
        let base = Entity::new(json!("just a string"));
        let patched = Mutation::patch([("a", json!(1))]).apply(&base);
        assert_eq!(patched, Entity::new(json!({"a": 1})));
    }

    #[test]
    fn emptied_object_collapses_to_null() {
        let base = Entity::new(json!({"only": {"leaf": true}}));
        let patched = Mutation::patch([("only/leaf", Value::Null)]).apply(&base);
        assert!(patched.is_null());
    }

    #[test]
    fn mutation_json_shape() {
        let json = serde_json::to_value(Mutation::replace("Hi")).unwrap();
        assert_eq!(json, json!({"op": "replace", "value": "Hi"}));
        let back: Mutation = serde_json::from_value(json!({"op": "delete"})).unwrap();
        assert_eq!(back, Mutation::Delete);
    }
}
