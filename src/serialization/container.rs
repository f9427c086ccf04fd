use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use super::SerializationError;

/// Flat, ordered, named-field stand-in for a runtime value.
///
/// Field order is preserved through serde, so a container written and read back
/// produces identical bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueContainer {
    fields: Vec<(String, Value)>,
}

impl ValueContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of an already encoded field.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Builder-style insert of any serde value.
    ///
    /// A value that fails to serialize is logged and left out, so reading the
    /// field back reports it missing. Use [`try_with`](Self::try_with) to get the error.
    pub fn with<T: Serialize>(mut self, name: impl Into<String>, value: T) -> Self {
        let name = name.into();
        if let Err(e) = self.insert(name.clone(), &value) {
            tracing::warn!(target: "routine_fabric::serialization", field = %name, error = %e, "field left out of the container");
        }
        self
    }

    /// Builder-style insert that reports serialization failures.
    pub fn try_with<T: Serialize>(mut self, name: impl Into<String>, value: T) -> Result<Self, SerializationError> {
        self.insert(name, &value)?;
        Ok(self)
    }

    pub fn insert<T: Serialize>(&mut self, name: impl Into<String>, value: &T) -> Result<(), SerializationError> {
        let name = name.into();
        let encoded = serde_json::to_value(value).map_err(|e| SerializationError::Encode {
            field: name.clone(),
            message: e.to_string(),
        })?;
        self.set(name, encoded);
        Ok(())
    }

    /// Replace the field if present, otherwise append it.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn get_raw(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, SerializationError> {
        let raw = self
            .get_raw(name)
            .ok_or_else(|| SerializationError::MissingField(name.to_string()))?;
        serde_json::from_value(raw.clone()).map_err(|e| SerializationError::Decode {
            field: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Like `get`, but a missing or null field yields `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SerializationError> {
        match self.get_raw(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_raw(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields.into_iter().collect())
    }

    pub fn from_value(value: Value) -> Result<Self, SerializationError> {
        match value {
            Value::Object(map) => Ok(Self {
                fields: map.into_iter().collect(),
            }),
            other => Err(SerializationError::NotAContainer(type_label(&other))),
        }
    }
}

impl FromIterator<(String, Value)> for ValueContainer {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut container = ValueContainer::new();
        for (name, value) in iter {
            container.set(name, value);
        }
        container
    }
}

impl Serialize for ValueContainer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ValueContainer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ContainerVisitor;

        impl<'de> Visitor<'de> for ContainerVisitor {
            type Value = ValueContainer;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of named fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    fields.push((name, value));
                }
                Ok(ValueContainer { fields })
            }
        }

        deserializer.deserialize_map(ContainerVisitor)
    }
}

pub(crate) fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_field_order_through_json() {
        let container = ValueContainer::new()
            .with("zeta", 1)
            .with("alpha", "two")
            .with("mid", json!({"k": [1, 2]}));
        let text = serde_json::to_string(&container).unwrap();
        assert_eq!(text, r#"{"zeta":1,"alpha":"two","mid":{"k":[1,2]}}"#);
        let back: ValueContainer = serde_json::from_str(&text).unwrap();
        assert_eq!(back, container);
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn typed_access_reports_missing_and_malformed_fields() {
        let container = ValueContainer::new().with("count", 3).with("name", "x");
        assert_eq!(container.get::<u32>("count").unwrap(), 3);
        assert!(matches!(
            container.get::<u32>("absent"),
            Err(SerializationError::MissingField(f)) if f == "absent"
        ));
        assert!(matches!(container.get::<u32>("name"), Err(SerializationError::Decode { .. })));
        assert_eq!(container.get_opt::<u32>("absent").unwrap(), None);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut container = ValueContainer::new().with("a", 1).with("b", 2);
        container.set("a", json!(10));
        assert_eq!(container.len(), 2);
        assert_eq!(container.get::<i32>("a").unwrap(), 10);
        assert_eq!(container.remove("b"), Some(json!(2)));
        assert!(!container.contains("b"));
    }

    #[test]
    fn unserializable_fields_are_left_out() {
        let mut by_pair = std::collections::HashMap::new();
        by_pair.insert((1u8, 2u8), 3u8);

        let container = ValueContainer::new().with("ok", 1).with("pairs", &by_pair);
        assert!(!container.contains("pairs"));
        assert!(matches!(
            container.get::<u32>("pairs"),
            Err(SerializationError::MissingField(f)) if f == "pairs"
        ));
        assert_eq!(container.get::<u32>("ok").unwrap(), 1);

        let failed = ValueContainer::new().try_with("pairs", &by_pair);
        assert!(matches!(failed, Err(SerializationError::Encode { field, .. }) if field == "pairs"));
    }
}
