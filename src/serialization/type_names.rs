//! Portable type names.
//!
//! Every type that crosses a durable boundary is registered under an explicit,
//! stable full name (never `std::any::type_name`, which is not stable across
//! compiler versions). Shorteners map a known subset of full names to compact
//! tokens for the `json-compact` format.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use super::errors::ErrorValue;
use super::{SerializationError, ValueContainer};

/// Field used for values that do not serialize to a JSON object.
pub(crate) const SCALAR_FIELD: &str = "$value";

pub(crate) type DecomposeFn = fn(&dyn Any) -> Result<ValueContainer, SerializationError>;
pub(crate) type ComposeFn = fn(&ValueContainer) -> Result<Box<dyn Any + Send>, SerializationError>;
pub(crate) type CaptureErrorFn = fn(&dyn Any) -> Option<ErrorValue>;

/// One registered type.
#[derive(Clone)]
pub struct TypeEntry {
    pub type_id: TypeId,
    pub full_name: String,
    pub(crate) decompose: Option<DecomposeFn>,
    pub(crate) compose: Option<ComposeFn>,
    pub(crate) capture_error: Option<CaptureErrorFn>,
}

impl TypeEntry {
    pub fn is_error_type(&self) -> bool {
        self.capture_error.is_some()
    }

    pub fn is_reflectable(&self) -> bool {
        self.decompose.is_some() && self.compose.is_some()
    }
}

impl std::fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeEntry")
            .field("full_name", &self.full_name)
            .field("reflectable", &self.is_reflectable())
            .field("error", &self.is_error_type())
            .finish()
    }
}

/// Name ↔ type table shared by the serializer and its converters.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    by_id: HashMap<TypeId, TypeEntry>,
    by_name: HashMap<String, TypeId>,
}

impl TypeRegistry {
    pub(crate) fn insert(&mut self, entry: TypeEntry) -> Result<(), SerializationError> {
        if let Some(existing) = self.by_name.get(&entry.full_name) {
            if *existing != entry.type_id {
                return Err(SerializationError::DuplicateTypeName(entry.full_name));
            }
        }
        self.by_name.insert(entry.full_name.clone(), entry.type_id);
        self.by_id.insert(entry.type_id, entry);
        Ok(())
    }

    pub fn by_type(&self, type_id: TypeId) -> Option<&TypeEntry> {
        self.by_id.get(&type_id)
    }

    pub fn by_name(&self, full_name: &str) -> Option<&TypeEntry> {
        self.by_name.get(full_name).and_then(|id| self.by_id.get(id))
    }

    pub fn error_type_ids(&self) -> Vec<TypeId> {
        self.by_id
            .values()
            .filter(|e| e.is_error_type())
            .map(|e| e.type_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

pub(crate) fn named_entry<T: Any>(full_name: &str) -> TypeEntry {
    TypeEntry {
        type_id: TypeId::of::<T>(),
        full_name: full_name.to_string(),
        decompose: None,
        compose: None,
        capture_error: None,
    }
}

pub(crate) fn reflecting_entry<T>(full_name: &str) -> TypeEntry
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    TypeEntry {
        decompose: Some(reflect_decompose::<T>),
        compose: Some(reflect_compose::<T>),
        ..named_entry::<T>(full_name)
    }
}

pub(crate) fn error_entry<E>(full_name: &str) -> TypeEntry
where
    E: std::error::Error + Serialize + DeserializeOwned + Send + 'static,
{
    TypeEntry {
        capture_error: Some(capture_error::<E>),
        ..reflecting_entry::<E>(full_name)
    }
}

/// Field-reflecting decomposition through serde: objects map field-by-field,
/// anything else lands in a single scalar field.
fn reflect_decompose<T: Serialize + 'static>(value: &dyn Any) -> Result<ValueContainer, SerializationError> {
    let typed = value
        .downcast_ref::<T>()
        .ok_or(SerializationError::TypeMismatch { expected: std::any::type_name::<T>() })?;
    let encoded = serde_json::to_value(typed).map_err(|e| SerializationError::Encode {
        field: String::new(),
        message: e.to_string(),
    })?;
    Ok(match encoded {
        Value::Object(map) => map.into_iter().collect(),
        scalar => ValueContainer::new().with_value(SCALAR_FIELD, scalar),
    })
}

fn reflect_compose<T: DeserializeOwned + Send + 'static>(
    container: &ValueContainer,
) -> Result<Box<dyn Any + Send>, SerializationError> {
    let source = match container.get_raw(SCALAR_FIELD) {
        Some(scalar) if container.len() == 1 => scalar.clone(),
        _ => container.clone().into_value(),
    };
    let typed: T = serde_json::from_value(source).map_err(|e| SerializationError::Decode {
        field: String::new(),
        message: e.to_string(),
    })?;
    Ok(Box::new(typed))
}

fn capture_error<E: std::error::Error + 'static>(value: &dyn Any) -> Option<ErrorValue> {
    value.downcast_ref::<E>().map(|e| ErrorValue::from_error(e))
}

/// Maps a subset of full type names to compact tokens and back.
pub trait TypeNameShortener: Send + Sync {
    fn try_shorten(&self, full_name: &str) -> Option<String>;
    fn try_expand(&self, short_name: &str) -> Option<String>;
}

/// Fixed table of `(full name, token)` pairs.
#[derive(Debug, Default, Clone)]
pub struct StaticShortener {
    pairs: Vec<(String, String)>,
}

impl StaticShortener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, full_name: impl Into<String>, token: impl Into<String>) -> Self {
        self.pairs.push((full_name.into(), token.into()));
        self
    }
}

impl TypeNameShortener for StaticShortener {
    fn try_shorten(&self, full_name: &str) -> Option<String> {
        self.pairs.iter().find(|(f, _)| f == full_name).map(|(_, s)| s.clone())
    }

    fn try_expand(&self, short_name: &str) -> Option<String> {
        self.pairs.iter().find(|(_, s)| s == short_name).map(|(f, _)| f.clone())
    }
}

/// Ordered shortener chain; the first shortener that knows a name wins.
#[derive(Clone, Default)]
pub struct ShortenerChain {
    links: Vec<Arc<dyn TypeNameShortener>>,
}

impl ShortenerChain {
    pub(crate) fn push(&mut self, shortener: Arc<dyn TypeNameShortener>) {
        self.links.push(shortener);
    }

    pub fn shorten(&self, full_name: &str) -> Option<String> {
        self.links.iter().find_map(|s| s.try_shorten(full_name))
    }

    pub fn expand(&self, token: &str) -> Option<String> {
        self.links.iter().find_map(|s| s.try_expand(token))
    }
}
