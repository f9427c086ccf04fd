//! Value containers and the converter chain that maps runtime values to and
//! from them.
//!
//! Dispatch is an explicit, ordered chain: every [`ValueConverter`] declares the
//! closed set of types it accepts, the first accepting converter wins (in
//! registration order), and types registered for reflection fall back to a
//! serde-driven field mapping. Types are named explicitly at registration; a
//! type name that cannot be resolved while decoding is a hard error.
//!
//! ```
//! use routine_fabric::serialization::{Format, ValueSerializer};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Order { id: u32, sku: String }
//!
//! let serializer = ValueSerializer::builder()
//!     .register::<Order>("shop.Order")
//!     .build()
//!     .unwrap();
//! let order = Order { id: 7, sku: "A-1".into() };
//! let state = serializer.serialize(&order, Format::Json).unwrap();
//! let back: Order = serializer.deserialize(&state).unwrap();
//! assert_eq!(back, order);
//! ```

mod container;
pub mod errors;
mod type_names;
mod waiters;

pub use container::ValueContainer;
pub use errors::{ErrorValue, InnerErrors, AGGREGATE_TYPE, GENERIC_ERROR_TYPE};
pub use type_names::{ShortenerChain, StaticShortener, TypeEntry, TypeNameShortener, TypeRegistry};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::correlation::{CancellationRegistry, CancellationSource, Trigger, TriggerRegistry};
use errors::{compose_error, has_error_shape, ErrorConverter};
use waiters::{CancellationConverter, TriggerConverter};

/// Field carrying the (possibly shortened) type name of an encoded value.
pub const TYPE_TAG: &str = "$type";

pub const ERROR_VALUE_TYPE: &str = "routine_fabric.ErrorValue";
pub const TRIGGER_TYPE: &str = "routine_fabric.Trigger";
pub const CANCELLATION_SOURCE_TYPE: &str = "routine_fabric.CancellationSource";
pub const TASK_RESULT_TYPE: &str = "routine_fabric.TaskResult";
pub const EXECUTION_STATE_TYPE: &str = "routine_fabric.MethodExecutionState";
pub const JOURNAL_TYPE: &str = "routine_fabric.Journal";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("missing field '{0}'")]
    MissingField(String),
    #[error("cannot decode field '{field}': {message}")]
    Decode { field: String, message: String },
    #[error("cannot encode field '{field}': {message}")]
    Encode { field: String, message: String },
    #[error("expected a named-field container, found {0}")]
    NotAContainer(&'static str),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("value type is not registered with the serializer")]
    UnregisteredType,
    #[error("value is not a {expected}")]
    TypeMismatch { expected: &'static str },
    #[error("type name '{0}' is registered for two different types")]
    DuplicateTypeName(String),
    #[error("unknown serialization format '{0}'")]
    UnknownFormat(String),
    #[error("encoded value has no '{TYPE_TAG}' tag")]
    MissingTypeTag,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Converts values of a closed set of types to and from value containers.
pub trait ValueConverter: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, type_id: TypeId) -> bool;

    fn decompose(&self, value: &dyn Any) -> Result<ValueContainer, SerializationError>;

    fn compose(&self, type_id: TypeId, container: &ValueContainer) -> Result<Box<dyn Any + Send>, SerializationError>;
}

/// Payload encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    /// JSON with full type names.
    #[default]
    Json,
    /// JSON with shortened type names where a shortener knows one.
    JsonCompact,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::JsonCompact => "json-compact",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, SerializationError> {
        match tag {
            "json" => Ok(Format::Json),
            "json-compact" => Ok(Format::JsonCompact),
            other => Err(SerializationError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized bytes tagged with their format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState {
    pub format: String,
    pub data: Vec<u8>,
}

/// A decomposed value together with its full type name.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub type_name: String,
    pub fields: ValueContainer,
}

pub struct ValueSerializer {
    types: Arc<TypeRegistry>,
    converters: Vec<Arc<dyn ValueConverter>>,
    shorteners: ShortenerChain,
    triggers: TriggerRegistry,
    cancellations: CancellationRegistry,
}

impl Default for ValueSerializer {
    fn default() -> Self {
        ValueSerializerBuilder::default().assemble()
    }
}

impl fmt::Debug for ValueSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueSerializer")
            .field("types", &self.types.len())
            .field("converters", &self.converters.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ValueSerializer {
    pub fn builder() -> ValueSerializerBuilder {
        ValueSerializerBuilder::default()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn trigger_registry(&self) -> &TriggerRegistry {
        &self.triggers
    }

    pub fn cancellation_registry(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    fn converter_for(&self, type_id: TypeId) -> Option<&Arc<dyn ValueConverter>> {
        self.converters.iter().find(|c| c.accepts(type_id))
    }

    pub fn decompose(&self, value: &dyn Any) -> Result<TypedValue, SerializationError> {
        let type_id = value.type_id();
        let entry = self.types.by_type(type_id).ok_or(SerializationError::UnregisteredType)?;
        let fields = match self.converter_for(type_id) {
            Some(converter) => converter.decompose(value)?,
            None => {
                let decompose = entry.decompose.ok_or(SerializationError::UnregisteredType)?;
                decompose(value)?
            }
        };
        Ok(TypedValue {
            type_name: entry.full_name.clone(),
            fields,
        })
    }

    /// Rebuild a value from its type token and fields.
    ///
    /// An error whose type is unknown here still composes, as a generic
    /// [`ErrorValue`] keeping the original type name and message.
    pub fn compose(&self, typed: &TypedValue) -> Result<Box<dyn Any + Send>, SerializationError> {
        let entry = match self.resolve_type(&typed.type_name) {
            Ok(entry) => entry,
            Err(SerializationError::UnknownType(token)) if has_error_shape(&typed.fields) => {
                tracing::debug!(target: "routine_fabric::serialization", type_name = %token, "unknown error type; composing a generic error value");
                return Ok(Box::new(compose_error(&typed.fields)?));
            }
            Err(e) => return Err(e),
        };
        match self.converter_for(entry.type_id) {
            Some(converter) => converter.compose(entry.type_id, &typed.fields),
            None => {
                let compose = entry.compose.ok_or(SerializationError::UnregisteredType)?;
                compose(&typed.fields)
            }
        }
    }

    pub fn compose_as<T: Any>(&self, typed: &TypedValue) -> Result<T, SerializationError> {
        downcast(self.compose(typed)?)
    }

    /// Resolve a type token: shortener chain first, then full names.
    pub fn resolve_type(&self, token: &str) -> Result<&TypeEntry, SerializationError> {
        if let Some(entry) = self.shorteners.expand(token).and_then(|full| self.types.by_name(&full)) {
            return Ok(entry);
        }
        self.types
            .by_name(token)
            .ok_or_else(|| SerializationError::UnknownType(token.to_string()))
    }

    fn type_token(&self, full_name: &str, format: Format) -> String {
        match format {
            Format::Json => full_name.to_string(),
            Format::JsonCompact => self.shorteners.shorten(full_name).unwrap_or_else(|| full_name.to_string()),
        }
    }

    /// Encode into a self-describing JSON object `{"$type": .., fields..}`.
    pub fn encode(&self, value: &dyn Any, format: Format) -> Result<Value, SerializationError> {
        let typed = self.decompose(value)?;
        let mut tagged = ValueContainer::new().with_value(TYPE_TAG, Value::String(self.type_token(&typed.type_name, format)));
        for (name, field) in typed.fields.iter() {
            tagged.set(name, field.clone());
        }
        Ok(tagged.into_value())
    }

    pub fn decode(&self, value: &Value) -> Result<Box<dyn Any + Send>, SerializationError> {
        let mut fields = ValueContainer::from_value(value.clone())?;
        let token = match fields.remove(TYPE_TAG) {
            Some(Value::String(token)) => token,
            _ => return Err(SerializationError::MissingTypeTag),
        };
        self.compose(&TypedValue {
            type_name: token,
            fields,
        })
    }

    pub fn decode_as<T: Any>(&self, value: &Value) -> Result<T, SerializationError> {
        downcast(self.decode(value)?)
    }

    pub fn to_bytes(&self, value: &dyn Any, format: Format) -> Result<Vec<u8>, SerializationError> {
        let encoded = self.encode(value, format)?;
        serde_json::to_vec(&encoded).map_err(|e| SerializationError::Malformed(e.to_string()))
    }

    /// Both formats are JSON; they differ only in how type names are written,
    /// and decoding accepts either spelling.
    pub fn from_bytes(&self, bytes: &[u8], _format: Format) -> Result<Box<dyn Any + Send>, SerializationError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| SerializationError::Malformed(e.to_string()))?;
        self.decode(&value)
    }

    pub fn serialize<T: Any>(&self, value: &T, format: Format) -> Result<SerializedState, SerializationError> {
        Ok(SerializedState {
            format: format.as_str().to_string(),
            data: self.to_bytes(value, format)?,
        })
    }

    pub fn deserialize<T: Any>(&self, state: &SerializedState) -> Result<T, SerializationError> {
        let format = Format::parse(&state.format)?;
        downcast(self.from_bytes(&state.data, format)?)
    }

    /// Store `value` as an encoded field of `container`.
    pub fn insert_field(
        &self,
        container: &mut ValueContainer,
        name: impl Into<String>,
        value: &dyn Any,
        format: Format,
    ) -> Result<(), SerializationError> {
        let encoded = self.encode(value, format)?;
        container.set(name, encoded);
        Ok(())
    }

    /// Read a field written by [`insert_field`](Self::insert_field).
    pub fn field<T: Any>(&self, container: &ValueContainer, name: &str) -> Result<T, SerializationError> {
        let raw = container
            .get_raw(name)
            .ok_or_else(|| SerializationError::MissingField(name.to_string()))?;
        self.decode_as(raw)
    }
}

fn downcast<T: Any>(boxed: Box<dyn Any + Send>) -> Result<T, SerializationError> {
    boxed
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| SerializationError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}

/// Builder in the registry-builder style: registrations accumulate, errors are
/// reported by [`build`](Self::build).
#[derive(Default)]
pub struct ValueSerializerBuilder {
    types: TypeRegistry,
    converters: Vec<Arc<dyn ValueConverter>>,
    shorteners: Vec<Arc<dyn TypeNameShortener>>,
    triggers: Option<TriggerRegistry>,
    cancellations: Option<CancellationRegistry>,
    errors: Vec<SerializationError>,
}

impl ValueSerializerBuilder {
    /// Register a plain data type for field-reflecting conversion.
    pub fn register<T>(mut self, full_name: &str) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        if let Err(e) = self.types.insert(type_names::reflecting_entry::<T>(full_name)) {
            self.errors.push(e);
        }
        self
    }

    /// Register a type name only; a custom converter must accept the type.
    pub fn register_named<T: Any>(mut self, full_name: &str) -> Self {
        if let Err(e) = self.types.insert(type_names::named_entry::<T>(full_name)) {
            self.errors.push(e);
        }
        self
    }

    /// Register an error type that can be restored from its captured data.
    pub fn register_error<E>(mut self, full_name: &str) -> Self
    where
        E: std::error::Error + Serialize + DeserializeOwned + Send + 'static,
    {
        if let Err(e) = self.types.insert(type_names::error_entry::<E>(full_name)) {
            self.errors.push(e);
        }
        self
    }

    /// Custom converters are consulted before the built-in ones.
    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converters.push(converter);
        self
    }

    /// Custom shorteners are consulted before the built-in table.
    pub fn shortener(mut self, shortener: Arc<dyn TypeNameShortener>) -> Self {
        self.shorteners.push(shortener);
        self
    }

    /// Share correlation registries with the rest of a runtime.
    pub fn correlation(mut self, triggers: TriggerRegistry, cancellations: CancellationRegistry) -> Self {
        self.triggers = Some(triggers);
        self.cancellations = Some(cancellations);
        self
    }

    pub fn build(mut self) -> Result<ValueSerializer, SerializationError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        Ok(self.assemble())
    }

    fn assemble(self) -> ValueSerializer {
        let mut types = self.types;
        for entry in builtin_entries() {
            // Built-in names are namespaced; on a clash the earlier registration stays.
            let _ = types.insert(entry);
        }
        let types = Arc::new(types);
        let triggers = self.triggers.unwrap_or_default();
        let cancellations = self.cancellations.unwrap_or_default();

        let mut converters = self.converters;
        converters.push(Arc::new(ErrorConverter::new(types.clone())));
        converters.push(Arc::new(TriggerConverter::new(triggers.clone())));
        converters.push(Arc::new(CancellationConverter::new(cancellations.clone())));

        let mut shorteners = ShortenerChain::default();
        for s in self.shorteners {
            shorteners.push(s);
        }
        shorteners.push(Arc::new(builtin_shortener()));

        ValueSerializer {
            types,
            converters,
            shorteners,
            triggers,
            cancellations,
        }
    }
}

fn builtin_entries() -> Vec<TypeEntry> {
    use crate::intents::TaskResult;
    use crate::providers::MethodExecutionState;
    use crate::runtime::Journal;

    vec![
        type_names::named_entry::<ErrorValue>(ERROR_VALUE_TYPE),
        type_names::named_entry::<Arc<Trigger>>(TRIGGER_TYPE),
        type_names::named_entry::<Arc<CancellationSource>>(CANCELLATION_SOURCE_TYPE),
        type_names::reflecting_entry::<TaskResult>(TASK_RESULT_TYPE),
        type_names::reflecting_entry::<MethodExecutionState>(EXECUTION_STATE_TYPE),
        type_names::reflecting_entry::<Journal>(JOURNAL_TYPE),
    ]
}

fn builtin_shortener() -> StaticShortener {
    StaticShortener::new()
        .with(ERROR_VALUE_TYPE, "err")
        .with(TRIGGER_TYPE, "trig")
        .with(CANCELLATION_SOURCE_TYPE, "cts")
        .with(TASK_RESULT_TYPE, "result")
        .with(EXECUTION_STATE_TYPE, "state")
        .with(JOURNAL_TYPE, "journal")
}
