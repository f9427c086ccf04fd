//! Portable error values.
//!
//! A routine fault crosses process boundaries as an [`ErrorValue`]: type name,
//! message, stack text and causes. Rebuilding never runs constructors; typed
//! errors registered with the serializer are restored from their captured data,
//! everything else degrades to a generic `ErrorValue` that keeps the original
//! type name and message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use super::type_names::TypeRegistry;
use super::{SerializationError, ValueContainer, ValueConverter};

/// Type name used when no better name is known.
pub const GENERIC_ERROR_TYPE: &str = "error";

/// Causes attached to an error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "errors", rename_all = "snake_case")]
pub enum InnerErrors {
    #[default]
    None,
    Single(Box<ErrorValue>),
    /// Flattened list of causes of an aggregate error.
    Aggregate(Vec<ErrorValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub inner: InnerErrors,
}

impl ErrorValue {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: None,
            inner: InnerErrors::None,
        }
    }

    /// Error with no particular type, e.g. a plain string failure.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(GENERIC_ERROR_TYPE, message)
    }

    /// An aggregate whose causes are flattened: nested aggregates contribute their
    /// own causes rather than themselves.
    pub fn aggregate(type_name: impl Into<String>, message: impl Into<String>, causes: Vec<ErrorValue>) -> Self {
        let mut flat = Vec::with_capacity(causes.len());
        for cause in causes {
            match cause.inner {
                InnerErrors::Aggregate(nested) if cause.type_name == AGGREGATE_TYPE => flat.extend(nested),
                _ => flat.push(cause),
            }
        }
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: None,
            inner: InnerErrors::Aggregate(flat),
        }
    }

    pub fn with_stack_trace(mut self, stack: impl Into<String>) -> Self {
        self.stack_trace = Some(stack.into());
        self
    }

    pub fn with_inner(mut self, inner: ErrorValue) -> Self {
        self.inner = InnerErrors::Single(Box::new(inner));
        self
    }

    /// Capture an error and its `source()` chain as nested single causes.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut value = Self::new(short_type_label(error), error.to_string());
        if let Some(source) = error.source() {
            value.inner = InnerErrors::Single(Box::new(Self::from_error(source)));
        }
        value
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.inner, InnerErrors::Aggregate(_))
    }

    pub fn causes(&self) -> Vec<&ErrorValue> {
        match &self.inner {
            InnerErrors::None => Vec::new(),
            InnerErrors::Single(e) => vec![e.as_ref()],
            InnerErrors::Aggregate(list) => list.iter().collect(),
        }
    }
}

/// Conventional type name of aggregate errors.
pub const AGGREGATE_TYPE: &str = "aggregate";

fn short_type_label(error: &dyn std::error::Error) -> String {
    // Debug output of most errors starts with the type or variant name.
    let debug = format!("{error:?}");
    let label: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if label.is_empty() {
        GENERIC_ERROR_TYPE.to_string()
    } else {
        label
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for ErrorValue {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            InnerErrors::None => None,
            InnerErrors::Single(e) => Some(e.as_ref()),
            InnerErrors::Aggregate(list) => list.first().map(|e| e as &(dyn std::error::Error + 'static)),
        }
    }
}

/// Converter for [`ErrorValue`] and every error type registered with
/// `register_error`.
pub(crate) struct ErrorConverter {
    types: Arc<TypeRegistry>,
    error_types: Vec<TypeId>,
}

impl ErrorConverter {
    pub(crate) fn new(types: Arc<TypeRegistry>) -> Self {
        let mut error_types = types.error_type_ids();
        error_types.push(TypeId::of::<ErrorValue>());
        Self { types, error_types }
    }
}

pub(crate) fn decompose_error(error: &ErrorValue) -> ValueContainer {
    let mut container = ValueContainer::new()
        .with_value("type", Value::String(error.type_name.clone()))
        .with_value("message", Value::String(error.message.clone()));
    if let Some(stack) = &error.stack_trace {
        container.set("stack", Value::String(stack.clone()));
    }
    match &error.inner {
        InnerErrors::None => {}
        InnerErrors::Single(inner) => container.set("inner", decompose_error(inner).into_value()),
        InnerErrors::Aggregate(list) => container.set(
            "inners",
            Value::Array(list.iter().map(|e| decompose_error(e).into_value()).collect()),
        ),
    }
    container
}

const ERROR_FIELDS: [&str; 6] = ["type", "message", "stack", "inner", "inners", "data"];

/// Whether decomposed fields look like an error: a type name, a message and
/// nothing but the other error fields.
pub(crate) fn has_error_shape(fields: &ValueContainer) -> bool {
    matches!(fields.get_raw("type"), Some(Value::String(_)))
        && matches!(fields.get_raw("message"), Some(Value::String(_)))
        && fields.names().all(|name| ERROR_FIELDS.contains(&name))
}

pub(crate) fn compose_error(container: &ValueContainer) -> Result<ErrorValue, SerializationError> {
    let type_name = container
        .get_opt::<String>("type")?
        .unwrap_or_else(|| GENERIC_ERROR_TYPE.to_string());
    let message = container.get_opt::<String>("message")?.unwrap_or_default();
    let mut error = ErrorValue::new(type_name, message);
    error.stack_trace = container.get_opt::<String>("stack")?;
    if let Some(inner) = container.get_raw("inner").filter(|v| !v.is_null()) {
        let nested = ValueContainer::from_value(inner.clone())?;
        error.inner = InnerErrors::Single(Box::new(compose_error(&nested)?));
    } else if let Some(Value::Array(list)) = container.get_raw("inners") {
        let mut causes = Vec::with_capacity(list.len());
        for item in list {
            causes.push(compose_error(&ValueContainer::from_value(item.clone())?)?);
        }
        error.inner = InnerErrors::Aggregate(causes);
    }
    Ok(error)
}

impl ValueConverter for ErrorConverter {
    fn name(&self) -> &'static str {
        "error"
    }

    fn accepts(&self, type_id: TypeId) -> bool {
        self.error_types.contains(&type_id)
    }

    fn decompose(&self, value: &dyn Any) -> Result<ValueContainer, SerializationError> {
        if let Some(error) = value.downcast_ref::<ErrorValue>() {
            return Ok(decompose_error(error));
        }
        let entry = self
            .types
            .by_type(value.type_id())
            .ok_or(SerializationError::UnregisteredType)?;
        let captured = entry
            .capture_error
            .and_then(|capture| capture(value))
            .ok_or(SerializationError::TypeMismatch { expected: "registered error type" })?;
        let mut container = decompose_error(&ErrorValue {
            type_name: entry.full_name.clone(),
            ..captured
        });
        if let Some(decompose) = entry.decompose {
            container.set("data", decompose(value)?.into_value());
        }
        Ok(container)
    }

    fn compose(&self, type_id: TypeId, container: &ValueContainer) -> Result<Box<dyn Any + Send>, SerializationError> {
        if type_id != TypeId::of::<ErrorValue>() {
            if let (Some(entry), Some(data)) = (self.types.by_type(type_id), container.get_raw("data")) {
                if let Some(compose) = entry.compose {
                    match ValueContainer::from_value(data.clone()).and_then(|c| compose(&c)) {
                        Ok(original) => return Ok(original),
                        Err(e) => tracing::debug!(
                            target: "routine_fabric::serialization",
                            type_name = %entry.full_name,
                            error = %e,
                            "typed error could not be restored; degrading to ErrorValue"
                        ),
                    }
                }
            }
        }
        Ok(Box::new(compose_error(container)?))
    }
}
