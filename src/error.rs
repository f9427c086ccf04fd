//! Engine error taxonomy.
//!
//! User faults and cancellation are outcomes (`TaskResult`), never engine errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fabric::FabricError;
use crate::providers::StorageError;
use crate::serialization::SerializationError;

/// A logical address could not be mapped to a definition. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("service '{service}' has no method '{method}'")]
    UnknownMethod { service: String, method: String },
    #[error("service '{service}' does not publish event '{event}'")]
    UnknownEvent { service: String, event: String },
    #[error("method '{service}.{method}' is ambiguous between {candidates:?}")]
    AmbiguousMethod {
        service: String,
        method: String,
        candidates: Vec<String>,
    },
    #[error("service '{0}' is not hosted by this runtime")]
    NotHostedLocally(String),
    #[error("event '{event}' is missing parameter '{parameter}'")]
    MissingEventParameter { event: String, parameter: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// The state of `key` kept changing under this runtime; the retry budget ran out.
    #[error("concurrency conflict on {key} after {attempts} attempts")]
    ConcurrencyConflict { key: String, attempts: u32 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error("nondeterministic replay of {key}: {message}")]
    Nondeterminism { key: String, message: String },
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl EngineError {
    /// Whether retrying the same request may succeed. The core itself retries only
    /// concurrency conflicts; the rest is for hosts and transports to decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Storage(e) => e.is_retryable(),
            EngineError::Transport(_) | EngineError::ConcurrencyConflict { .. } | EngineError::Timeout(_) => true,
            _ => false,
        }
    }
}
