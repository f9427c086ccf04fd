//! Execution state storage.
//!
//! A storage keeps two things per routine attempt: the suspended
//! [`MethodExecutionState`] (overwritten under optimistic concurrency) and the
//! terminal [`TaskResult`] (written once, retained).
//!
//! Every operation is a plain future; dropping it abandons the operation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::correlation::CancellationTokenSourceState;
use crate::descriptors::{CallerDescriptor, ContinuationDescriptor, MethodId, PersistedMethodId, ServiceId};
use crate::intents::{FlowContext, TaskResult};
use crate::serialization::{SerializedState, ValueContainer};

pub mod error;
pub use error::{StorageError, StorageErrorKind};

/// In-memory storage for tests and single-process hosts.
pub mod in_memory;
/// Filesystem-backed storage for local development.
pub mod fs;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs::FsStorage;
pub use in_memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// Snapshot of a suspended routine attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodExecutionState {
    pub service: ServiceId,
    /// Attempt identity; `etag` is the token the snapshot was read with.
    pub method: PersistedMethodId,
    #[serde(default)]
    pub flow_context: FlowContext,
    #[serde(default)]
    pub parameters: ValueContainer,
    /// Method-local state: the decomposed journal and cancellation source.
    #[serde(default)]
    pub method_state: ValueContainer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    /// Caller state handed over by a caller that did not write its own storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_state: Option<SerializedState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
}

impl MethodExecutionState {
    pub fn new(service: ServiceId, method: PersistedMethodId) -> Self {
        Self {
            service,
            method,
            flow_context: FlowContext::new(),
            parameters: ValueContainer::new(),
            method_state: ValueContainer::new(),
            continuation: None,
            caller_state: None,
            caller: None,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.method.etag.as_deref()
    }

    /// Cancellation source state recorded in the method-local state, if any.
    pub fn cancellation(&self) -> Option<CancellationTokenSourceState> {
        let fields = self.method_state.get_raw("cancellation")?;
        Some(CancellationTokenSourceState {
            id: fields.get("id")?.as_str()?.to_string(),
            cancel_requested_at_ms: fields.get("cancel_requested_at_ms").and_then(|v| v.as_u64()),
        })
    }
}

/// Durable storage for routine state and outcomes.
///
/// Implementations must be safe to share between concurrent attempts; two writers
/// of the same attempt are serialized by the etag alone.
#[async_trait]
pub trait MethodStateStorage: Send + Sync {
    /// Store `state` for the attempt and return the new etag.
    ///
    /// `method.etag` must equal the stored token (`None` when nothing is stored
    /// yet); otherwise the write fails with [`StorageErrorKind::ConcurrencyConflict`].
    async fn write_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
        state: &MethodExecutionState,
    ) -> Result<String, StorageError>;

    /// Latest state of the attempt, carrying its current etag in `method.etag`.
    async fn read_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
    ) -> Result<Option<MethodExecutionState>, StorageError>;

    /// Record the outcome. The first result wins; later writes succeed without effect.
    async fn write_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
        result: &TaskResult,
    ) -> Result<(), StorageError>;

    async fn try_read_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<TaskResult>, StorageError>;

    /// Backend name for logs.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Storage key of one attempt.
pub(crate) fn attempt_key(service: &ServiceId, method: &str, intent_id: &str) -> String {
    format!("{service}.{method}#{intent_id}")
}

pub(crate) fn log_ignored_result(backend: &str, key: &str, stored: &TaskResult, rejected: &TaskResult) {
    if stored != rejected {
        tracing::warn!(
            target: "routine_fabric::providers",
            backend,
            key,
            stored = stored.kind(),
            rejected = rejected.kind(),
            "result already recorded; ignoring a different later result"
        );
    }
}
