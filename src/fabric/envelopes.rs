//! Wire envelopes exchanged between runtimes.
//!
//! Envelopes are plain serde structs encoded as JSON. Results travel as a
//! [`ValueContainer`] produced by the value serializer, so faults keep their
//! error type names across the boundary.

use serde::{Deserialize, Serialize};

use super::FabricError;
use crate::descriptors::{CallerDescriptor, ContinuationDescriptor, MethodId, PersistedMethodId, ServiceId};
use crate::error::{EngineError, ResolutionError};
use crate::intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent, FlowContext, TaskResult};
use crate::providers::StorageError;
use crate::serialization::{Format, SerializationError, SerializedState, ValueContainer, ValueSerializer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeEnvelope {
    pub service: ServiceId,
    pub method: MethodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    pub intent_id: String,
    #[serde(default)]
    pub flow_context: FlowContext,
    #[serde(default)]
    pub parameters: ValueContainer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_state_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_state_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueEnvelope {
    pub service: ServiceId,
    pub method: PersistedMethodId,
    /// Attempt that produced the result.
    pub intent_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    pub result: ValueContainer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_state_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_state_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollEnvelope {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelEnvelope {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireEnvelope {
    Invoke(InvokeEnvelope),
    Continue(ContinueEnvelope),
    Poll(PollEnvelope),
    Cancel(CancelEnvelope),
}

/// An engine error raised by the remote runtime, classified so the caller
/// rebuilds the same kind of error and keeps its retry semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RemoteError {
    Resolution(ResolutionError),
    Fabric(FabricError),
    Conflict { key: String, attempts: u32 },
    Nondeterminism { key: String, message: String },
    Invariant(String),
    Storage { retryable: bool, message: String },
    Serialization(String),
    Config(String),
    Timeout(String),
    Transport(String),
}

impl From<&EngineError> for RemoteError {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::Resolution(e) => RemoteError::Resolution(e.clone()),
            EngineError::Fabric(e) => RemoteError::Fabric(e.clone()),
            EngineError::ConcurrencyConflict { key, attempts } => RemoteError::Conflict {
                key: key.clone(),
                attempts: *attempts,
            },
            EngineError::Nondeterminism { key, message } => RemoteError::Nondeterminism {
                key: key.clone(),
                message: message.clone(),
            },
            EngineError::InvariantViolation(m) => RemoteError::Invariant(m.clone()),
            EngineError::Storage(e) => RemoteError::Storage {
                retryable: e.is_retryable() || e.is_conflict(),
                message: e.to_string(),
            },
            EngineError::Serialization(e) => RemoteError::Serialization(e.to_string()),
            EngineError::Config(m) => RemoteError::Config(m.clone()),
            EngineError::Timeout(m) => RemoteError::Timeout(m.clone()),
            EngineError::Transport(m) => RemoteError::Transport(m.clone()),
        }
    }
}

impl From<RemoteError> for EngineError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Resolution(e) => EngineError::Resolution(e),
            RemoteError::Fabric(e) => EngineError::Fabric(e),
            RemoteError::Conflict { key, attempts } => EngineError::ConcurrencyConflict { key, attempts },
            RemoteError::Nondeterminism { key, message } => EngineError::Nondeterminism { key, message },
            RemoteError::Invariant(m) => EngineError::InvariantViolation(format!("remote: {m}")),
            // A remote etag race is not ours to retry as a local conflict.
            RemoteError::Storage { retryable: true, message } => {
                EngineError::Storage(StorageError::retryable("remote", message))
            }
            RemoteError::Storage { retryable: false, message } => {
                EngineError::Storage(StorageError::permanent("remote", message))
            }
            RemoteError::Serialization(m) => {
                EngineError::Serialization(SerializationError::Malformed(format!("remote: {m}")))
            }
            RemoteError::Config(m) => EngineError::Config(format!("remote: {m}")),
            RemoteError::Timeout(m) => EngineError::Timeout(m),
            RemoteError::Transport(m) => EngineError::Transport(format!("remote: {m}")),
        }
    }
}

/// Answer to any envelope: routine info, a cancellation flag, or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ActiveRoutineInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ReplyEnvelope {
    pub fn info(info: ActiveRoutineInfo) -> Self {
        Self {
            info: Some(info),
            cancelled: None,
            error: None,
        }
    }

    pub fn cancelled(was_running: bool) -> Self {
        Self {
            info: None,
            cancelled: Some(was_running),
            error: None,
        }
    }

    pub fn error(error: &EngineError) -> Self {
        Self {
            info: None,
            cancelled: None,
            error: Some(RemoteError::from(error)),
        }
    }

    pub fn into_info(self) -> Result<ActiveRoutineInfo, EngineError> {
        match (self.error, self.info) {
            (Some(error), _) => Err(error.into()),
            (None, Some(info)) => Ok(info),
            (None, None) => Err(EngineError::Transport("reply carried no routine info".into())),
        }
    }

    pub fn into_cancelled(self) -> Result<bool, EngineError> {
        match (self.error, self.cancelled) {
            (Some(error), _) => Err(error.into()),
            (None, Some(flag)) => Ok(flag),
            (None, None) => Err(EngineError::Transport("reply carried no cancellation flag".into())),
        }
    }
}

pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(envelope).map_err(|e| SerializationError::Malformed(e.to_string()).into())
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| SerializationError::Malformed(e.to_string()).into())
}

fn split_state(state: Option<SerializedState>) -> (Option<String>, Option<Vec<u8>>) {
    match state {
        Some(s) => (Some(s.format), Some(s.data)),
        None => (None, None),
    }
}

fn join_state(format: Option<String>, data: Option<Vec<u8>>) -> Option<SerializedState> {
    match (format, data) {
        (Some(format), Some(data)) => Some(SerializedState { format, data }),
        _ => None,
    }
}

impl From<ExecuteRoutineIntent> for InvokeEnvelope {
    fn from(intent: ExecuteRoutineIntent) -> Self {
        let (continuation_state_format, continuation_state_data) = split_state(intent.caller_state);
        Self {
            service: intent.service,
            method: intent.method,
            caller: intent.caller,
            intent_id: intent.id,
            flow_context: intent.flow_context,
            parameters: intent.parameters,
            continuation: intent.continuation,
            continuation_state_format,
            continuation_state_data,
        }
    }
}

impl From<InvokeEnvelope> for ExecuteRoutineIntent {
    fn from(envelope: InvokeEnvelope) -> Self {
        Self {
            id: envelope.intent_id,
            service: envelope.service,
            method: envelope.method,
            caller: envelope.caller,
            flow_context: envelope.flow_context,
            parameters: envelope.parameters,
            continuation: envelope.continuation,
            caller_state: join_state(envelope.continuation_state_format, envelope.continuation_state_data),
        }
    }
}

impl ContinueEnvelope {
    pub fn from_intent(
        intent: ContinueRoutineIntent,
        serializer: &ValueSerializer,
        format: Format,
    ) -> Result<Self, EngineError> {
        let result = ValueContainer::from_value(serializer.encode(&intent.result, format)?)?;
        let task_id = intent.task_id().to_string();
        let (continuation_state_format, continuation_state_data) = split_state(intent.caller_state);
        Ok(Self {
            service: intent.target.service,
            method: intent.target.method,
            intent_id: intent.id,
            task_id,
            continue_at_ms: intent.target.continue_at_ms,
            caller: intent.source,
            result,
            continuation_state_format,
            continuation_state_data,
        })
    }

    pub fn into_intent(self, serializer: &ValueSerializer) -> Result<ContinueRoutineIntent, EngineError> {
        let result: TaskResult = serializer.decode_as(&self.result.into_value())?;
        Ok(ContinueRoutineIntent {
            id: self.intent_id,
            target: ContinuationDescriptor {
                service: self.service,
                method: self.method,
                task_id: Some(self.task_id),
                continue_at_ms: self.continue_at_ms,
            },
            source: self.caller,
            result,
            caller_state: join_state(self.continuation_state_format, self.continuation_state_data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::ErrorValue;

    #[test]
    fn continue_envelope_keeps_fault_type_names() {
        let serializer = ValueSerializer::default();
        let fault = ErrorValue::aggregate(
            "AggregateError",
            "two failed",
            vec![ErrorValue::new("Timeout", "a"), ErrorValue::new("Refused", "b")],
        );
        let intent = ContinueRoutineIntent {
            id: "root/0".into(),
            target: ContinuationDescriptor {
                service: "A".into(),
                method: MethodId::new("Foo").persisted("root"),
                task_id: Some("root/0".into()),
                continue_at_ms: None,
            },
            source: None,
            result: TaskResult::Fault(fault.clone()),
            caller_state: Some(SerializedState {
                format: "json".into(),
                data: b"{}".to_vec(),
            }),
        };
        let envelope = ContinueEnvelope::from_intent(intent.clone(), &serializer, Format::JsonCompact).unwrap();
        let wire = encode(&WireEnvelope::Continue(envelope)).unwrap();
        let WireEnvelope::Continue(back) = decode(&wire).unwrap() else { panic!("expected continue") };
        assert_eq!(back.into_intent(&serializer).unwrap(), intent);
    }

    fn across_the_wire(error: EngineError) -> EngineError {
        let reply = ReplyEnvelope::error(&error);
        decode::<ReplyEnvelope>(&encode(&reply).unwrap())
            .unwrap()
            .into_info()
            .unwrap_err()
    }

    #[test]
    fn remote_errors_keep_their_class() {
        let unknown = EngineError::from(ResolutionError::UnknownMethod {
            service: "Inventory".into(),
            method: "Nope".into(),
        });
        assert_eq!(across_the_wire(unknown.clone()), unknown);

        let err = across_the_wire(EngineError::InvariantViolation("lost".into()));
        assert!(matches!(&err, EngineError::InvariantViolation(m) if m.contains("lost")));
        assert!(!err.is_retryable());

        let err = across_the_wire(EngineError::Transport("down".into()));
        assert!(matches!(&err, EngineError::Transport(m) if m.contains("down")));
        assert!(err.is_retryable());

        let missing = EngineError::Fabric(FabricError::ServiceNotRegistered("D".into()));
        assert_eq!(across_the_wire(missing.clone()), missing);
    }

    #[test]
    fn remote_storage_conflicts_are_not_local_conflicts() {
        let err = across_the_wire(EngineError::Storage(StorageError::conflict("write_state", "etag mismatch")));
        match err {
            EngineError::Storage(e) => {
                assert!(!e.is_conflict());
                assert!(e.is_retryable());
            }
            other => panic!("expected a storage error, got {other:?}"),
        }
        let err = across_the_wire(EngineError::Storage(StorageError::permanent("read_state", "corrupt")));
        assert!(!err.is_retryable());
    }
}
