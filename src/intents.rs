//! Intents: serializable instructions for one durable state change.
//!
//! A routine body never talks to the fabric directly. Every effect it requests is
//! captured as an [`Intent`] with a call-site-derived id, committed by the
//! transition runner, and only then dispatched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::descriptors::{CallerDescriptor, ContinuationDescriptor, EventId, MethodId, PersistedMethodId, ServiceId};
use crate::serialization::{ErrorValue, SerializedState, ValueContainer};

/// Flow context propagated from caller to callee.
pub type FlowContext = BTreeMap<String, String>;

/// Terminal outcome of one routine attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskResult {
    Value(Value),
    /// The routine raised an error. This is an outcome, not an engine failure.
    Fault(ErrorValue),
    Canceled,
}

impl TaskResult {
    pub fn is_value(&self) -> bool {
        matches!(self, TaskResult::Value(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, TaskResult::Fault(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskResult::Canceled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskResult::Value(_) => "value",
            TaskResult::Fault(_) => "fault",
            TaskResult::Canceled => "canceled",
        }
    }
}

/// Submit new work: run `method` on `service` as attempt `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRoutineIntent {
    pub id: String,
    pub service: ServiceId,
    pub method: MethodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    #[serde(default)]
    pub flow_context: FlowContext,
    #[serde(default)]
    pub parameters: ValueContainer,
    /// Where to send the outcome if the attempt does not finish inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    /// Caller state carried along instead of written to storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_state: Option<SerializedState>,
}

impl ExecuteRoutineIntent {
    pub fn new(service: impl Into<ServiceId>, method: impl Into<MethodId>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            method: method.into(),
            caller: None,
            flow_context: FlowContext::new(),
            parameters: ValueContainer::new(),
            continuation: None,
            caller_state: None,
        }
    }

    pub fn with_parameters(mut self, parameters: ValueContainer) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_flow_context(mut self, flow_context: FlowContext) -> Self {
        self.flow_context = flow_context;
        self
    }

    pub fn persisted_method(&self) -> PersistedMethodId {
        self.method.persisted(self.id.clone())
    }
}

/// Resume a suspended routine with the outcome of something it awaited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueRoutineIntent {
    /// Id of the attempt that produced `result`; doubles as the task id.
    pub id: String,
    pub target: ContinuationDescriptor,
    /// The routine that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CallerDescriptor>,
    pub result: TaskResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_state: Option<SerializedState>,
}

impl ContinueRoutineIntent {
    pub fn task_id(&self) -> &str {
        self.target.task_id.as_deref().unwrap_or(&self.id)
    }
}

/// Persist the routine's state at an explicit save point and keep running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveStateIntent {
    pub id: String,
    pub service: ServiceId,
    pub method: PersistedMethodId,
}

/// Publish an event to every subscriber of `event` on `service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseEventIntent {
    pub id: String,
    pub service: ServiceId,
    pub event: EventId,
    #[serde(default)]
    pub parameters: ValueContainer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CallerDescriptor>,
    #[serde(default)]
    pub flow_context: FlowContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    Execute(ExecuteRoutineIntent),
    Continue(ContinueRoutineIntent),
    SaveState(SaveStateIntent),
    RaiseEvent(RaiseEventIntent),
}

impl Intent {
    pub fn id(&self) -> &str {
        match self {
            Intent::Execute(i) => &i.id,
            Intent::Continue(i) => &i.id,
            Intent::SaveState(i) => &i.id,
            Intent::RaiseEvent(i) => &i.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Execute(_) => "execute",
            Intent::Continue(_) => "continue",
            Intent::SaveState(_) => "save_state",
            Intent::RaiseEvent(_) => "raise_event",
        }
    }
}

/// What a connector knows about a scheduled attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRoutineInfo {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: String,
    /// Present once the attempt is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Hint for pollers when no push notification will arrive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_after_ms: Option<u64>,
}

impl ActiveRoutineInfo {
    pub fn pending(service: ServiceId, method: MethodId, intent_id: impl Into<String>) -> Self {
        Self {
            service,
            method,
            intent_id: intent_id.into(),
            result: None,
            poll_after_ms: None,
        }
    }

    pub fn completed(service: ServiceId, method: MethodId, intent_id: impl Into<String>, result: TaskResult) -> Self {
        Self {
            result: Some(result),
            ..Self::pending(service, method, intent_id)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_result_wire_shape() {
        let v = serde_json::to_value(TaskResult::Value(json!(42))).unwrap();
        assert_eq!(v, json!({"status": "value", "value": 42}));
        let c = serde_json::to_value(TaskResult::Canceled).unwrap();
        assert_eq!(c, json!({"status": "canceled"}));
        let back: TaskResult = serde_json::from_value(c).unwrap();
        assert!(back.is_canceled());
    }

    #[test]
    fn intents_are_tagged_by_kind() {
        let intent = Intent::Execute(ExecuteRoutineIntent::new("ServiceB", "Bar", "root/0"));
        let v = serde_json::to_value(&intent).unwrap();
        assert_eq!(v["type"], json!("execute"));
        assert_eq!(intent.id(), "root/0");
        let back: Intent = serde_json::from_value(v).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn continue_task_id_defaults_to_intent_id() {
        let mut intent = ContinueRoutineIntent {
            id: "root/0".into(),
            target: ContinuationDescriptor {
                service: "ServiceA".into(),
                method: MethodId::new("Foo").persisted("root"),
                task_id: None,
                continue_at_ms: None,
            },
            source: None,
            result: TaskResult::Canceled,
            caller_state: None,
        };
        assert_eq!(intent.task_id(), "root/0");
        intent.target.task_id = Some("other".into());
        assert_eq!(intent.task_id(), "other");
    }
}
