use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::descriptors::{new_root_intent_id, EventId, MethodId, ServiceId};
use crate::error::EngineError;
use crate::intents::{ActiveRoutineInfo, ExecuteRoutineIntent, FlowContext, RaiseEventIntent, TaskResult};
use crate::runtime::{completion_key, RoutineStatus, Runtime};
use crate::serialization::{SerializationError, ValueContainer};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Entry point for callers outside any routine.
///
/// Every invocation gets a fresh root intent id; calls made by the routine
/// derive their ids from it.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Invoke a method. Returns once the routine completed or suspended.
    pub async fn invoke(
        &self,
        service: impl Into<ServiceId>,
        method: impl Into<MethodId>,
        parameters: ValueContainer,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        self.invoke_with_id(service, method, new_root_intent_id(), parameters, FlowContext::new())
            .await
    }

    /// Invoke under a caller-chosen root id; re-invoking with the same id is idempotent.
    pub async fn invoke_with_id(
        &self,
        service: impl Into<ServiceId>,
        method: impl Into<MethodId>,
        intent_id: impl Into<String>,
        parameters: ValueContainer,
        flow_context: FlowContext,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        let intent = ExecuteRoutineIntent::new(service, method, intent_id)
            .with_parameters(parameters)
            .with_flow_context(flow_context);
        self.runtime.execute(intent).await
    }

    /// Invoke with a serde-serializable parameter object.
    pub async fn invoke_typed<P: Serialize>(
        &self,
        service: impl Into<ServiceId>,
        method: impl Into<MethodId>,
        parameters: &P,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        let value = serde_json::to_value(parameters).map_err(|e| SerializationError::Malformed(e.to_string()))?;
        self.invoke(service, method, ValueContainer::from_value(value)?).await
    }

    /// Invoke and wait for the outcome.
    pub async fn call(
        &self,
        service: impl Into<ServiceId>,
        method: impl Into<MethodId>,
        parameters: ValueContainer,
        timeout: Duration,
    ) -> Result<TaskResult, EngineError> {
        let info = self.invoke(service, method, parameters).await?;
        self.wait_for_result(&info, timeout).await
    }

    /// Wait for an attempt's outcome.
    ///
    /// Local attempts wake through the completion notifier; the store is polled
    /// as well so remote attempts and outcomes written before subscribing are seen.
    pub async fn wait_for_result(&self, info: &ActiveRoutineInfo, timeout: Duration) -> Result<TaskResult, EngineError> {
        if let Some(result) = &info.result {
            return Ok(result.clone());
        }
        let notifier = self.runtime.notifier();
        let trigger = notifier.subscribe(&info.service, &info.method, &info.intent_id);
        let interval = info
            .poll_after_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let waited = tokio::time::timeout(timeout, async {
            loop {
                let polled = self.runtime.poll(info).await?;
                if let Some(result) = polled.result {
                    return Ok::<_, EngineError>(result);
                }
                tokio::select! {
                    result = trigger.wait() => return Ok(result),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
        .await;
        notifier.forget(&info.service, &info.method, &info.intent_id);

        match waited {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Timeout(completion_key(
                &info.service,
                &info.method,
                &info.intent_id,
            ))),
        }
    }

    /// Request cancellation. Returns `false` when the attempt had already finished.
    pub async fn cancel(&self, info: &ActiveRoutineInfo) -> Result<bool, EngineError> {
        self.runtime
            .request_cancellation(&info.service, &info.method, &info.intent_id)
            .await
    }

    pub async fn status(&self, info: &ActiveRoutineInfo) -> Result<Option<RoutineStatus>, EngineError> {
        self.runtime.status(&info.service, &info.method, &info.intent_id).await
    }

    /// Raise an event on behalf of `service`. Returns how many subscribers were started.
    pub async fn raise_event(
        &self,
        service: impl Into<ServiceId>,
        event: impl Into<EventId>,
        parameters: ValueContainer,
    ) -> Result<usize, EngineError> {
        let intent = RaiseEventIntent {
            id: new_root_intent_id(),
            service: service.into(),
            event: event.into(),
            parameters,
            source: None,
            flow_context: FlowContext::new(),
        };
        self.runtime.fabric().raise_event(intent).await
    }
}
