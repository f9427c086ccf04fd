#![allow(dead_code)]

pub mod tracing_capture;

use async_trait::async_trait;
use routine_fabric::config::ConnectorConfig;
use routine_fabric::fabric::{FabricConnector, FabricConnectorFactory, FabricError};
use routine_fabric::intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent, TaskResult};
use routine_fabric::providers::{InMemoryStorage, MethodExecutionState, MethodStateStorage, StorageError};
use routine_fabric::{
    CallerDescriptor, CommunicationModel, EngineError, FabricConfig, MethodId, PersistedMethodId, RoutineError, Runtime,
    ServiceDefinition, ServiceId, ValueContainer,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const RECORDING: &str = "recording";

/// Stand-in for a remote service host: records what it is asked to do and
/// answers inline only for methods it was told about.
#[derive(Default)]
pub struct RecordingConnector {
    scheduled: Mutex<Vec<ExecuteRoutineIntent>>,
    continuations: Mutex<Vec<ContinueRoutineIntent>>,
    cancellations: Mutex<Vec<String>>,
    inline: Mutex<HashMap<String, TaskResult>>,
    failures_left: AtomicU32,
}

impl RecordingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Complete calls to `method` inside the schedule response.
    pub fn answer_inline(&self, method: &str, result: TaskResult) {
        self.inline.lock().unwrap().insert(method.to_string(), result);
    }

    /// Fail the next `n` schedules with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn scheduled(&self) -> Vec<ExecuteRoutineIntent> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn continuations(&self) -> Vec<ContinueRoutineIntent> {
        self.continuations.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.cancellations.lock().unwrap().clone()
    }

    /// Factory handing out this connector for every configuration.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn FabricConnectorFactory> {
        Arc::new(SharedFactory(self.clone()))
    }
}

#[async_trait]
impl FabricConnector for RecordingConnector {
    fn connector_type(&self) -> &str {
        RECORDING
    }

    async fn schedule_routine(&self, intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Transport("remote host unreachable".into()));
        }
        self.scheduled.lock().unwrap().push(intent.clone());
        let info = ActiveRoutineInfo::pending(intent.service.clone(), intent.method.clone(), intent.id.clone());
        match self.inline.lock().unwrap().get(&intent.method.name) {
            Some(result) => Ok(ActiveRoutineInfo {
                result: Some(result.clone()),
                ..info
            }),
            None => Ok(info),
        }
    }

    async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
        Ok(info.clone())
    }

    async fn schedule_continuation(&self, intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        self.continuations.lock().unwrap().push(intent.clone());
        Ok(ActiveRoutineInfo::pending(
            intent.target.service.clone(),
            intent.target.method.method_id(),
            intent.target.method.intent_id.clone(),
        ))
    }

    async fn request_cancellation(
        &self,
        _service: &ServiceId,
        _method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError> {
        self.cancellations.lock().unwrap().push(intent_id.to_string());
        Ok(true)
    }
}

struct SharedFactory(Arc<RecordingConnector>);

impl FabricConnectorFactory for SharedFactory {
    fn connector_type(&self) -> &str {
        RECORDING
    }

    fn create(&self, _config: &ConnectorConfig) -> Result<Arc<dyn FabricConnector>, FabricError> {
        Ok(self.0.clone())
    }
}

/// The continuation a remote host would send once `call` finished with `result`.
pub fn finish(call: &ExecuteRoutineIntent, result: TaskResult) -> ContinueRoutineIntent {
    ContinueRoutineIntent {
        id: call.id.clone(),
        target: call.continuation.clone().expect("calls made by routines carry a continuation"),
        source: Some(CallerDescriptor {
            service: call.service.clone(),
            method: call.method.clone(),
            intent_id: call.id.clone(),
        }),
        result,
        caller_state: call.caller_state.clone(),
    }
}

/// A.Foo calls B.Bar; Bar answers 42 or, with `bar_waits_on_baz`, awaits the
/// external C.Baz and answers its value plus one.
pub fn chain_model(bar_waits_on_baz: bool) -> CommunicationModel {
    CommunicationModel::builder()
        .service(ServiceDefinition::local("A").method("Foo", |ctx, params| async move {
            let bar = ctx.call("B", "Bar", params).await?;
            Ok::<_, RoutineError>(json!({ "foo": bar }))
        }))
        .service(ServiceDefinition::local("B").method("Bar", move |ctx, _params| async move {
            if !bar_waits_on_baz {
                return Ok(json!(42));
            }
            let baz = ctx.call("C", "Baz", ValueContainer::new()).await?;
            Ok::<_, RoutineError>(json!(baz.as_i64().unwrap_or_default() + 1))
        }))
        .service(ServiceDefinition::external("C").remote_method("Baz"))
        .build()
        .unwrap()
}

/// Runtime whose external service C is served by `connector`.
pub fn runtime_with(
    model: CommunicationModel,
    storage: Arc<InMemoryStorage>,
    connector: &Arc<RecordingConnector>,
    config: serde_json::Value,
) -> Arc<Runtime> {
    let mut config = config;
    if config.get("services").is_none() {
        config["services"] = json!({});
    }
    config["services"]["C"]["connector"] = json!({ "type": RECORDING });
    Runtime::builder(model)
        .default_storage(storage)
        .config(FabricConfig::from_json_str(&config.to_string()).unwrap())
        .connector_factory(connector.factory())
        .build()
        .unwrap()
}

/// Storage wrapper that turns selected state writes into concurrency conflicts.
pub struct ConflictInjectingStorage {
    inner: Arc<dyn MethodStateStorage>,
    writes: AtomicU32,
    first_conflict: u32,
    conflicts: u32,
}

impl ConflictInjectingStorage {
    /// Writes are numbered from 1; writes `first_conflict..first_conflict + conflicts` fail.
    pub fn new(inner: Arc<dyn MethodStateStorage>, first_conflict: u32, conflicts: u32) -> Self {
        Self {
            inner,
            writes: AtomicU32::new(0),
            first_conflict,
            conflicts,
        }
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MethodStateStorage for ConflictInjectingStorage {
    async fn write_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
        state: &MethodExecutionState,
    ) -> Result<String, StorageError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.first_conflict && n - self.first_conflict < self.conflicts {
            return Err(StorageError::conflict("write_state", format!("injected conflict on write {n}")));
        }
        self.inner.write_state(service, method, state).await
    }

    async fn read_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
    ) -> Result<Option<MethodExecutionState>, StorageError> {
        self.inner.read_state(service, method).await
    }

    async fn write_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
        result: &TaskResult,
    ) -> Result<(), StorageError> {
        self.inner.write_result(service, method, intent_id, result).await
    }

    async fn try_read_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<TaskResult>, StorageError> {
        self.inner.try_read_result(service, method, intent_id).await
    }

    fn name(&self) -> &str {
        "conflict-injecting"
    }
}
