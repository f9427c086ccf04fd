//! Runtime: hosts routines, runs their transitions and wires the fabric.
//!
//! A [`Runtime`] owns one [`TransitionRunner`], the value serializer, the
//! correlation registries and the completion notifier. Everything is built by
//! [`RuntimeBuilder`]; the self connector holds the runner weakly so the
//! runtime can be dropped while intents are in flight elsewhere.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

mod context;
mod notifier;
pub mod observability;
mod transition;

pub use context::{ApplyOutcome, Journal, JournalStep, RoutineCall, RoutineContext, SavePoint};
pub use notifier::{completion_key, CompletionNotifier};
pub use transition::{cancellation_id, TransitionRunner};

use crate::config::{FabricConfig, DEFAULT_STORAGE};
use crate::correlation::{CancellationRegistry, TriggerRegistry};
use crate::descriptors::{MethodId, ServiceId};
use crate::error::EngineError;
use crate::fabric::{
    EnvelopeEndpoint, Fabric, FabricConnectorFactory, FabricConnectorSelector, InProcessConnector, RuntimeEndpoint,
    ServiceDirectory, ServiceDiscovery,
};
use crate::intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent, TaskResult};
use crate::model::{CommunicationModel, Subscription};
use crate::providers::{InMemoryStorage, MethodStateStorage};
use crate::serialization::{ErrorValue, SerializationError, ValueContainer, ValueSerializer, ValueSerializerBuilder};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Transitions that lose an etag race re-read and retry this many times in total.
    /// Default: 5
    pub max_conflict_retries: u32,
    /// Resolved completions kept for subscribers that arrive late.
    /// Default: 1024
    pub completion_cache: usize,
    /// Poll hint returned with pending routine info.
    pub poll_after_ms: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            completion_cache: 1024,
            poll_after_ms: Some(100),
        }
    }
}

/// How a routine body ended without producing a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutineError {
    #[error("{0}")]
    Fault(ErrorValue),
    #[error("canceled")]
    Canceled,
}

impl RoutineError {
    /// Fault with the generic error type.
    pub fn fault(message: impl Into<String>) -> Self {
        RoutineError::Fault(ErrorValue::new(crate::serialization::GENERIC_ERROR_TYPE, message))
    }
}

impl From<ErrorValue> for RoutineError {
    fn from(value: ErrorValue) -> Self {
        RoutineError::Fault(value)
    }
}

impl From<SerializationError> for RoutineError {
    fn from(value: SerializationError) -> Self {
        RoutineError::Fault(ErrorValue::from_error(&value))
    }
}

impl TaskResult {
    pub fn into_result(self) -> Result<Value, RoutineError> {
        match self {
            TaskResult::Value(v) => Ok(v),
            TaskResult::Fault(e) => Err(RoutineError::Fault(e)),
            TaskResult::Canceled => Err(RoutineError::Canceled),
        }
    }

    pub fn from_result(result: Result<Value, RoutineError>) -> Self {
        match result {
            Ok(v) => TaskResult::Value(v),
            Err(RoutineError::Fault(e)) => TaskResult::Fault(e),
            Err(RoutineError::Canceled) => TaskResult::Canceled,
        }
    }
}

/// Status of one attempt as seen by the runtime hosting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineStatus {
    /// A transition is executing in this process.
    Running,
    /// State is persisted and the routine waits for a result.
    Suspended,
    Completed,
    Faulted,
    Canceled,
}

impl RoutineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoutineStatus::Completed | RoutineStatus::Faulted | RoutineStatus::Canceled)
    }
}

impl From<&TaskResult> for RoutineStatus {
    fn from(result: &TaskResult) -> Self {
        match result {
            TaskResult::Value(_) => RoutineStatus::Completed,
            TaskResult::Fault(_) => RoutineStatus::Faulted,
            TaskResult::Canceled => RoutineStatus::Canceled,
        }
    }
}

/// Trait implemented by routine handlers that can be invoked by the runtime.
#[async_trait]
pub trait RoutineHandler: Send + Sync {
    async fn invoke(&self, ctx: RoutineContext, parameters: ValueContainer) -> Result<Value, RoutineError>;
}

/// Function wrapper that implements `RoutineHandler`.
pub struct FnRoutine<F, Fut>(pub F)
where
    F: Fn(RoutineContext, ValueContainer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static;

#[async_trait]
impl<F, Fut> RoutineHandler for FnRoutine<F, Fut>
where
    F: Fn(RoutineContext, ValueContainer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
{
    async fn invoke(&self, ctx: RoutineContext, parameters: ValueContainer) -> Result<Value, RoutineError> {
        (self.0)(ctx, parameters).await
    }
}

/// A routine host. Cheap to share behind an `Arc`.
pub struct Runtime {
    runner: Arc<TransitionRunner>,
}

impl Runtime {
    pub fn builder(model: CommunicationModel) -> RuntimeBuilder {
        RuntimeBuilder::new(model)
    }

    pub fn runner(&self) -> &Arc<TransitionRunner> {
        &self.runner
    }

    pub fn model(&self) -> &CommunicationModel {
        self.runner.model()
    }

    pub fn fabric(&self) -> &Fabric {
        self.runner.fabric()
    }

    pub fn serializer(&self) -> &ValueSerializer {
        self.runner.serializer()
    }

    pub fn notifier(&self) -> &Arc<CompletionNotifier> {
        self.runner.notifier()
    }

    /// Endpoint through which other runtimes deliver envelopes to this one.
    pub fn endpoint(&self) -> Arc<dyn EnvelopeEndpoint> {
        Arc::new(RuntimeEndpoint::new(Arc::downgrade(&self.runner)))
    }

    /// Route an execute through the fabric; local services run inline.
    pub async fn execute(&self, intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner.fabric().execute(intent).await
    }

    pub async fn continue_routine(&self, intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner.continue_routine(intent).await
    }

    pub async fn request_cancellation(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError> {
        self.runner.fabric().request_cancellation(service, method, intent_id).await
    }

    pub async fn recover(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner.recover(service, method, intent_id).await
    }

    pub async fn status(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<RoutineStatus>, EngineError> {
        self.runner.status(service, method, intent_id).await
    }

    pub async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner.fabric().poll(info).await
    }

    pub fn subscribe(&self, subscription: Subscription) {
        self.runner.fabric().subscribe(subscription);
    }
}

/// Builder for [`Runtime`]; storages, connectors and configuration are all optional.
pub struct RuntimeBuilder {
    model: CommunicationModel,
    storages: HashMap<String, Arc<dyn MethodStateStorage>>,
    config: FabricConfig,
    options: RuntimeOptions,
    factories: Vec<Arc<dyn FabricConnectorFactory>>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    serializer: ValueSerializerBuilder,
}

impl RuntimeBuilder {
    pub fn new(model: CommunicationModel) -> Self {
        Self {
            model,
            storages: HashMap::new(),
            config: FabricConfig::default(),
            options: RuntimeOptions::default(),
            factories: Vec::new(),
            discovery: None,
            serializer: ValueSerializer::builder(),
        }
    }

    /// Register a storage under the name configuration refers to.
    pub fn storage(mut self, name: impl Into<String>, storage: Arc<dyn MethodStateStorage>) -> Self {
        self.storages.insert(name.into(), storage);
        self
    }

    pub fn default_storage(self, storage: Arc<dyn MethodStateStorage>) -> Self {
        self.storage(DEFAULT_STORAGE, storage)
    }

    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connector_factory(mut self, factory: Arc<dyn FabricConnectorFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Serializer registrations (user types, errors, converters). Correlation
    /// registries are always the runtime's own.
    pub fn serializer(mut self, serializer: ValueSerializerBuilder) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn build(self) -> Result<Arc<Runtime>, EngineError> {
        let RuntimeBuilder {
            model,
            mut storages,
            config,
            options,
            factories,
            discovery,
            serializer,
        } = self;

        storages
            .entry(DEFAULT_STORAGE.to_string())
            .or_insert_with(|| Arc::new(InMemoryStorage::new()));
        for name in config.storage_names() {
            if !storages.contains_key(&name) {
                return Err(EngineError::Config(format!(
                    "configuration refers to storage '{name}' which was not registered"
                )));
            }
        }

        let triggers = TriggerRegistry::default();
        let cancellations = CancellationRegistry::default();
        let serializer = Arc::new(serializer.correlation(triggers.clone(), cancellations.clone()).build()?);
        let notifier = Arc::new(CompletionNotifier::new(triggers, options.completion_cache));
        let directory = Arc::new(ServiceDirectory::seeded(config.connectors()));
        debug!(
            target: "routine_fabric::runtime",
            services = model.len(),
            storages = storages.len(),
            directory = directory.len(),
            "building runtime"
        );

        let runner = Arc::new_cyclic(|weak| {
            let mut selector = FabricConnectorSelector::new(model.clone(), directory)
                .with_self_connector(Arc::new(InProcessConnector::new(weak.clone())));
            for factory in factories {
                selector = selector.with_factory(factory);
            }
            if let Some(discovery) = discovery {
                selector = selector.with_discovery(discovery);
            }
            let fabric = Fabric::new(model.clone(), selector);
            TransitionRunner::new(model, fabric, storages, config, serializer, notifier, cancellations, options)
        });
        Ok(Arc::new(Runtime { runner }))
    }
}
