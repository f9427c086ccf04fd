//! Fabric: routes intents to the runtime that hosts their target service.
//!
//! Locally hosted services go through the self connector. Everything else is
//! looked up in the [`ServiceDirectory`], falling back once to
//! [`ServiceDiscovery`]; the resulting configuration picks a
//! [`FabricConnectorFactory`] by connector type. Connectors are cached per
//! configuration, so services sharing an endpoint share a connector.

mod directory;
pub mod envelopes;
mod in_process;
pub mod loopback;

pub use directory::{ServiceDirectory, ServiceDiscovery, StaticDiscovery};
pub use in_process::InProcessConnector;
pub use loopback::{EnvelopeEndpoint, LoopbackConnector, LoopbackConnectorFactory, LoopbackNetwork, RuntimeEndpoint};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::config::ConnectorConfig;
use crate::descriptors::{MethodId, ServiceId};
use crate::error::EngineError;
use crate::intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent, RaiseEventIntent};
use crate::model::{CommunicationModel, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricError {
    #[error("service '{0}' is hosted locally but no self connector is installed")]
    NoSelfConnector(String),
    #[error("service '{0}' is not registered in the directory or discovery")]
    ServiceNotRegistered(String),
    #[error("no connector factory for type '{0}'")]
    UnknownConnectorType(String),
    #[error("invalid '{connector_type}' connector configuration: {message}")]
    InvalidConnectorConfig { connector_type: String, message: String },
    #[error("service discovery failed: {0}")]
    Discovery(String),
}

/// Transport to one runtime that hosts services.
#[async_trait]
pub trait FabricConnector: Send + Sync {
    fn connector_type(&self) -> &str;

    /// Deliver an execute intent. The reply carries the outcome when the
    /// attempt finished within its scheduling transition.
    async fn schedule_routine(&self, intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError>;

    async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError>;

    async fn schedule_continuation(&self, intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError>;

    /// Returns whether the attempt was still running.
    async fn request_cancellation(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError>;
}

/// Builds connectors of one type from their configuration.
pub trait FabricConnectorFactory: Send + Sync {
    fn connector_type(&self) -> &str;

    fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn FabricConnector>, FabricError>;
}

pub struct FabricConnectorSelector {
    model: CommunicationModel,
    self_connector: Option<Arc<dyn FabricConnector>>,
    directory: Arc<ServiceDirectory>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    factories: HashMap<String, Arc<dyn FabricConnectorFactory>>,
    built: Mutex<HashMap<String, Arc<dyn FabricConnector>>>,
}

impl FabricConnectorSelector {
    pub fn new(model: CommunicationModel, directory: Arc<ServiceDirectory>) -> Self {
        Self {
            model,
            self_connector: None,
            directory,
            discovery: None,
            factories: HashMap::new(),
            built: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_self_connector(mut self, connector: Arc<dyn FabricConnector>) -> Self {
        self.self_connector = Some(connector);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn FabricConnectorFactory>) -> Self {
        self.factories.insert(factory.connector_type().to_string(), factory);
        self
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    /// Pick the connector for `service`.
    pub async fn select(&self, service: &ServiceId) -> Result<Arc<dyn FabricConnector>, FabricError> {
        let canonical = self.model.canonical(service).unwrap_or_else(|| service.clone());
        if self.model.is_hosted_locally(&canonical) {
            return self
                .self_connector
                .clone()
                .ok_or_else(|| FabricError::NoSelfConnector(canonical.name.clone()));
        }

        let config = match self.directory.lookup(&canonical.name) {
            Some(config) => config,
            None => self.discover(&canonical).await?,
        };
        self.connector_for(&config)
    }

    async fn discover(&self, service: &ServiceId) -> Result<ConnectorConfig, FabricError> {
        let discovered = match &self.discovery {
            Some(discovery) => discovery.discover(service).await?,
            None => None,
        };
        match discovered {
            Some(config) => {
                debug!(
                    target: "routine_fabric::fabric",
                    service = %service,
                    connector = %config.connector_type,
                    "directory refreshed from discovery"
                );
                self.directory.register(&service.name, config.clone());
                Ok(config)
            }
            None => Err(FabricError::ServiceNotRegistered(service.name.clone())),
        }
    }

    fn connector_for(&self, config: &ConnectorConfig) -> Result<Arc<dyn FabricConnector>, FabricError> {
        let key = config.cache_key();
        let mut built = self.built.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(connector) = built.get(&key) {
            return Ok(connector.clone());
        }
        let factory = self
            .factories
            .get(&config.connector_type)
            .ok_or_else(|| FabricError::UnknownConnectorType(config.connector_type.clone()))?;
        let connector = factory.create(config)?;
        built.insert(key, connector.clone());
        Ok(connector)
    }

    /// Number of connector instances built so far.
    pub fn built_connectors(&self) -> usize {
        self.built.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

pub struct Fabric {
    model: CommunicationModel,
    selector: FabricConnectorSelector,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Fabric {
    pub fn new(model: CommunicationModel, selector: FabricConnectorSelector) -> Self {
        Self {
            model,
            selector,
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn selector(&self) -> &FabricConnectorSelector {
        &self.selector
    }

    fn canonical(&self, service: &ServiceId) -> ServiceId {
        self.model.canonical(service).unwrap_or_else(|| service.clone())
    }

    pub async fn execute(&self, mut intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        intent.service = self.canonical(&intent.service);
        let connector = self.selector.select(&intent.service).await?;
        debug!(
            target: "routine_fabric::fabric",
            service = %intent.service,
            method = %intent.method,
            intent_id = %intent.id,
            connector = connector.connector_type(),
            "dispatching execute"
        );
        connector.schedule_routine(intent).await
    }

    pub async fn continue_routine(&self, mut intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        intent.target.service = self.canonical(&intent.target.service);
        let connector = self.selector.select(&intent.target.service).await?;
        debug!(
            target: "routine_fabric::fabric",
            service = %intent.target.service,
            method = %intent.target.method,
            task_id = %intent.task_id(),
            outcome = intent.result.kind(),
            connector = connector.connector_type(),
            "dispatching continuation"
        );
        connector.schedule_continuation(intent).await
    }

    pub async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
        let connector = self.selector.select(&info.service).await?;
        connector.poll_routine_result(info).await
    }

    pub async fn request_cancellation(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError> {
        let service = self.canonical(service);
        let connector = self.selector.select(&service).await?;
        connector.request_cancellation(&service, method, intent_id).await
    }

    /// Register an extra subscription at runtime.
    pub fn subscribe(&self, subscription: Subscription) {
        let mut subs = self.subscriptions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !subs.contains(&subscription) {
            subs.push(subscription);
        }
    }

    fn subscribers(&self, publisher: &ServiceId, event: &crate::descriptors::EventId) -> Vec<Subscription> {
        let mut all = self.model.subscribers(publisher, event);
        let extra = self.subscriptions.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        for sub in extra.iter() {
            if self.canonical(&sub.publisher) == *publisher && sub.event == *event && !all.contains(sub) {
                all.push(sub.clone());
            }
        }
        all
    }

    /// Start one routine per subscriber of the event. Returns how many were started.
    ///
    /// Each subscriber run gets an id derived from the event's intent id, so a
    /// re-raised event lands on the same attempts.
    pub async fn raise_event(&self, intent: RaiseEventIntent) -> Result<usize, EngineError> {
        let publisher = self.model.service_resolver().resolve(&intent.service)?;
        let event = self.model.event_resolver().resolve(&publisher, &intent.event)?;
        event.validate(&intent.parameters)?;

        let subscribers = self.subscribers(&publisher.id, &intent.event);
        debug!(
            target: "routine_fabric::fabric",
            service = %publisher.id,
            event = %intent.event,
            subscribers = subscribers.len(),
            "raising event"
        );
        for sub in &subscribers {
            let run = ExecuteRoutineIntent {
                id: format!("{}/{}.{}", intent.id, sub.subscriber, sub.method),
                service: sub.subscriber.clone(),
                method: sub.method.clone(),
                caller: intent.source.clone(),
                flow_context: intent.flow_context.clone(),
                parameters: intent.parameters.clone(),
                continuation: None,
                caller_state: None,
            };
            self.execute(run).await?;
        }
        Ok(subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceDefinition;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Null(&'static str);

    #[async_trait]
    impl FabricConnector for Null {
        fn connector_type(&self) -> &str {
            self.0
        }
        async fn schedule_routine(&self, i: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
            Ok(ActiveRoutineInfo::pending(i.service, i.method, i.id))
        }
        async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
            Ok(info.clone())
        }
        async fn schedule_continuation(&self, i: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
            Ok(ActiveRoutineInfo::pending(i.target.service, i.target.method.method_id(), i.id))
        }
        async fn request_cancellation(&self, _: &ServiceId, _: &MethodId, _: &str) -> Result<bool, EngineError> {
            Ok(false)
        }
    }

    struct CountingFactory(AtomicUsize);

    impl FabricConnectorFactory for CountingFactory {
        fn connector_type(&self) -> &str {
            "null"
        }
        fn create(&self, _config: &ConnectorConfig) -> Result<Arc<dyn FabricConnector>, FabricError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Null("null")))
        }
    }

    fn model() -> CommunicationModel {
        CommunicationModel::builder()
            .service(ServiceDefinition::local("Here").method("Run", |_c, _p| async { Ok(Value::Null) }))
            .service(ServiceDefinition::external("There"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn local_services_need_a_self_connector() {
        let selector = FabricConnectorSelector::new(model(), Arc::new(ServiceDirectory::new()));
        assert_eq!(
            selector.select(&"Here".into()).await.err(),
            Some(FabricError::NoSelfConnector("Here".into()))
        );
        let selector = selector.with_self_connector(Arc::new(Null("self")));
        assert_eq!(selector.select(&"Here".into()).await.unwrap().connector_type(), "self");
    }

    #[tokio::test]
    async fn discovery_refreshes_the_directory_once() {
        let factory = Arc::new(CountingFactory(AtomicUsize::new(0)));
        let directory = Arc::new(ServiceDirectory::new());
        let discovery = StaticDiscovery::new().with("There", ConnectorConfig::new("null", json!({"n": 1})));
        let selector = FabricConnectorSelector::new(model(), directory.clone())
            .with_factory(factory.clone())
            .with_discovery(Arc::new(discovery));

        assert!(directory.lookup("There").is_none());
        selector.select(&"There".into()).await.unwrap();
        assert!(directory.lookup("There").is_some());
        selector.select(&"There".into()).await.unwrap();
        assert_eq!(factory.0.load(Ordering::SeqCst), 1, "connector is cached per configuration");

        assert_eq!(
            selector.select(&"Nowhere".into()).await.err(),
            Some(FabricError::ServiceNotRegistered("Nowhere".into()))
        );
    }

    #[tokio::test]
    async fn unknown_connector_types_are_reported() {
        let directory = Arc::new(ServiceDirectory::new());
        directory.register("There", ConnectorConfig::new("carrier-pigeon", Value::Null));
        let selector = FabricConnectorSelector::new(model(), directory);
        assert_eq!(
            selector.select(&"There".into()).await.err(),
            Some(FabricError::UnknownConnectorType("carrier-pigeon".into()))
        );
    }
}
