//! Communication model: the declared set of services, their methods, events
//! and event subscriptions.
//!
//! A model is immutable once built and cheap to clone. Methods are registered
//! per interface; the same method name exposed by two interfaces with different
//! handlers is an overload that only an interface-qualified name
//! (`"IWallet.Charge"`) can address unambiguously.

mod resolvers;

pub use resolvers::{EventReference, EventResolver, MethodReference, MethodResolver, ServiceReference, ServiceResolver};

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::descriptors::{EventId, MethodId, ServiceId};
use crate::error::EngineError;
use crate::runtime::{FnRoutine, RoutineContext, RoutineError, RoutineHandler};
use crate::serialization::ValueContainer;

/// Where a service runs relative to this runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCategory {
    /// Hosted by this runtime; methods have handlers.
    Local,
    /// Hosted elsewhere and reached through a connector.
    External,
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::Local => "local",
            ServiceCategory::External => "external",
        }
    }
}

/// One method exposed through one interface.
#[derive(Clone)]
pub struct MethodBinding {
    pub interface: String,
    pub name: String,
    pub(crate) handler: Option<Arc<dyn RoutineHandler>>,
}

impl MethodBinding {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.interface, self.name)
    }
}

impl std::fmt::Debug for MethodBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodBinding")
            .field("interface", &self.interface)
            .field("name", &self.name)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDefinition {
    pub name: String,
    pub parameters: Vec<String>,
}

/// `subscriber.method` runs whenever `publisher` raises `event`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub publisher: ServiceId,
    pub event: EventId,
    pub subscriber: ServiceId,
    pub method: MethodId,
}

#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub alternate_names: Vec<String>,
    pub category: ServiceCategory,
    methods: Vec<MethodBinding>,
    events: Vec<EventDefinition>,
    subscriptions: Vec<Subscription>,
    errors: Vec<String>,
}

impl ServiceDefinition {
    fn new(name: impl Into<String>, category: ServiceCategory) -> Self {
        Self {
            name: name.into(),
            alternate_names: Vec::new(),
            category,
            methods: Vec::new(),
            events: Vec::new(),
            subscriptions: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// A service hosted by this runtime.
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, ServiceCategory::Local)
    }

    /// A service hosted elsewhere. Without declared methods any method name is
    /// accepted, since the remote contract is not known here.
    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, ServiceCategory::External)
    }

    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.alternate_names.push(name.into());
        self
    }

    /// Register a method on the service's default interface (named after the service).
    pub fn method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(RoutineContext, ValueContainer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
    {
        let interface = self.name.clone();
        self.interface_handler(interface, name, Arc::new(FnRoutine(f)))
    }

    pub fn interface_method<F, Fut>(self, interface: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(RoutineContext, ValueContainer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
    {
        self.interface_handler(interface, name, Arc::new(FnRoutine(f)))
    }

    /// Register an existing handler under `interface.name`. Sharing one handler
    /// between interfaces does not make the name ambiguous.
    pub fn interface_handler(
        mut self,
        interface: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn RoutineHandler>,
    ) -> Self {
        let binding = MethodBinding {
            interface: interface.into(),
            name: name.into(),
            handler: Some(handler),
        };
        self.push_binding(binding);
        self
    }

    /// Declare a method of an external service.
    pub fn remote_method(mut self, name: impl Into<String>) -> Self {
        let binding = MethodBinding {
            interface: self.name.clone(),
            name: name.into(),
            handler: None,
        };
        self.push_binding(binding);
        self
    }

    fn push_binding(&mut self, binding: MethodBinding) {
        if self
            .methods
            .iter()
            .any(|m| m.interface == binding.interface && m.name == binding.name)
        {
            self.errors.push(format!(
                "duplicate method registration: {}.{}",
                self.name,
                binding.qualified_name()
            ));
            return;
        }
        if binding.handler.is_some() && self.category == ServiceCategory::External {
            self.errors
                .push(format!("external service {} cannot host handler {}", self.name, binding.qualified_name()));
            return;
        }
        self.methods.push(binding);
    }

    pub fn event<I, S>(mut self, name: impl Into<String>, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if self.events.iter().any(|e| e.name == name) {
            self.errors.push(format!("duplicate event registration: {}.{name}", self.name));
            return self;
        }
        self.events.push(EventDefinition {
            name,
            parameters: parameters.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Run `method` of this service whenever `publisher` raises `event`.
    pub fn subscribe(
        mut self,
        publisher: impl Into<ServiceId>,
        event: impl Into<String>,
        method: impl Into<MethodId>,
    ) -> Self {
        let subscription = Subscription {
            publisher: publisher.into(),
            event: EventId::new(event),
            subscriber: ServiceId::new(self.name.clone()),
            method: method.into(),
        };
        self.subscriptions.push(subscription);
        self
    }

    pub fn methods(&self) -> &[MethodBinding] {
        &self.methods
    }

    pub fn events(&self) -> &[EventDefinition] {
        &self.events
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn is_local(&self) -> bool {
        self.category == ServiceCategory::Local
    }

    fn all_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.alternate_names.iter().map(String::as_str))
    }
}

/// Immutable, shareable set of service definitions.
#[derive(Clone, Default)]
pub struct CommunicationModel {
    inner: Arc<ModelInner>,
}

#[derive(Default)]
struct ModelInner {
    services: Vec<Arc<ServiceDefinition>>,
    // every primary and alternate name -> index into `services`
    by_name: HashMap<String, usize>,
}

pub struct ModelBuilder {
    services: Vec<ServiceDefinition>,
    errors: Vec<String>,
}

impl CommunicationModel {
    pub fn builder() -> ModelBuilder {
        ModelBuilder {
            services: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn service_resolver(&self) -> ServiceResolver {
        ServiceResolver::new(self.clone())
    }

    pub fn method_resolver(&self) -> MethodResolver {
        MethodResolver::new(self.clone())
    }

    pub fn event_resolver(&self) -> EventResolver {
        EventResolver::new(self.clone())
    }

    pub(crate) fn definition(&self, name: &str) -> Option<&Arc<ServiceDefinition>> {
        self.inner.by_name.get(name).map(|idx| &self.inner.services[*idx])
    }

    /// Primary name for any known primary or alternate name.
    pub fn canonical(&self, service: &ServiceId) -> Option<ServiceId> {
        self.definition(&service.name).map(|d| ServiceId::new(d.name.clone()))
    }

    pub fn is_hosted_locally(&self, service: &ServiceId) -> bool {
        self.definition(&service.name).is_some_and(|d| d.is_local())
    }

    /// Subscriptions declared for `event` raised by `publisher`.
    pub fn subscribers(&self, publisher: &ServiceId, event: &EventId) -> Vec<Subscription> {
        let publisher = self.canonical(publisher).unwrap_or_else(|| publisher.clone());
        self.inner
            .services
            .iter()
            .flat_map(|d| d.subscriptions.iter())
            .filter(|s| {
                let declared = self.canonical(&s.publisher).unwrap_or_else(|| s.publisher.clone());
                declared == publisher && s.event == *event
            })
            .cloned()
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.inner.services.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.services.is_empty()
    }

    fn debug_dump(&self) -> HashMap<String, Vec<String>> {
        self.inner
            .services
            .iter()
            .map(|d| (d.name.clone(), d.methods.iter().map(MethodBinding::qualified_name).collect()))
            .collect()
    }

    pub(crate) fn log_resolution_miss(&self, kind: &str, service: &str, member: Option<&str>) {
        tracing::debug!(
            target: "routine_fabric::model",
            kind,
            requested_service = %service,
            requested_member = ?member,
            registered_count = self.inner.services.len(),
            known_names = ?self.inner.by_name.keys().collect::<Vec<_>>(),
            full_model_contents = ?self.debug_dump(),
            "Model lookup miss - dumping declared services"
        );
    }
}

impl std::fmt::Debug for CommunicationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationModel")
            .field("services", &self.service_names())
            .finish()
    }
}

impl ModelBuilder {
    pub fn service(mut self, definition: ServiceDefinition) -> Self {
        self.services.push(definition);
        self
    }

    /// Build the model, returning every registration error at once.
    pub fn build(mut self) -> Result<CommunicationModel, EngineError> {
        let mut by_name = HashMap::new();
        for (idx, def) in self.services.iter().enumerate() {
            self.errors.extend(def.errors.iter().cloned());
            for name in def.all_names() {
                if let Some(previous) = by_name.insert(name.to_string(), idx) {
                    self.errors.push(format!(
                        "service name {name} is claimed by both {} and {}",
                        self.services[previous].name, def.name
                    ));
                }
            }
        }
        for def in &self.services {
            for sub in &def.subscriptions {
                if !def.methods.iter().any(|m| m.name == sub.method.name) {
                    self.errors.push(format!(
                        "subscription of {} to {}.{} targets unknown method {}",
                        def.name, sub.publisher, sub.event, sub.method
                    ));
                }
            }
        }
        if !self.errors.is_empty() {
            return Err(EngineError::Config(self.errors.join("; ")));
        }
        Ok(CommunicationModel {
            inner: Arc::new(ModelInner {
                services: self.services.into_iter().map(Arc::new).collect(),
                by_name,
            }),
        })
    }
}
