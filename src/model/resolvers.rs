//! Resolvers map logical descriptors onto the communication model. They never
//! retry: an unresolvable name is a permanent failure for the current attempt.

use std::sync::Arc;

use super::{CommunicationModel, MethodBinding, ServiceCategory, ServiceDefinition};
use crate::descriptors::{EventId, MethodId, ServiceId};
use crate::error::ResolutionError;
use crate::runtime::RoutineHandler;
use crate::serialization::ValueContainer;

/// A resolved service, addressed by its primary name.
#[derive(Debug, Clone)]
pub struct ServiceReference {
    pub id: ServiceId,
    pub category: ServiceCategory,
    definition: Arc<ServiceDefinition>,
}

impl ServiceReference {
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn is_local(&self) -> bool {
        self.category == ServiceCategory::Local
    }
}

/// A resolved method, bound to exactly one concrete handler (local services).
#[derive(Clone)]
pub struct MethodReference {
    pub service: ServiceId,
    pub method: MethodId,
    pub interface: String,
    handler: Option<Arc<dyn RoutineHandler>>,
}

impl MethodReference {
    /// The invokable handler; external methods have none.
    pub fn handler(&self) -> Result<&Arc<dyn RoutineHandler>, ResolutionError> {
        self.handler
            .as_ref()
            .ok_or_else(|| ResolutionError::NotHostedLocally(self.service.name.clone()))
    }
}

impl std::fmt::Debug for MethodReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodReference")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("interface", &self.interface)
            .field("invokable", &self.handler.is_some())
            .finish()
    }
}

/// A resolved event and the parameters it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReference {
    pub service: ServiceId,
    pub event: EventId,
    pub parameters: Vec<String>,
}

impl EventReference {
    /// Every declared parameter must be present.
    pub fn validate(&self, parameters: &ValueContainer) -> Result<(), ResolutionError> {
        match self.parameters.iter().find(|p| !parameters.contains(p)) {
            Some(missing) => Err(ResolutionError::MissingEventParameter {
                event: format!("{}.{}", self.service, self.event),
                parameter: missing.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct ServiceResolver {
    model: CommunicationModel,
}

impl ServiceResolver {
    pub(crate) fn new(model: CommunicationModel) -> Self {
        Self { model }
    }

    pub fn resolve(&self, service: &ServiceId) -> Result<ServiceReference, ResolutionError> {
        match self.model.definition(&service.name) {
            Some(definition) => Ok(ServiceReference {
                id: ServiceId::new(definition.name.clone()),
                category: definition.category,
                definition: definition.clone(),
            }),
            None => {
                self.model.log_resolution_miss("service", &service.name, None);
                Err(ResolutionError::UnknownService(service.name.clone()))
            }
        }
    }
}

#[derive(Clone)]
pub struct MethodResolver {
    model: CommunicationModel,
}

impl MethodResolver {
    pub(crate) fn new(model: CommunicationModel) -> Self {
        Self { model }
    }

    /// Resolve `method` on `service`. Accepts `Name` or `Interface.Name`; a plain
    /// name bound to more than one distinct handler is ambiguous.
    pub fn resolve(&self, service: &ServiceReference, method: &MethodId) -> Result<MethodReference, ResolutionError> {
        let definition = service.definition();
        let candidates: Vec<&MethodBinding> = definition
            .methods()
            .iter()
            .filter(|m| m.name == method.name || m.qualified_name() == method.name)
            .collect();

        if candidates.is_empty() {
            if service.category == ServiceCategory::External && definition.methods().is_empty() {
                return Ok(MethodReference {
                    service: service.id.clone(),
                    method: method.clone(),
                    interface: definition.name.clone(),
                    handler: None,
                });
            }
            self.model
                .log_resolution_miss("method", &service.id.name, Some(&method.name));
            return Err(ResolutionError::UnknownMethod {
                service: service.id.name.clone(),
                method: method.name.clone(),
            });
        }

        let first = candidates[0];
        let distinct = candidates.iter().filter(|c| !same_handler(c, first)).count();
        if distinct > 0 {
            return Err(ResolutionError::AmbiguousMethod {
                service: service.id.name.clone(),
                method: method.name.clone(),
                candidates: candidates.iter().map(|c| c.qualified_name()).collect(),
            });
        }
        Ok(MethodReference {
            service: service.id.clone(),
            method: MethodId::new(first.name.clone()),
            interface: first.interface.clone(),
            handler: first.handler.clone(),
        })
    }
}

fn same_handler(a: &MethodBinding, b: &MethodBinding) -> bool {
    match (&a.handler, &b.handler) {
        (Some(x), Some(y)) => std::ptr::eq(Arc::as_ptr(x) as *const (), Arc::as_ptr(y) as *const ()),
        (None, None) => true,
        _ => false,
    }
}

#[derive(Clone)]
pub struct EventResolver {
    model: CommunicationModel,
}

impl EventResolver {
    pub(crate) fn new(model: CommunicationModel) -> Self {
        Self { model }
    }

    pub fn resolve(&self, service: &ServiceReference, event: &EventId) -> Result<EventReference, ResolutionError> {
        match service.definition().events().iter().find(|e| e.name == event.name) {
            Some(definition) => Ok(EventReference {
                service: service.id.clone(),
                event: event.clone(),
                parameters: definition.parameters.clone(),
            }),
            None => {
                self.model.log_resolution_miss("event", &service.id.name, Some(&event.name));
                Err(ResolutionError::UnknownEvent {
                    service: service.id.name.clone(),
                    event: event.name.clone(),
                })
            }
        }
    }
}
