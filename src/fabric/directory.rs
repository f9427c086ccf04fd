use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::FabricError;
use crate::config::ConnectorConfig;
use crate::descriptors::ServiceId;

/// Service name -> connector configuration. Many readers, one writer at a time.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    entries: RwLock<HashMap<String, ConnectorConfig>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded<'a>(entries: impl IntoIterator<Item = (&'a str, &'a ConnectorConfig)>) -> Self {
        let directory = Self::new();
        for (service, config) in entries {
            directory.register(service, config.clone());
        }
        directory
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConnectorConfig>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectorConfig>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lookup(&self, service: &str) -> Option<ConnectorConfig> {
        self.read().get(service).cloned()
    }

    /// Insert or replace; returns the previous entry.
    pub fn register(&self, service: &str, config: ConnectorConfig) -> Option<ConnectorConfig> {
        self.write().insert(service.to_string(), config)
    }

    pub fn remove(&self, service: &str) -> Option<ConnectorConfig> {
        self.write().remove(service)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fallback lookup for services missing from the directory.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// `Ok(None)` means the service is unknown to discovery as well.
    async fn discover(&self, service: &ServiceId) -> Result<Option<ConnectorConfig>, FabricError>;
}

/// Discovery backed by a fixed table, for tests and static deployments.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    entries: HashMap<String, ConnectorConfig>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: impl Into<String>, config: ConnectorConfig) -> Self {
        self.entries.insert(service.into(), config);
        self
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, service: &ServiceId) -> Result<Option<ConnectorConfig>, FabricError> {
        Ok(self.entries.get(&service.name).cloned())
    }
}
