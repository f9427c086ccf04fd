//! Fabric configuration.
//!
//! Settings resolve hierarchically, later levels overriding earlier ones:
//! global, primitive kind, service category, service, the service's primitive
//! kind, and finally the named primitive.
//!
//! ```json
//! {
//!   "global": { "storage": "default", "serializer_format": "json" },
//!   "kinds": { "event": { "state_transport": "storage" } },
//!   "categories": { "external": { "serializer_format": "json-compact" } },
//!   "services": {
//!     "Inventory": {
//!       "connector": { "type": "loopback", "settings": { "endpoint": "inventory" } },
//!       "kinds": { "method": { "storage": "durable" } },
//!       "primitives": { "Reserve": { "state_transport": "envelope" } }
//!     }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::EngineError;
use crate::model::ServiceCategory;
use crate::serialization::Format;

/// Where a suspended routine keeps its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTransport {
    /// Write it to the routine's storage.
    #[default]
    Storage,
    /// Carry it inside the outgoing call when exactly one call is outstanding.
    Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Method,
    Event,
}

impl PrimitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveKind::Method => "method",
            PrimitiveKind::Event => "event",
        }
    }
}

/// How to reach a remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(default)]
    pub settings: Value,
}

impl ConnectorConfig {
    pub fn new(connector_type: impl Into<String>, settings: Value) -> Self {
        Self {
            connector_type: connector_type.into(),
            settings,
        }
    }

    /// Identity used to share one connector instance between services.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.connector_type, self.settings)
    }
}

/// One level of the hierarchy; unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_transport: Option<StateTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serializer_format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<ConnectorConfig>,
}

impl SettingsOverride {
    fn apply_to(&self, settings: &mut EffectiveSettings) {
        if let Some(storage) = &self.storage {
            settings.storage = storage.clone();
        }
        if let Some(transport) = self.state_transport {
            settings.state_transport = transport;
        }
        if let Some(format) = self.serializer_format {
            settings.serializer_format = format;
        }
        if let Some(connector) = &self.connector {
            settings.connector = Some(connector.clone());
        }
    }
}

/// Fully resolved settings for one primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub storage: String,
    pub state_transport: StateTransport,
    pub serializer_format: Format,
    pub connector: Option<ConnectorConfig>,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            storage: DEFAULT_STORAGE.to_string(),
            state_transport: StateTransport::Storage,
            serializer_format: Format::Json,
            connector: None,
        }
    }
}

/// Storage name used when nothing else is configured.
pub const DEFAULT_STORAGE: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub settings: SettingsOverride,
    /// Keyed by primitive kind (`method`, `event`).
    #[serde(default)]
    pub kinds: BTreeMap<String, SettingsOverride>,
    /// Keyed by method or event name.
    #[serde(default)]
    pub primitives: BTreeMap<String, SettingsOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub global: SettingsOverride,
    /// Keyed by primitive kind (`method`, `event`).
    #[serde(default)]
    pub kinds: BTreeMap<String, SettingsOverride>,
    /// Keyed by service category (`local`, `external`).
    #[serde(default)]
    pub categories: BTreeMap<String, SettingsOverride>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl FabricConfig {
    pub fn from_json_str(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Config(format!("invalid fabric configuration: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Resolve the settings of `primitive` (a method or event name) on `service`.
    pub fn resolve(
        &self,
        service: &str,
        category: ServiceCategory,
        kind: PrimitiveKind,
        primitive: &str,
    ) -> EffectiveSettings {
        let mut settings = EffectiveSettings::default();
        self.global.apply_to(&mut settings);
        if let Some(o) = self.kinds.get(kind.as_str()) {
            o.apply_to(&mut settings);
        }
        if let Some(o) = self.categories.get(category.as_str()) {
            o.apply_to(&mut settings);
        }
        if let Some(svc) = self.services.get(service) {
            svc.settings.apply_to(&mut settings);
            if let Some(o) = svc.kinds.get(kind.as_str()) {
                o.apply_to(&mut settings);
            }
            if let Some(o) = svc.primitives.get(primitive) {
                o.apply_to(&mut settings);
            }
        }
        settings
    }

    /// Service-level connector entries, used to seed the service directory.
    pub fn connectors(&self) -> impl Iterator<Item = (&str, &ConnectorConfig)> {
        self.services
            .iter()
            .filter_map(|(name, svc)| svc.settings.connector.as_ref().map(|c| (name.as_str(), c)))
    }

    /// Storage names referenced anywhere in the document.
    pub fn storage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::iter::once(&self.global)
            .chain(self.kinds.values())
            .chain(self.categories.values())
            .chain(self.services.values().flat_map(|s| {
                std::iter::once(&s.settings)
                    .chain(s.kinds.values())
                    .chain(s.primitives.values())
            }))
            .filter_map(|o| o.storage.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
