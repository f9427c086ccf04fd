//! Loopback transport: envelopes are encoded to bytes and handed to a named
//! endpoint in the same process, exactly as a network adapter would hand them
//! to a remote runtime.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use super::envelopes::{self, CancelEnvelope, ContinueEnvelope, InvokeEnvelope, PollEnvelope, ReplyEnvelope, WireEnvelope};
use super::{FabricConnector, FabricConnectorFactory, FabricError};
use crate::config::ConnectorConfig;
use crate::descriptors::{MethodId, ServiceId};
use crate::error::EngineError;
use crate::intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent};
use crate::runtime::TransitionRunner;
use crate::serialization::{Format, ValueSerializer};

/// Receives encoded envelopes and returns an encoded reply.
#[async_trait]
pub trait EnvelopeEndpoint: Send + Sync {
    async fn deliver(&self, payload: Vec<u8>) -> Result<Vec<u8>, EngineError>;
}

/// Named endpoints reachable by loopback connectors.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<RwLock<HashMap<String, Arc<dyn EnvelopeEndpoint>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, name: impl Into<String>, endpoint: Arc<dyn EnvelopeEndpoint>) {
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), endpoint);
    }

    /// Simulate the endpoint going away.
    pub fn unbind(&self, name: &str) -> bool {
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<dyn EnvelopeEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

/// Connector type `loopback`; settings: `{"endpoint": "<name>"}`.
pub struct LoopbackConnectorFactory {
    network: LoopbackNetwork,
}

impl LoopbackConnectorFactory {
    pub const TYPE: &'static str = "loopback";

    pub fn new(network: LoopbackNetwork) -> Self {
        Self { network }
    }
}

impl FabricConnectorFactory for LoopbackConnectorFactory {
    fn connector_type(&self) -> &str {
        Self::TYPE
    }

    fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn FabricConnector>, FabricError> {
        let endpoint = config
            .settings
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FabricError::InvalidConnectorConfig {
                connector_type: Self::TYPE.to_string(),
                message: "missing string setting 'endpoint'".to_string(),
            })?;
        Ok(Arc::new(LoopbackConnector::new(self.network.clone(), endpoint)))
    }
}

pub struct LoopbackConnector {
    network: LoopbackNetwork,
    endpoint: String,
    serializer: ValueSerializer,
}

impl LoopbackConnector {
    pub fn new(network: LoopbackNetwork, endpoint: impl Into<String>) -> Self {
        Self {
            network,
            endpoint: endpoint.into(),
            serializer: ValueSerializer::default(),
        }
    }

    async fn send(&self, envelope: WireEnvelope) -> Result<ReplyEnvelope, EngineError> {
        let endpoint = self
            .network
            .endpoint(&self.endpoint)
            .ok_or_else(|| EngineError::Transport(format!("loopback endpoint '{}' is not bound", self.endpoint)))?;
        let payload = envelopes::encode(&envelope)?;
        tracing::trace!(
            target: "routine_fabric::fabric::loopback",
            endpoint = %self.endpoint,
            bytes = payload.len(),
            "sending envelope"
        );
        let reply = endpoint.deliver(payload).await?;
        envelopes::decode(&reply)
    }
}

#[async_trait]
impl FabricConnector for LoopbackConnector {
    fn connector_type(&self) -> &str {
        LoopbackConnectorFactory::TYPE
    }

    async fn schedule_routine(&self, intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        self.send(WireEnvelope::Invoke(InvokeEnvelope::from(intent)))
            .await?
            .into_info()
    }

    async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
        let envelope = PollEnvelope {
            service: info.service.clone(),
            method: info.method.clone(),
            intent_id: info.intent_id.clone(),
        };
        self.send(WireEnvelope::Poll(envelope)).await?.into_info()
    }

    async fn schedule_continuation(&self, intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        let envelope = ContinueEnvelope::from_intent(intent, &self.serializer, Format::JsonCompact)?;
        self.send(WireEnvelope::Continue(envelope)).await?.into_info()
    }

    async fn request_cancellation(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError> {
        let envelope = CancelEnvelope {
            service: service.clone(),
            method: method.clone(),
            intent_id: intent_id.to_string(),
        };
        self.send(WireEnvelope::Cancel(envelope)).await?.into_cancelled()
    }
}

/// Endpoint that decodes envelopes into calls on a runtime's runner.
pub struct RuntimeEndpoint {
    runner: Weak<TransitionRunner>,
}

impl RuntimeEndpoint {
    pub fn new(runner: Weak<TransitionRunner>) -> Self {
        Self { runner }
    }

    async fn handle(&self, envelope: WireEnvelope) -> Result<ReplyEnvelope, EngineError> {
        let runner = self
            .runner
            .upgrade()
            .ok_or_else(|| EngineError::Transport("runtime behind this endpoint was dropped".into()))?;
        let reply = match envelope {
            WireEnvelope::Invoke(invoke) => ReplyEnvelope::info(runner.execute(invoke.into()).await?),
            WireEnvelope::Continue(cont) => {
                let intent = cont.into_intent(runner.serializer())?;
                ReplyEnvelope::info(runner.continue_routine(intent).await?)
            }
            WireEnvelope::Poll(poll) => {
                let info = ActiveRoutineInfo::pending(poll.service, poll.method, poll.intent_id);
                ReplyEnvelope::info(runner.poll(&info).await?)
            }
            WireEnvelope::Cancel(cancel) => ReplyEnvelope::cancelled(
                runner
                    .request_cancellation(&cancel.service, &cancel.method, &cancel.intent_id)
                    .await?,
            ),
        };
        Ok(reply)
    }
}

#[async_trait]
impl EnvelopeEndpoint for RuntimeEndpoint {
    async fn deliver(&self, payload: Vec<u8>) -> Result<Vec<u8>, EngineError> {
        let envelope: WireEnvelope = envelopes::decode(&payload)?;
        let reply = match self.handle(envelope).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(target: "routine_fabric::fabric::loopback", error = %e, "envelope handling failed");
                ReplyEnvelope::error(&e)
            }
        };
        envelopes::encode(&reply)
    }
}
