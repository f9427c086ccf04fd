use async_trait::async_trait;
use std::sync::{Arc, Weak};

use super::FabricConnector;
use crate::descriptors::{MethodId, ServiceId};
use crate::error::EngineError;
use crate::intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent};
use crate::runtime::TransitionRunner;

/// Self connector: hands intents straight to this process's runner.
///
/// Holds the runner weakly; the runner owns the fabric that owns this connector.
pub struct InProcessConnector {
    runner: Weak<TransitionRunner>,
}

impl InProcessConnector {
    pub fn new(runner: Weak<TransitionRunner>) -> Self {
        Self { runner }
    }

    fn runner(&self) -> Result<Arc<TransitionRunner>, EngineError> {
        self.runner
            .upgrade()
            .ok_or_else(|| EngineError::InvariantViolation("runtime was dropped while its fabric was in use".into()))
    }
}

#[async_trait]
impl FabricConnector for InProcessConnector {
    fn connector_type(&self) -> &str {
        "in-process"
    }

    async fn schedule_routine(&self, intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner()?.execute(intent).await
    }

    async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner()?.poll(info).await
    }

    async fn schedule_continuation(&self, intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        self.runner()?.continue_routine(intent).await
    }

    async fn request_cancellation(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError> {
        self.runner()?.request_cancellation(service, method, intent_id).await
    }
}
