//! Converters for live waiters: a pending trigger or a cancellation source is
//! persisted as its durable correlation id, never as the live handle.

use std::any::{Any, TypeId};
use std::sync::Arc;

use super::{SerializationError, ValueContainer, ValueConverter};
use crate::correlation::{
    CancellationRegistry, CancellationSource, CancellationTokenSourceState, Trigger, TriggerRegistry,
};
use crate::intents::TaskResult;

pub(crate) struct TriggerConverter {
    registry: TriggerRegistry,
}

impl TriggerConverter {
    pub(crate) fn new(registry: TriggerRegistry) -> Self {
        Self { registry }
    }
}

impl ValueConverter for TriggerConverter {
    fn name(&self) -> &'static str {
        "trigger"
    }

    fn accepts(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<Arc<Trigger>>()
    }

    fn decompose(&self, value: &dyn Any) -> Result<ValueContainer, SerializationError> {
        let trigger = value
            .downcast_ref::<Arc<Trigger>>()
            .ok_or(SerializationError::TypeMismatch { expected: "Arc<Trigger>" })?;
        let id = self.registry.register(trigger);
        let mut container = ValueContainer::new().with("id", id);
        if let Some(result) = trigger.result() {
            container.insert("result", &result)?;
        }
        Ok(container)
    }

    fn compose(&self, _type_id: TypeId, container: &ValueContainer) -> Result<Box<dyn Any + Send>, SerializationError> {
        let id: String = container.get("id")?;
        if let Some(live) = self.registry.try_get(&id) {
            return Ok(Box::new(live));
        }
        // Not in this process (resolved and dropped, or restarted): materialize a
        // fresh waiter under the same id so later signals still find it.
        let fresh = Trigger::new();
        if let Some(result) = container.get_opt::<TaskResult>("result")? {
            fresh.resolve(result);
        }
        self.registry.register_with_id(&fresh, &id);
        Ok(Box::new(fresh))
    }
}

pub(crate) struct CancellationConverter {
    registry: CancellationRegistry,
}

impl CancellationConverter {
    pub(crate) fn new(registry: CancellationRegistry) -> Self {
        Self { registry }
    }
}

impl ValueConverter for CancellationConverter {
    fn name(&self) -> &'static str {
        "cancellation"
    }

    fn accepts(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<Arc<CancellationSource>>()
    }

    fn decompose(&self, value: &dyn Any) -> Result<ValueContainer, SerializationError> {
        let source = value
            .downcast_ref::<Arc<CancellationSource>>()
            .ok_or(SerializationError::TypeMismatch { expected: "Arc<CancellationSource>" })?;
        let id = self.registry.register(source);
        let state = CancellationTokenSourceState {
            id,
            cancel_requested_at_ms: source.requested_at_ms(),
        };
        let mut container = ValueContainer::new();
        container.insert("id", &state.id)?;
        container.insert("cancel_requested_at_ms", &state.cancel_requested_at_ms)?;
        Ok(container)
    }

    fn compose(&self, _type_id: TypeId, container: &ValueContainer) -> Result<Box<dyn Any + Send>, SerializationError> {
        let state = CancellationTokenSourceState {
            id: container.get("id")?,
            cancel_requested_at_ms: container.get_opt("cancel_requested_at_ms")?,
        };
        if let Some(live) = self.registry.try_get(&state.id) {
            if state.cancel_requested_at_ms.is_some() {
                live.cancel();
            }
            return Ok(Box::new(live));
        }
        let rebuilt = CancellationSource::from_state(&state);
        self.registry.register_with_id(&rebuilt, &state.id);
        Ok(Box::new(rebuilt))
    }
}
