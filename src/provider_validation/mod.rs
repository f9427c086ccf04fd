//! Storage Validation Tests
//!
//! Test bodies shared by every storage backend through the `StorageFactory` trait.

pub mod concurrency;
pub mod results;
pub mod state;

use serde_json::json;

use crate::descriptors::{CallerDescriptor, ContinuationDescriptor, MethodId, PersistedMethodId, ServiceId};
use crate::providers::MethodExecutionState;
use crate::serialization::ValueContainer;

pub(crate) const SERVICE: &str = "Orders";
pub(crate) const METHOD: &str = "Place";

pub(crate) fn service() -> ServiceId {
    ServiceId::new(SERVICE)
}

pub(crate) fn method() -> MethodId {
    MethodId::new(METHOD)
}

/// Attempt identity with no etag, as used for a first write.
pub(crate) fn fresh(intent_id: &str) -> PersistedMethodId {
    method().persisted(intent_id)
}

/// A state exercising every optional part of the snapshot.
pub(crate) fn sample_state(intent_id: &str, step: u32) -> MethodExecutionState {
    let mut state = MethodExecutionState::new(service(), fresh(intent_id));
    state.flow_context.insert("tenant".into(), "t-1".into());
    state.parameters = ValueContainer::new().with("sku", "A-1").with("qty", 2);
    state.method_state = ValueContainer::new().with("step", step).with("notes", json!(["a", "b"]));
    state.continuation = Some(ContinuationDescriptor {
        service: ServiceId::new("Checkout"),
        method: MethodId::new("Run").persisted("root"),
        task_id: Some(format!("root/{step}")),
        continue_at_ms: None,
    });
    state.caller = Some(CallerDescriptor {
        service: ServiceId::new("Checkout"),
        method: MethodId::new("Run"),
        intent_id: "root".into(),
    });
    state
}
