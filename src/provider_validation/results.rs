use serde_json::json;

use super::{method, service};
use crate::intents::TaskResult;
use crate::provider_validations::StorageFactory;
use crate::serialization::ErrorValue;

/// The first result wins; a later, different result is accepted and ignored.
pub async fn test_result_idempotence<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing result idempotence");
    let storage = factory.create_storage().await;
    let first = TaskResult::Value(json!({"total": 10}));

    storage.write_result(&service(), &method(), "res-1", &first).await.unwrap();
    storage.write_result(&service(), &method(), "res-1", &first).await.unwrap();
    storage
        .write_result(&service(), &method(), "res-1", &TaskResult::Canceled)
        .await
        .unwrap();

    let stored = storage.try_read_result(&service(), &method(), "res-1").await.unwrap();
    assert_eq!(stored, Some(first));
}

pub async fn test_missing_result_reads_none<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing missing result");
    let storage = factory.create_storage().await;
    assert!(storage.try_read_result(&service(), &method(), "nobody").await.unwrap().is_none());
}

/// Faults survive storage with their type names and inner errors.
pub async fn test_fault_result_round_trip<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing fault results");
    let storage = factory.create_storage().await;
    let fault = ErrorValue::aggregate(
        "AggregateError",
        "3 calls failed",
        vec![
            ErrorValue::new("Timeout", "inventory"),
            ErrorValue::new("Refused", "payment").with_inner(ErrorValue::new("Io", "reset")),
            ErrorValue::new("NotFound", "sku"),
        ],
    );
    let result = TaskResult::Fault(fault);
    storage.write_result(&service(), &method(), "fault-1", &result).await.unwrap();
    let stored = storage.try_read_result(&service(), &method(), "fault-1").await.unwrap();
    assert_eq!(stored, Some(result));
}
