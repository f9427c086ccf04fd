use super::{fresh, method, sample_state, service};
use crate::provider_validations::StorageFactory;

/// Written state reads back unchanged and carries the returned etag.
pub async fn test_state_round_trip<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing state round trip");
    let storage = factory.create_storage().await;
    let state = sample_state("rt-1", 1);

    let etag = storage.write_state(&service(), &fresh("rt-1"), &state).await.unwrap();
    assert!(!etag.is_empty(), "etag must be non-empty");

    let read = storage.read_state(&service(), &fresh("rt-1")).await.unwrap().expect("state stored");
    assert_eq!(read.etag(), Some(etag.as_str()));
    let mut expected = state.clone();
    expected.method.etag = Some(etag);
    assert_eq!(read, expected);
}

pub async fn test_missing_state_reads_none<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing missing state");
    let storage = factory.create_storage().await;
    assert!(storage.read_state(&service(), &fresh("nobody")).await.unwrap().is_none());
}

/// Attempts are keyed by service, method and intent id.
pub async fn test_state_isolated_per_attempt<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing state isolation between attempts");
    let storage = factory.create_storage().await;
    storage.write_state(&service(), &fresh("iso-1"), &sample_state("iso-1", 1)).await.unwrap();
    storage.write_state(&service(), &fresh("iso-2"), &sample_state("iso-2", 2)).await.unwrap();

    let first = storage.read_state(&service(), &fresh("iso-1")).await.unwrap().unwrap();
    let second = storage.read_state(&service(), &fresh("iso-2")).await.unwrap().unwrap();
    assert_eq!(first.method_state.get::<u32>("step").unwrap(), 1);
    assert_eq!(second.method_state.get::<u32>("step").unwrap(), 2);

    let other_method = crate::descriptors::MethodId::new("Cancel").persisted("iso-1");
    assert!(storage.read_state(&service(), &other_method).await.unwrap().is_none());
    assert_eq!(method().persisted("iso-1"), fresh("iso-1"));
}

/// Writing with the current etag replaces the snapshot and rotates the etag.
pub async fn test_overwrite_replaces_state<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing overwrite with matching etag");
    let storage = factory.create_storage().await;
    let first = storage.write_state(&service(), &fresh("ow-1"), &sample_state("ow-1", 1)).await.unwrap();

    let current = fresh("ow-1").with_etag(Some(first.clone()));
    let mut next = sample_state("ow-1", 2);
    next.method = current.clone();
    let second = storage.write_state(&service(), &current, &next).await.unwrap();
    assert_ne!(first, second, "etag must change on every write");

    let read = storage.read_state(&service(), &fresh("ow-1")).await.unwrap().unwrap();
    assert_eq!(read.method_state.get::<u32>("step").unwrap(), 2);
    assert_eq!(read.etag(), Some(second.as_str()));
}
