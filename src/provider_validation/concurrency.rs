use std::sync::Arc;

use super::{fresh, sample_state, service};
use crate::provider_validations::StorageFactory;

/// Writes with a stale or missing etag are conflicts and leave the state alone.
pub async fn test_stale_etag_conflict<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing stale etag rejection");
    let storage = factory.create_storage().await;
    let first = storage.write_state(&service(), &fresh("cc-1"), &sample_state("cc-1", 1)).await.unwrap();

    // Nothing-stored claim while state exists.
    let err = storage
        .write_state(&service(), &fresh("cc-1"), &sample_state("cc-1", 9))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");

    let second = storage
        .write_state(&service(), &fresh("cc-1").with_etag(Some(first.clone())), &sample_state("cc-1", 2))
        .await
        .unwrap();

    let err = storage
        .write_state(&service(), &fresh("cc-1").with_etag(Some(first)), &sample_state("cc-1", 9))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");

    let read = storage.read_state(&service(), &fresh("cc-1")).await.unwrap().unwrap();
    assert_eq!(read.etag(), Some(second.as_str()));
    assert_eq!(read.method_state.get::<u32>("step").unwrap(), 2);
}

/// Racing creators of the same attempt: exactly one wins.
pub async fn test_concurrent_first_writes_single_winner<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing racing first writes");
    let storage = factory.create_storage().await;
    let mut handles = Vec::new();
    for step in 0..8u32 {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            storage
                .write_state(&service(), &fresh("race-1"), &sample_state("race-1", step))
                .await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(e.is_conflict(), "losers must see conflicts, got {e}"),
        }
    }
    assert_eq!(winners, 1);
}

/// Racing updaters holding the same etag: exactly one wins.
pub async fn test_concurrent_updates_single_winner<F: StorageFactory>(factory: &F) {
    tracing::info!("→ Testing racing updates");
    let storage = factory.create_storage().await;
    let etag = storage.write_state(&service(), &fresh("race-2"), &sample_state("race-2", 0)).await.unwrap();

    let mut handles = Vec::new();
    for step in 1..=8u32 {
        let storage = Arc::clone(&storage);
        let current = fresh("race-2").with_etag(Some(etag.clone()));
        handles.push(tokio::spawn(async move {
            let mut state = sample_state("race-2", step);
            state.method = current.clone();
            storage.write_state(&service(), &current, &state).await.map(|_| step)
        }));
    }
    let mut winner = None;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(step) => {
                assert!(winner.is_none(), "two updates won with the same etag");
                winner = Some(step);
            }
            Err(e) => assert!(e.is_conflict(), "losers must see conflicts, got {e}"),
        }
    }
    let winner = winner.expect("one update wins");
    let read = storage.read_state(&service(), &fresh("race-2")).await.unwrap().unwrap();
    assert_eq!(read.method_state.get::<u32>("step").unwrap(), winner);
}
