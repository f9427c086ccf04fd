//! Storage Validation Infrastructure
//!
//! Reusable checks for [`MethodStateStorage`] implementations. Enable the
//! `provider-test` feature to use them.
//!
//! # Example
//!
//! ```rust,ignore
//! use routine_fabric::providers::MethodStateStorage;
//! use routine_fabric::provider_validations::StorageFactory;
//! use std::sync::Arc;
//!
//! struct MyStorageFactory;
//!
//! #[async_trait::async_trait]
//! impl StorageFactory for MyStorageFactory {
//!     async fn create_storage(&self) -> Arc<dyn MethodStateStorage> {
//!         Arc::new(MyStorage::connect().await.unwrap())
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_storage_honours_the_contract() {
//!     routine_fabric::provider_validations::run_all(&MyStorageFactory).await;
//! }
//! ```
//!
//! Available test functions:
//!
//! **State:**
//! - `test_state_round_trip` - written state reads back unchanged, with its etag
//! - `test_missing_state_reads_none` - unknown attempts have no state
//! - `test_state_isolated_per_attempt` - intent ids and methods do not share state
//! - `test_overwrite_replaces_state` - a matching etag replaces the snapshot
//!
//! **Results:**
//! - `test_result_idempotence` - the first result wins, later writes are no-ops
//! - `test_missing_result_reads_none` - unknown attempts have no result
//! - `test_fault_result_round_trip` - faults keep type names and aggregates
//!
//! **Concurrency:**
//! - `test_stale_etag_conflict` - stale or missing etags are rejected
//! - `test_concurrent_first_writes_single_winner` - one of many racing creators wins
//! - `test_concurrent_updates_single_winner` - one of many racing updaters wins

use std::sync::Arc;

use crate::providers::MethodStateStorage;

pub use crate::provider_validation::concurrency::{
    test_concurrent_first_writes_single_winner, test_concurrent_updates_single_winner, test_stale_etag_conflict,
};
pub use crate::provider_validation::results::{
    test_fault_result_round_trip, test_missing_result_reads_none, test_result_idempotence,
};
pub use crate::provider_validation::state::{
    test_missing_state_reads_none, test_overwrite_replaces_state, test_state_isolated_per_attempt,
    test_state_round_trip,
};

/// Trait for creating storages in tests.
///
/// Each call should return a fresh, isolated storage: a new in-memory store,
/// or a file-backed one under a unique temporary path.
#[async_trait::async_trait]
pub trait StorageFactory: Send + Sync {
    async fn create_storage(&self) -> Arc<dyn MethodStateStorage>;
}

/// Run every check against storages from `factory`.
pub async fn run_all<F: StorageFactory>(factory: &F) {
    test_state_round_trip(factory).await;
    test_missing_state_reads_none(factory).await;
    test_state_isolated_per_attempt(factory).await;
    test_overwrite_replaces_state(factory).await;
    test_result_idempotence(factory).await;
    test_missing_result_reads_none(factory).await;
    test_fault_result_round_trip(factory).await;
    test_stale_etag_conflict(factory).await;
    test_concurrent_first_writes_single_winner(factory).await;
    test_concurrent_updates_single_winner(factory).await;
}
