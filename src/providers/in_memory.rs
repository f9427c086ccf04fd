use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{attempt_key, log_ignored_result, MethodExecutionState, MethodStateStorage, StorageError};
use crate::descriptors::{MethodId, PersistedMethodId, ServiceId};
use crate::intents::TaskResult;

/// Process-local storage. State does not survive a restart.
#[derive(Default)]
pub struct InMemoryStorage {
    // attempt key -> (etag, state)
    states: Mutex<HashMap<String, (String, MethodExecutionState)>>,
    results: Mutex<HashMap<String, TaskResult>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything (test utility).
    pub async fn reset(&self) {
        self.states.lock().await.clear();
        self.results.lock().await.clear();
    }

    pub async fn state_count(&self) -> usize {
        self.states.lock().await.len()
    }

    /// Pretty dump of every stored state and result (test utility).
    pub async fn dump_all_pretty(&self) -> String {
        let states = self.states.lock().await;
        let results = self.results.lock().await;
        let mut out = String::new();
        for (key, (etag, state)) in states.iter() {
            out.push_str(&format!("state {key} etag={etag}\n  {state:#?}\n"));
        }
        for (key, result) in results.iter() {
            out.push_str(&format!("result {key}\n  {result:?}\n"));
        }
        out
    }
}

#[async_trait::async_trait]
impl MethodStateStorage for InMemoryStorage {
    async fn write_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
        state: &MethodExecutionState,
    ) -> Result<String, StorageError> {
        let key = attempt_key(service, &method.name, &method.intent_id);
        let mut g = self.states.lock().await;
        let current = g.get(&key).map(|(etag, _)| etag.as_str());
        if current != method.etag.as_deref() {
            return Err(StorageError::conflict(
                "write_state",
                format!("etag mismatch for {key}: expected {:?}, stored {current:?}", method.etag),
            ));
        }
        let etag = uuid::Uuid::new_v4().simple().to_string();
        let mut stored = state.clone();
        stored.method.etag = None;
        g.insert(key, (etag.clone(), stored));
        Ok(etag)
    }

    async fn read_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
    ) -> Result<Option<MethodExecutionState>, StorageError> {
        let key = attempt_key(service, &method.name, &method.intent_id);
        let g = self.states.lock().await;
        Ok(g.get(&key).map(|(etag, state)| {
            let mut state = state.clone();
            state.method.etag = Some(etag.clone());
            state
        }))
    }

    async fn write_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
        result: &TaskResult,
    ) -> Result<(), StorageError> {
        let key = attempt_key(service, &method.name, intent_id);
        let mut g = self.results.lock().await;
        match g.get(&key) {
            Some(stored) => log_ignored_result(self.name(), &key, stored, result),
            None => {
                g.insert(key, result.clone());
            }
        }
        Ok(())
    }

    async fn try_read_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<TaskResult>, StorageError> {
        let key = attempt_key(service, &method.name, intent_id);
        Ok(self.results.lock().await.get(&key).cloned())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn states_of_distinct_attempts_do_not_collide() {
        let store = InMemoryStorage::new();
        let svc = ServiceId::new("A");
        let one = MethodId::new("Foo").persisted("1");
        let two = MethodId::new("Foo").persisted("2");
        store
            .write_state(&svc, &one, &MethodExecutionState::new(svc.clone(), one.clone()))
            .await
            .unwrap();
        assert!(store.read_state(&svc, &two).await.unwrap().is_none());
        assert_eq!(store.state_count().await, 1);

        store.reset().await;
        assert_eq!(store.state_count().await, 0);
    }

    #[tokio::test]
    async fn dump_lists_results() {
        let store = InMemoryStorage::new();
        store
            .write_result(&"A".into(), &"Foo".into(), "1", &TaskResult::Value(json!(7)))
            .await
            .unwrap();
        assert!(store.dump_all_pretty().await.contains("result A.Foo#1"));
    }
}
