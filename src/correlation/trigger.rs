use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;

use super::Correlated;
use crate::intents::TaskResult;

/// Durable handle for a pending result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReference {
    pub id: String,
}

/// One-shot result cell with fan-out to any number of waiters.
///
/// The first `resolve` wins; later ones are ignored. Waiters that subscribe
/// after resolution see the stored result immediately.
#[derive(Debug, Default)]
pub struct Trigger {
    id: OnceLock<String>,
    result: Mutex<Option<TaskResult>>,
    notify: Notify,
}

impl Trigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store the result and wake every current waiter. Returns `false` when the
    /// trigger was already resolved.
    pub fn resolve(&self, result: TaskResult) -> bool {
        {
            let mut slot = self.slot();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.slot().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot().is_some()
    }

    pub async fn wait(&self) -> TaskResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a resolve in between is not missed.
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    pub fn reference(&self) -> Option<TriggerReference> {
        self.correlation_id().map(|id| TriggerReference { id: id.to_string() })
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<TaskResult>> {
        self.result.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Correlated for Trigger {
    fn correlation_slot(&self) -> &OnceLock<String> {
        &self.id
    }
}
