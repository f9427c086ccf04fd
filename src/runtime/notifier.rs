//! Wakes local waiters when a routine attempt reaches its outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::correlation::{Trigger, TriggerRegistry};
use crate::descriptors::{MethodId, ServiceId};
use crate::intents::TaskResult;

/// Waiter key of one attempt.
pub fn completion_key(service: &ServiceId, method: &MethodId, intent_id: &str) -> String {
    format!("{service}.{method}#{intent_id}")
}

/// One [`Trigger`] per attempt. A completion with nobody waiting is kept so a
/// late subscriber still sees it; the oldest unclaimed completions are evicted
/// past `capacity`.
pub struct CompletionNotifier {
    registry: TriggerRegistry,
    triggers: Mutex<Slots>,
    capacity: usize,
}

#[derive(Default)]
struct Slots {
    by_key: HashMap<String, Arc<Trigger>>,
    // resolved keys in completion order, for eviction
    resolved: VecDeque<String>,
}

impl CompletionNotifier {
    pub fn new(registry: TriggerRegistry, capacity: usize) -> Self {
        Self {
            registry,
            triggers: Mutex::new(Slots::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.triggers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, slots: &mut Slots, key: &str) -> Arc<Trigger> {
        slots
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| {
                let trigger = Trigger::new();
                self.registry.register_with_id(&trigger, key);
                trigger
            })
            .clone()
    }

    /// Resolve the attempt's trigger. Returns `false` if it already had a result.
    pub fn notify(&self, service: &ServiceId, method: &MethodId, intent_id: &str, result: TaskResult) -> bool {
        let key = completion_key(service, method, intent_id);
        let trigger = {
            let mut slots = self.lock();
            let trigger = self.slot(&mut slots, &key);
            if !trigger.is_resolved() {
                slots.resolved.push_back(key.clone());
                while slots.resolved.len() > self.capacity {
                    if let Some(oldest) = slots.resolved.pop_front() {
                        slots.by_key.remove(&oldest);
                        self.registry.stop_tracking(&oldest);
                    }
                }
            }
            trigger
        };
        let fresh = trigger.resolve(result);
        tracing::debug!(target: "routine_fabric::runtime::notifier", key = %key, fresh, "completion notified");
        fresh
    }

    /// Trigger for the attempt, created on demand. Subscribing before or after
    /// `notify` sees the same result.
    pub fn subscribe(&self, service: &ServiceId, method: &MethodId, intent_id: &str) -> Arc<Trigger> {
        let key = completion_key(service, method, intent_id);
        let mut slots = self.lock();
        self.slot(&mut slots, &key)
    }

    pub async fn wait(&self, service: &ServiceId, method: &MethodId, intent_id: &str) -> TaskResult {
        let trigger = self.subscribe(service, method, intent_id);
        trigger.wait().await
    }

    /// Stop tracking the attempt once every interested waiter has its result.
    pub fn forget(&self, service: &ServiceId, method: &MethodId, intent_id: &str) {
        let key = completion_key(service, method, intent_id);
        let mut slots = self.lock();
        slots.by_key.remove(&key);
        slots.resolved.retain(|k| k != &key);
        self.registry.stop_tracking(&key);
    }

    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
