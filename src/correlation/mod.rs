//! Correlation of live in-process waiters with durable ids.
//!
//! Two registries share one generic implementation: [`TriggerRegistry`] for
//! pending results and [`CancellationRegistry`] for cancellation sources. Each
//! holds only `Weak` back-references keyed by id; the waiter itself owns its id,
//! which is assigned once and never changes.
//!
//! A `try_get` miss is normal: the waiter was already resolved and dropped, or the
//! process restarted. Callers rebuild the waiter from persisted state instead.

mod cancellation;
mod trigger;

pub use cancellation::{CancellationSource, CancellationTokenSourceState};
pub use trigger::{Trigger, TriggerReference};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::trace;

/// A waiter that can be correlated with a durable id.
pub trait Correlated: Send + Sync + 'static {
    /// Slot holding the waiter's durable id once assigned.
    fn correlation_slot(&self) -> &OnceLock<String>;

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_slot().get().map(String::as_str)
    }
}

/// Dead entries are swept once the table reaches this size, and again each time it doubles.
const MIN_SWEEP_AT: usize = 64;

struct Table<T> {
    entries: HashMap<String, Weak<T>>,
    sweep_at: usize,
}

impl<T> Table<T> {
    /// Drop entries whose waiter is gone. Returns how many were removed.
    fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, waiter| waiter.strong_count() > 0);
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP_AT);
        before - self.entries.len()
    }
}

/// Id → waiter table.
pub struct CorrelationRegistry<T: Correlated> {
    kind: &'static str,
    table: Arc<Mutex<Table<T>>>,
}

impl<T: Correlated> Clone for CorrelationRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            table: Arc::clone(&self.table),
        }
    }
}

pub type TriggerRegistry = CorrelationRegistry<Trigger>;
pub type CancellationRegistry = CorrelationRegistry<CancellationSource>;

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new("trigger")
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new("cancellation")
    }
}

impl<T: Correlated> CorrelationRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                sweep_at: MIN_SWEEP_AT,
            })),
        }
    }

    /// Return the waiter's durable id, assigning one the first time it is seen.
    pub fn register(&self, waiter: &Arc<T>) -> String {
        let id = waiter
            .correlation_slot()
            .get_or_init(|| uuid::Uuid::new_v4().simple().to_string())
            .clone();
        self.track(&id, waiter);
        id
    }

    /// Attach a waiter rebuilt from persisted state under its known durable id.
    ///
    /// If the waiter already carries a different id, that id is kept and returned.
    pub fn register_with_id(&self, waiter: &Arc<T>, id: &str) -> String {
        let effective = waiter.correlation_slot().get_or_init(|| id.to_string()).clone();
        self.track(&effective, waiter);
        effective
    }

    fn track(&self, id: &str, waiter: &Arc<T>) {
        let mut table = self.lock();
        let replace = match table.entries.get(id) {
            Some(existing) => existing.strong_count() == 0,
            None => true,
        };
        if replace {
            table.entries.insert(id.to_string(), Arc::downgrade(waiter));
            trace!(target: "routine_fabric::correlation", kind = self.kind, id, "tracking waiter");
        }
        if table.entries.len() >= table.sweep_at {
            let removed = table.sweep();
            trace!(target: "routine_fabric::correlation", kind = self.kind, removed, live = table.entries.len(), "swept dead waiters");
        }
    }

    pub fn try_get(&self, id: &str) -> Option<Arc<T>> {
        let mut table = self.lock();
        match table.entries.get(id).map(Weak::upgrade) {
            Some(Some(live)) => Some(live),
            Some(None) => {
                table.entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Forget an id once its waiter completed naturally.
    pub fn stop_tracking(&self, id: &str) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Number of tracked ids, including ones whose waiter was already dropped.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table<T>> {
        // The table holds no invariants that a panicking holder could break.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
