use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

use super::Correlated;

/// Durable form of a cancellation source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationTokenSourceState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at_ms: Option<u64>,
}

/// Cooperative cancellation flag for one routine attempt.
///
/// Requesting cancellation only records intent; the routine observes it at its
/// next suspend point.
#[derive(Debug, Default)]
pub struct CancellationSource {
    id: OnceLock<String>,
    // 0 = not requested
    requested_at_ms: AtomicU64,
    notify: Notify,
}

impl CancellationSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rebuild from persisted state. The caller re-registers it to restore the id.
    pub fn from_state(state: &CancellationTokenSourceState) -> Arc<Self> {
        let source = Self::default();
        if let Some(at) = state.cancel_requested_at_ms {
            source.requested_at_ms.store(at.max(1), Ordering::SeqCst);
        }
        Arc::new(source)
    }

    /// Record a cancellation request. Returns `false` if one was already recorded.
    pub fn cancel(&self) -> bool {
        let now = now_ms().max(1);
        let first = self
            .requested_at_ms
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.requested_at_ms.load(Ordering::SeqCst) != 0
    }

    pub fn requested_at_ms(&self) -> Option<u64> {
        match self.requested_at_ms.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }

    /// Durable snapshot; `None` until the source has been registered.
    pub fn state(&self) -> Option<CancellationTokenSourceState> {
        self.correlation_id().map(|id| CancellationTokenSourceState {
            id: id.to_string(),
            cancel_requested_at_ms: self.requested_at_ms(),
        })
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancellation_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl Correlated for CancellationSource {
    fn correlation_slot(&self) -> &OnceLock<String> {
        &self.id
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
