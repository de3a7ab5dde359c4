//! Poller counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Running counters kept by the poller.
#[derive(Debug, Default)]
pub struct PollerStats {
    delivered: AtomicU64,
    requeued: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_missing_context: AtomicU64,
    corrupt_members: AtomicU64,
    store_errors: AtomicU64,
}

/// Point-in-time copy of [`PollerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStatsSnapshot {
    /// Notifications placed on the queue
    pub delivered: u64,
    /// Entries popped early and put back
    pub requeued: u64,
    /// Notifications lost to a full queue
    pub dropped_overflow: u64,
    /// Due timers dropped because their context was gone
    pub dropped_missing_context: u64,
    /// Popped members that were not valid timer ids
    pub corrupt_members: u64,
    /// Failed store operations
    pub store_errors: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PollerStats {
    pub(crate) fn record_delivered(&self) {
        bump(&self.delivered);
    }

    pub(crate) fn record_requeued(&self) {
        bump(&self.requeued);
    }

    pub(crate) fn record_dropped_overflow(&self) {
        bump(&self.dropped_overflow);
    }

    pub(crate) fn record_missing_context(&self) {
        bump(&self.dropped_missing_context);
    }

    pub(crate) fn record_corrupt_member(&self) {
        bump(&self.corrupt_members);
    }

    pub(crate) fn record_store_error(&self) {
        bump(&self.store_errors);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> PollerStatsSnapshot {
        PollerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_missing_context: self.dropped_missing_context.load(Ordering::Relaxed),
            corrupt_members: self.corrupt_members.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
