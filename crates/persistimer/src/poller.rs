//! Background poller moving due timers from the store onto the queue.
//!
//! One poller runs per namespace. Each pass pops the earliest entry,
//! puts it back if it is not yet due, and otherwise loads its context and
//! pushes the notification. Only the wait for the next entry and the
//! pauses between passes are cut short by a stop signal; a popped entry is
//! always carried through to requeue, drop, or delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::ManagerConfig;
use crate::error::StoreResult;
use crate::queue::{NotificationQueue, PushOutcome};
use crate::stats::PollerStats;
use crate::store::{ScoredMember, TimerStore, context_key};
use crate::timer::{Timer, TimerId};

/// What one pass of the poller did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Nothing arrived within the poll horizon.
    Idle,
    /// The store failed; back off before the next pass.
    StoreFailed,
    /// The head was not due and went back into the set.
    Requeued { wait: Duration },
    /// The popped member was not a usable timer.
    Corrupt,
    /// The timer was due but its context was gone.
    ContextMissing,
    /// The notification was queued.
    Delivered,
    /// The queue was full and the notification was lost.
    Dropped,
    /// Consumers are gone for good.
    QueueClosed,
}

pub(crate) struct Poller {
    store: Arc<dyn TimerStore>,
    config: ManagerConfig,
    queue: NotificationQueue,
    stats: Arc<PollerStats>,
}

impl Poller {
    pub(crate) fn new(
        store: Arc<dyn TimerStore>,
        config: ManagerConfig,
        queue: NotificationQueue,
        stats: Arc<PollerStats>,
    ) -> Self {
        Self {
            store,
            config,
            queue,
            stats,
        }
    }

    /// Poll until `stop` flips to true or its sender goes away.
    ///
    /// The queue is closed on exit so consumers see the end of the stream.
    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        let namespace = self.config.namespace.clone();
        info!(namespace = %namespace, "Timer poller started");

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let popped = tokio::select! {
                popped = self.store.pop_min(&namespace, self.config.poll_horizon()) => popped,
                _ = stop.changed() => break,
            };

            let pause = match self.handle(popped).await {
                PollOutcome::StoreFailed => self.config.error_backoff(),
                PollOutcome::Requeued { wait } => wait,
                PollOutcome::QueueClosed => break,
                PollOutcome::Idle
                | PollOutcome::Corrupt
                | PollOutcome::ContextMissing
                | PollOutcome::Delivered
                | PollOutcome::Dropped => continue,
            };

            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                _ = stop.changed() => break,
            }
        }

        self.queue.close();
        info!(namespace = %namespace, "Timer poller stopped");
    }

    #[cfg(test)]
    async fn poll_once(&self) -> PollOutcome {
        let popped = self
            .store
            .pop_min(&self.config.namespace, self.config.poll_horizon())
            .await;
        self.handle(popped).await
    }

    async fn handle(&self, popped: StoreResult<Option<ScoredMember>>) -> PollOutcome {
        match popped {
            Ok(Some(entry)) => self.process(entry).await,
            Ok(None) => {
                trace!(namespace = %self.config.namespace, "No timers within poll horizon");
                PollOutcome::Idle
            }
            Err(err) => {
                self.stats.record_store_error();
                warn!(
                    namespace = %self.config.namespace,
                    error = %err,
                    backoff_ms = self.config.error_backoff_ms,
                    "Failed to pop next timer"
                );
                PollOutcome::StoreFailed
            }
        }
    }

    async fn process(&self, entry: ScoredMember) -> PollOutcome {
        let namespace = &self.config.namespace;

        let id = match TimerId::parse(entry.member.as_str()) {
            Ok(id) => id,
            Err(err) => {
                self.stats.record_corrupt_member();
                warn!(namespace = %namespace, member = ?entry.member, error = %err, "Skipping corrupt timer entry");
                return PollOutcome::Corrupt;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = entry.score.saturating_mul(1_000);
        if deadline_ms > now_ms {
            return self.requeue(&id, entry.score, deadline_ms.saturating_sub(now_ms)).await;
        }

        let context = match self.store.get(&context_key(namespace, id.as_str())).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                self.stats.record_missing_context();
                warn!(namespace = %namespace, timer_id = %id, "Timer context missing, dropping timer");
                return PollOutcome::ContextMissing;
            }
            Err(err) => {
                self.stats.record_store_error();
                self.stats.record_missing_context();
                warn!(namespace = %namespace, timer_id = %id, error = %err, "Failed to load timer context, dropping timer");
                return PollOutcome::ContextMissing;
            }
        };

        let Some(timer) = Timer::from_parts(id, context, entry.score) else {
            self.stats.record_corrupt_member();
            warn!(namespace = %namespace, member = %entry.member, score = entry.score, "Skipping timer with unrepresentable deadline");
            return PollOutcome::Corrupt;
        };

        self.deliver(timer).await
    }

    async fn requeue(&self, id: &TimerId, score: i64, remaining_ms: i64) -> PollOutcome {
        let namespace = &self.config.namespace;

        if let Err(err) = self.store.upsert_score(namespace, id.as_str(), score).await {
            self.stats.record_store_error();
            error!(namespace = %namespace, timer_id = %id, error = %err, "Failed to requeue timer that is not yet due; timer lost");
            return PollOutcome::StoreFailed;
        }

        let wait = Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(0));
        self.stats.record_requeued();
        debug!(namespace = %namespace, timer_id = %id, wait_ms = remaining_ms, "Timer not yet due, requeued");
        PollOutcome::Requeued { wait }
    }

    async fn deliver(&self, timer: Timer) -> PollOutcome {
        let namespace = &self.config.namespace;
        let id = timer.id().clone();

        match self.queue.push(timer).await {
            PushOutcome::Delivered => {
                self.stats.record_delivered();
                debug!(namespace = %namespace, timer_id = %id, "Timer delivered");
                PollOutcome::Delivered
            }
            PushOutcome::DroppedOldest(evicted) => {
                self.stats.record_delivered();
                self.stats.record_dropped_overflow();
                error!(namespace = %namespace, timer_id = %id, evicted = %evicted.id(), "Notification queue full, evicted oldest notification");
                PollOutcome::Delivered
            }
            PushOutcome::DroppedNewest | PushOutcome::TimedOut => {
                self.stats.record_dropped_overflow();
                error!(namespace = %namespace, timer_id = %id, "Notification queue full, dropping timer");
                PollOutcome::Dropped
            }
            PushOutcome::Closed => {
                warn!(namespace = %namespace, timer_id = %id, "Notification queue closed, dropping timer");
                PollOutcome::QueueClosed
            }
        }
    }
}
