//! Bounded notification queue between the poller and its consumers.
//!
//! The poller is the only producer. Any number of consumers may share the
//! receiving side; each notification is handed to exactly one of them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::timer::Timer;

/// What the producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the notification being pushed.
    DropNewest,
    /// Evict the oldest buffered notification to make room.
    DropOldest,
    /// Wait up to `wait_ms` for room, then discard the new notification.
    BlockWithTimeout {
        /// Maximum wait for free capacity
        wait_ms: u64,
    },
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::BlockWithTimeout { wait_ms: 3_000 }
    }
}

/// Result of pushing a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The notification was queued.
    Delivered,
    /// The queue was full and the new notification was discarded.
    DroppedNewest,
    /// The new notification was queued by evicting this older one.
    DroppedOldest(Timer),
    /// No room freed up within the bounded wait; the notification was discarded.
    TimedOut,
    /// The queue is closed.
    Closed,
}

impl PushOutcome {
    /// Check if the pushed notification is now queued.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered | Self::DroppedOldest(_))
    }
}

struct QueueState {
    buffer: VecDeque<Timer>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when a notification is queued or the queue closes.
    items: Notify,
    /// Signalled when a slot frees up or the queue closes.
    space: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bounded queue, returning the producer and consumer halves.
///
/// A capacity of zero is treated as one.
#[must_use]
pub fn channel(capacity: usize, policy: OverflowPolicy) -> (NotificationQueue, Notifications) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            buffer: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        capacity,
        items: Notify::new(),
        space: Notify::new(),
    });

    (
        NotificationQueue {
            shared: Arc::clone(&shared),
            policy,
        },
        Notifications { shared },
    )
}

/// Producer half of the notification queue.
pub struct NotificationQueue {
    shared: Arc<Shared>,
    policy: OverflowPolicy,
}

impl NotificationQueue {
    /// Push a notification, applying the overflow policy if the queue is full.
    pub async fn push(&self, timer: Timer) -> PushOutcome {
        match self.policy {
            OverflowPolicy::DropNewest => match self.try_push(timer) {
                Ok(outcome) => outcome,
                Err(_) => PushOutcome::DroppedNewest,
            },
            OverflowPolicy::DropOldest => self.push_evicting(timer),
            OverflowPolicy::BlockWithTimeout { wait_ms } => {
                self.push_with_timeout(timer, Duration::from_millis(wait_ms))
                    .await
            }
        }
    }

    /// Queue the timer if there is room, handing it back otherwise.
    fn try_push(&self, timer: Timer) -> Result<PushOutcome, Timer> {
        let mut state = self.shared.lock();
        if state.closed {
            return Ok(PushOutcome::Closed);
        }
        if state.buffer.len() >= self.shared.capacity {
            return Err(timer);
        }
        state.buffer.push_back(timer);
        drop(state);

        self.shared.items.notify_one();
        Ok(PushOutcome::Delivered)
    }

    fn push_evicting(&self, timer: Timer) -> PushOutcome {
        let mut state = self.shared.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        let evicted = if state.buffer.len() >= self.shared.capacity {
            state.buffer.pop_front()
        } else {
            None
        };
        state.buffer.push_back(timer);
        drop(state);

        self.shared.items.notify_one();
        evicted.map_or(PushOutcome::Delivered, PushOutcome::DroppedOldest)
    }

    async fn push_with_timeout(&self, timer: Timer, wait: Duration) -> PushOutcome {
        // `None` when the wait overflows the clock: block until space frees.
        let deadline = Instant::now().checked_add(wait);
        let mut timer = timer;

        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(timer) {
                Ok(outcome) => return outcome,
                Err(rejected) => timer = rejected,
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return PushOutcome::TimedOut;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Close the queue. Buffered notifications remain receivable; pending
    /// receivers are woken once the buffer is drained.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.items.notify_waiters();
        self.shared.space.notify_waiters();
    }

    /// Check if the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of buffered notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Check if no notification is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered notifications.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The configured overflow policy.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

/// Receive-only handle on fired timers.
///
/// Clones share one queue: every notification goes to exactly one receiver.
#[derive(Clone)]
pub struct Notifications {
    shared: Arc<Shared>,
}

impl Notifications {
    /// Receive the next notification.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Timer> {
        loop {
            let notified = self.shared.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.take() {
                return next;
            }

            notified.await;
        }
    }

    /// Receive a notification if one is buffered.
    #[must_use]
    pub fn try_recv(&self) -> Option<Timer> {
        self.take().flatten()
    }

    /// `Some(Some(timer))` if one was taken, `Some(None)` if closed and
    /// drained, `None` if the caller should wait.
    fn take(&self) -> Option<Option<Timer>> {
        let mut state = self.shared.lock();
        match state.buffer.pop_front() {
            Some(timer) => {
                let more = !state.buffer.is_empty();
                drop(state);

                self.shared.space.notify_one();
                if more {
                    self.shared.items.notify_one();
                }
                Some(Some(timer))
            }
            None if state.closed => Some(None),
            None => None,
        }
    }

    /// Number of buffered notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Check if no notification is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the producer side has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Adapt into a stream that ends when the queue is closed and drained.
    pub fn into_stream(self) -> impl Stream<Item = Timer> + Send + 'static {
        futures::stream::unfold(self, |rx| async move {
            rx.recv().await.map(|timer| (timer, rx))
        })
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn timer(id: &str) -> crate::error::Result<Timer> {
        Timer::after(id, format!("ctx-{id}"), Duration::ZERO)
    }

    fn id_of(timer: Option<Timer>) -> Option<String> {
        timer.map(|t| t.id().to_string())
    }

    #[tokio::test]
    async fn test_push_and_recv_in_order() -> TestResult {
        let (tx, rx) = channel(4, OverflowPolicy::DropNewest);

        assert_eq!(tx.push(timer("a")?).await, PushOutcome::Delivered);
        assert_eq!(tx.push(timer("b")?).await, PushOutcome::Delivered);
        assert_eq!(rx.len(), 2);

        assert_eq!(id_of(rx.recv().await), Some("a".to_string()));
        assert_eq!(id_of(rx.recv().await), Some("b".to_string()));
        assert!(rx.try_recv().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_newest_when_full() -> TestResult {
        let (tx, rx) = channel(1, OverflowPolicy::DropNewest);

        assert_eq!(tx.push(timer("a")?).await, PushOutcome::Delivered);
        assert_eq!(tx.push(timer("b")?).await, PushOutcome::DroppedNewest);

        assert_eq!(id_of(rx.try_recv()), Some("a".to_string()));
        assert!(rx.try_recv().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() -> TestResult {
        let (tx, rx) = channel(2, OverflowPolicy::DropOldest);

        tx.push(timer("a")?).await;
        tx.push(timer("b")?).await;
        let outcome = tx.push(timer("c")?).await;

        assert!(outcome.is_delivered());
        assert!(matches!(outcome, PushOutcome::DroppedOldest(ref old) if old.id().as_str() == "a"));
        assert_eq!(id_of(rx.try_recv()), Some("b".to_string()));
        assert_eq!(id_of(rx.try_recv()), Some("c".to_string()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_with_timeout_gives_up() -> TestResult {
        let (tx, rx) = channel(1, OverflowPolicy::BlockWithTimeout { wait_ms: 3_000 });

        tx.push(timer("a")?).await;
        let started = Instant::now();
        assert_eq!(tx.push(timer("b")?).await, PushOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(3));

        assert_eq!(rx.len(), 1);
        assert_eq!(id_of(rx.try_recv()), Some("a".to_string()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_with_timeout_succeeds_when_space_frees() -> TestResult {
        let (tx, rx) = channel(1, OverflowPolicy::BlockWithTimeout { wait_ms: 3_000 });
        tx.push(timer("a")?).await;

        let consumer = tokio::spawn({
            let rx = rx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                rx.recv().await
            }
        });

        assert_eq!(tx.push(timer("b")?).await, PushOutcome::Delivered);
        assert_eq!(id_of(consumer.await?), Some("a".to_string()));
        assert_eq!(id_of(rx.try_recv()), Some("b".to_string()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_wait_does_not_overflow_clock() -> TestResult {
        let (tx, rx) = channel(1, OverflowPolicy::BlockWithTimeout { wait_ms: u64::MAX });
        tx.push(timer("a")?).await;

        let consumer = tokio::spawn({
            let rx = rx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                rx.recv().await
            }
        });

        assert_eq!(tx.push(timer("b")?).await, PushOutcome::Delivered);
        assert_eq!(id_of(consumer.await?), Some("a".to_string()));
        assert_eq!(id_of(rx.try_recv()), Some("b".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_wakes_receivers_after_drain() -> TestResult {
        let (tx, rx) = channel(2, OverflowPolicy::DropNewest);
        tx.push(timer("a")?).await;

        let waiter = tokio::spawn({
            let rx = rx.clone();
            async move {
                let first = rx.recv().await;
                let second = rx.recv().await;
                (first, second)
            }
        });

        tokio::task::yield_now().await;
        tx.close();

        let (first, second) = waiter.await?;
        assert_eq!(id_of(first), Some("a".to_string()));
        assert!(second.is_none());
        assert!(rx.is_closed());
        assert_eq!(tx.push(timer("late")?).await, PushOutcome::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_each_notification_goes_to_one_consumer() -> TestResult {
        let (tx, rx) = channel(64, OverflowPolicy::DropNewest);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(timer) = rx.recv().await {
                        seen.push(timer.id().to_string());
                    }
                    seen
                })
            })
            .collect();

        for i in 0..50 {
            assert!(tx.push(timer(&format!("t{i}"))?).await.is_delivered());
            tokio::task::yield_now().await;
        }
        tx.close();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await?);
        }
        let received = all.len();
        all.sort();
        all.dedup();
        assert_eq!(received, 50);
        assert_eq!(all.len(), 50);
        Ok(())
    }

    #[tokio::test]
    async fn test_into_stream_ends_on_close() -> TestResult {
        let (tx, rx) = channel(4, OverflowPolicy::DropNewest);
        tx.push(timer("a")?).await;
        tx.push(timer("b")?).await;
        tx.close();

        let ids: Vec<String> = rx
            .into_stream()
            .map(|t| t.id().to_string())
            .collect()
            .await;
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (tx, _rx) = channel(0, OverflowPolicy::DropNewest);
        assert_eq!(tx.capacity(), 1);
    }
}
