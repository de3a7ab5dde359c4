//! In-process store for tests and single-process embedding.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ScoredMember, StoreOp, TimerStore};
use crate::error::{StoreError, StoreResult};

/// Ordered set indexed both by member and by `(score, member)`.
#[derive(Default)]
struct SortedSet {
    by_member: HashMap<String, i64>,
    by_score: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn upsert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.by_member.insert(member.to_string(), score) {
            self.by_score.remove(&(old, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(score) = self.by_member.remove(member) {
            self.by_score.remove(&(score, member.to_string()));
        }
    }

    fn pop_min(&mut self) -> Option<ScoredMember> {
        let (score, member) = self.by_score.pop_first()?;
        self.by_member.remove(&member);
        Some(ScoredMember { member, score })
    }
}

struct ExpiringValue {
    value: String,
    /// `None` when the TTL overflows the clock.
    expires_at: Option<Instant>,
}

impl ExpiringValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct MemoryState {
    sets: HashMap<String, SortedSet>,
    values: HashMap<String, ExpiringValue>,
    /// Expiry order of `values`, drained on every write.
    expiries: BTreeSet<(Instant, String)>,
}

impl MemoryState {
    /// Apply one write, returning whether an ordered set gained a member.
    fn apply(&mut self, op: StoreOp) -> bool {
        match op {
            StoreOp::UpsertScore { set, member, score } => {
                self.sets.entry(set).or_default().upsert(&member, score);
                true
            }
            StoreOp::SetWithExpiry { key, value, ttl } => {
                let now = Instant::now();
                self.purge_expired(now);
                self.insert_value(key, value, now.checked_add(ttl));
                false
            }
            StoreOp::RemoveMember { set, member } => {
                if let Some(sorted) = self.sets.get_mut(&set) {
                    sorted.remove(&member);
                }
                false
            }
            StoreOp::DeleteKey { key } => {
                self.remove_value(&key);
                false
            }
        }
    }

    fn insert_value(&mut self, key: String, value: String, expires_at: Option<Instant>) {
        self.remove_value(&key);
        if let Some(at) = expires_at {
            self.expiries.insert((at, key.clone()));
        }
        self.values.insert(key, ExpiringValue { value, expires_at });
    }

    fn remove_value(&mut self, key: &str) {
        if let Some(ExpiringValue {
            expires_at: Some(at),
            ..
        }) = self.values.remove(key)
        {
            self.expiries.remove(&(at, key.to_string()));
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        while self.expiries.first().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, key)) = self.expiries.pop_first() {
                self.values.remove(&key);
            }
        }
    }
}

/// Store kept entirely in process memory.
///
/// Batches are atomic. Share one instance through an `Arc` to let a new
/// manager pick up where a stopped one left off.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// Signalled whenever a member is added to any ordered set.
    changed: Notify,
    injected_failures: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in an Arc.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` operations fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Score of `member` in `set`, if present.
    #[must_use]
    pub fn score(&self, set: &str, member: &str) -> Option<i64> {
        self.lock()
            .sets
            .get(set)
            .and_then(|sorted| sorted.by_member.get(member).copied())
    }

    /// Number of members in `set`.
    #[must_use]
    pub fn set_len(&self, set: &str) -> usize {
        self.lock()
            .sets
            .get(set)
            .map_or(0, |sorted| sorted.by_member.len())
    }

    /// Number of stored keys, counting expired ones not yet purged.
    #[must_use]
    pub fn key_len(&self) -> usize {
        self.lock().values.len()
    }

    /// Remaining lifetime of `key`, if it is present and unexpired.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .values
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| {
                entry
                    .expires_at
                    .map_or(Duration::MAX, |at| at.saturating_duration_since(now))
            })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fault(&self) -> StoreResult<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::unavailable("injected failure")),
            Err(_) => Ok(()),
        }
    }

    fn write(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        self.check_fault()?;
        let grew = {
            let mut state = self.lock();
            ops.into_iter()
                .fold(false, |grew, op| state.apply(op) || grew)
        };
        if grew {
            self.changed.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl TimerStore for MemoryStore {
    async fn pop_min(&self, set: &str, timeout: Duration) -> StoreResult<Option<ScoredMember>> {
        self.check_fault()?;
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let head = self.lock().sets.get_mut(set).and_then(SortedSet::pop_min);
            if head.is_some() {
                return Ok(head);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn upsert_score(&self, set: &str, member: &str, score: i64) -> StoreResult<()> {
        self.write(vec![StoreOp::UpsertScore {
            set: set.to_string(),
            member: member.to_string(),
            score,
        }])
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.write(vec![StoreOp::SetWithExpiry {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }])
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_fault()?;
        let now = Instant::now();
        let mut state = self.lock();
        match state.values.get(key) {
            Some(entry) if entry.is_expired(now) => {
                state.remove_value(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn remove_member(&self, set: &str, member: &str) -> StoreResult<()> {
        self.write(vec![StoreOp::RemoveMember {
            set: set.to_string(),
            member: member.to_string(),
        }])
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.write(vec![StoreOp::DeleteKey {
            key: key.to_string(),
        }])
    }

    async fn batch(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        self.write(ops)
    }
}
