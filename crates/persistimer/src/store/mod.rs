//! Store collaborator: an ordered set with blocking pop-min plus an
//! expiring key/value map.
//!
//! The manager keeps two records per live timer:
//!
//! - an ordered-set member `(namespace, id)` scored by the deadline in epoch seconds
//! - a key/value entry `namespace_id -> context` expiring after the deadline
//!
//! Removal operations must be no-ops when the target does not exist.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

mod memory;
mod surreal;

pub use memory::MemoryStore;
pub use surreal::{Credentials, SurrealStoreConfig, SurrealTimerStore};

/// Key of the context record of timer `id` in `namespace`.
#[must_use]
pub fn context_key(namespace: &str, id: &str) -> String {
    format!("{namespace}_{id}")
}

/// A member removed from an ordered set together with its score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    /// Member name (the timer id)
    pub member: String,
    /// Score (the deadline in seconds since the epoch)
    pub score: i64,
}

/// A write that can be grouped into a [`TimerStore::batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert a member or replace its score.
    UpsertScore {
        set: String,
        member: String,
        score: i64,
    },
    /// Set a key that expires after `ttl`.
    SetWithExpiry {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Remove a member from an ordered set.
    RemoveMember { set: String, member: String },
    /// Delete a key.
    DeleteKey { key: String },
}

/// Trait for timer storage backends.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Remove and return the lowest-scored member of `set`, waiting up to
    /// `timeout` for one to appear. `Ok(None)` means the wait elapsed.
    async fn pop_min(&self, set: &str, timeout: Duration) -> StoreResult<Option<ScoredMember>>;

    /// Insert `member` into `set` or replace its score.
    async fn upsert_score(&self, set: &str, member: &str, score: i64) -> StoreResult<()>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Read `key`. Missing and expired keys yield `Ok(None)`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove `member` from `set`.
    async fn remove_member(&self, set: &str, member: &str) -> StoreResult<()>;

    /// Delete `key`.
    async fn delete_key(&self, key: &str) -> StoreResult<()>;

    /// Apply a single batched write.
    async fn apply(&self, op: StoreOp) -> StoreResult<()> {
        match op {
            StoreOp::UpsertScore { set, member, score } => {
                self.upsert_score(&set, &member, score).await
            }
            StoreOp::SetWithExpiry { key, value, ttl } => {
                self.set_with_expiry(&key, &value, ttl).await
            }
            StoreOp::RemoveMember { set, member } => self.remove_member(&set, &member).await,
            StoreOp::DeleteKey { key } => self.delete_key(&key).await,
        }
    }

    /// Apply writes in order as one best-effort unit.
    ///
    /// The first failure aborts the remaining operations and is returned.
    /// Operations applied before the failure are not rolled back unless the
    /// backend overrides this with a transactional implementation.
    async fn batch(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        for op in ops {
            self.apply(op).await?;
        }
        Ok(())
    }
}
