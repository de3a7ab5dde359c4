//! SurrealDB-backed timer store.
//!
//! Ordered-set members live in the `timer_entry` table and contexts in
//! `timer_context`. SurrealDB has no blocking pop, so `pop_min` polls the
//! head of the set and claims it by deleting the record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tokio::time::Instant;
use tracing::debug;

use super::{ScoredMember, TimerStore};
use crate::error::{StoreResult, from_surrealdb_error};

const ENTRY_TABLE: &str = "timer_entry";
const CONTEXT_TABLE: &str = "timer_context";

/// Default interval between head checks while waiting in `pop_min`.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for the SurrealDB store.
#[derive(Debug, Clone)]
pub struct SurrealStoreConfig {
    /// Connection URL (e.g., "mem://", "rocksdb://data/timers", "ws://localhost:8000")
    pub url: String,
    /// Namespace to use
    pub namespace: String,
    /// Database to use
    pub database: String,
    /// Optional root credentials
    pub credentials: Option<Credentials>,
    /// How often `pop_min` re-checks an empty set
    pub poll_interval: Duration,
}

/// Root credentials for authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl SurrealStoreConfig {
    /// Create an in-memory configuration for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "persistimer".to_string(),
            database: "test".to_string(),
            credentials: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Create a configuration for an embedded RocksDB database at `path`.
    #[must_use]
    pub fn rocksdb(path: &str) -> Self {
        Self {
            url: format!("rocksdb://{path}"),
            database: "timers".to_string(),
            ..Self::in_memory()
        }
    }

    /// Set the connection URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set credentials for authentication.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the head polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for SurrealStoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRow {
    /// Ordered-set name; `set` is a SurrealQL keyword
    bucket: String,
    member: String,
    score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextRow {
    value: String,
    /// Expiry as milliseconds since the epoch
    expires_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: usize,
}

/// Record key of an ordered-set member. The set name is length-prefixed so
/// that distinct `(set, member)` pairs never share a key.
fn entry_key(set: &str, member: &str) -> String {
    format!("{}:{set}:{member}", set.len())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Timer store persisted in SurrealDB.
#[derive(Debug, Clone)]
pub struct SurrealTimerStore {
    db: Arc<Surreal<Any>>,
    config: SurrealStoreConfig,
}

impl SurrealTimerStore {
    /// Connect to the database and make sure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, authentication, or schema setup fails.
    pub async fn connect(config: SurrealStoreConfig) -> StoreResult<Self> {
        let db = Surreal::<Any>::init();

        db.connect(&config.url)
            .await
            .map_err(from_surrealdb_error)?;

        if let Some(creds) = &config.credentials {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(from_surrealdb_error)?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(from_surrealdb_error)?;

        let store = Self {
            db: Arc::new(db),
            config,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Get the store configuration.
    #[must_use]
    pub fn config(&self) -> &SurrealStoreConfig {
        &self.config
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        let schema = r"
            DEFINE TABLE IF NOT EXISTS timer_entry SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS timer_entry_set_score ON timer_entry FIELDS bucket, score;
            DEFINE TABLE IF NOT EXISTS timer_context SCHEMALESS;
        ";

        self.db.query(schema).await.map_err(from_surrealdb_error)?;

        Ok(())
    }

    /// Number of stored context rows, counting expired ones not yet purged.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub async fn context_len(&self) -> StoreResult<usize> {
        let rows: Vec<CountRow> = self
            .db
            .query("SELECT count() AS count FROM timer_context GROUP ALL")
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(rows.first().map_or(0, |row| row.count))
    }

    async fn purge_expired_contexts(&self, now: i64) -> StoreResult<()> {
        self.db
            .query("DELETE timer_context WHERE expires_at_ms <= $now")
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    /// Delete `key` only while it is still expired, so a concurrent rewrite
    /// survives.
    async fn delete_if_expired(&self, key: &str, now: i64) -> StoreResult<()> {
        self.db
            .query("DELETE type::thing('timer_context', $key) WHERE expires_at_ms <= $now")
            .bind(("key", key.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    /// Remove the current head of `set`, if any.
    async fn claim_head(&self, set: &str) -> StoreResult<Option<ScoredMember>> {
        loop {
            let heads: Vec<EntryRow> = self
                .db
                .query(
                    "SELECT bucket, member, score FROM timer_entry WHERE bucket = $bucket ORDER BY score ASC LIMIT 1",
                )
                .bind(("bucket", set.to_string()))
                .await
                .map_err(from_surrealdb_error)?
                .take(0)
                .map_err(from_surrealdb_error)?;

            let Some(head) = heads.into_iter().next() else {
                return Ok(None);
            };

            let claimed: Option<EntryRow> = self
                .db
                .delete((ENTRY_TABLE, entry_key(set, &head.member)))
                .await
                .map_err(from_surrealdb_error)?;

            match claimed {
                Some(row) => {
                    return Ok(Some(ScoredMember {
                        member: row.member,
                        score: row.score,
                    }));
                }
                None => debug!(set, member = %head.member, "Head claimed concurrently, retrying"),
            }
        }
    }
}

#[async_trait]
impl TimerStore for SurrealTimerStore {
    async fn pop_min(&self, set: &str, timeout: Duration) -> StoreResult<Option<ScoredMember>> {
        // `None` when the timeout overflows the clock: wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if let Some(head) = self.claim_head(set).await? {
                return Ok(Some(head));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    self.config.poll_interval.min(left)
                }
                None => self.config.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn upsert_score(&self, set: &str, member: &str, score: i64) -> StoreResult<()> {
        let _: Option<EntryRow> = self
            .db
            .upsert((ENTRY_TABLE, entry_key(set, member)))
            .content(EntryRow {
                bucket: set.to_string(),
                member: member.to_string(),
                score,
            })
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = now_ms();
        self.purge_expired_contexts(now).await?;

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let _: Option<ContextRow> = self
            .db
            .upsert((CONTEXT_TABLE, key))
            .content(ContextRow {
                value: value.to_string(),
                expires_at_ms: now.saturating_add(ttl_ms),
            })
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row: Option<ContextRow> = self
            .db
            .select((CONTEXT_TABLE, key))
            .await
            .map_err(from_surrealdb_error)?;

        let now = now_ms();
        match row {
            Some(row) if row.expires_at_ms <= now => {
                self.delete_if_expired(key, now).await?;
                Ok(None)
            }
            Some(row) => Ok(Some(row.value)),
            None => Ok(None),
        }
    }

    async fn remove_member(&self, set: &str, member: &str) -> StoreResult<()> {
        let _: Option<EntryRow> = self
            .db
            .delete((ENTRY_TABLE, entry_key(set, member)))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        let _: Option<ContextRow> = self
            .db
            .delete((CONTEXT_TABLE, key))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_in_memory() {
        let config = SurrealStoreConfig::in_memory();
        assert_eq!(config.url, "mem://");
        assert_eq!(config.namespace, "persistimer");
        assert_eq!(config.database, "test");
        assert!(config.credentials.is_none());
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_store_config_rocksdb() {
        let config = SurrealStoreConfig::rocksdb("/var/lib/timers");
        assert_eq!(config.url, "rocksdb:///var/lib/timers");
        assert_eq!(config.database, "timers");
    }

    #[test]
    fn test_store_config_builders() {
        let config = SurrealStoreConfig::default()
            .with_url("ws://localhost:8000")
            .with_namespace("ns")
            .with_database("db")
            .with_credentials("root", "secret")
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.url, "ws://localhost:8000");
        assert_eq!(config.namespace, "ns");
        assert_eq!(config.database, "db");
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert!(config
            .credentials
            .is_some_and(|c| c.username == "root" && c.password == "secret"));
    }

    #[test]
    fn test_entry_keys_do_not_collide() {
        assert_ne!(entry_key("a:b", "c"), entry_key("a", "b:c"));
        assert_eq!(entry_key("ns", "id"), "2:ns:id");
    }

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn test_stale_expiry_delete_spares_rewritten_value() -> TestResult {
        let store = SurrealTimerStore::connect(SurrealStoreConfig::in_memory()).await?;
        store
            .set_with_expiry("k", "fresh", Duration::from_secs(60))
            .await?;

        // A reader that saw an older expired copy deletes with its own clock.
        store.delete_if_expired("k", now_ms()).await?;

        assert_eq!(store.get("k").await?, Some("fresh".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_value_is_deleted_on_read() -> TestResult {
        let store = SurrealTimerStore::connect(SurrealStoreConfig::in_memory()).await?;
        store
            .set_with_expiry("k", "old", Duration::from_millis(50))
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.get("k").await?, None);
        assert_eq!(store.context_len().await?, 0);
        Ok(())
    }
}
