//! Timer manager: registration, cancellation, and the poller lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{Result, TimerError};
use crate::poller::Poller;
use crate::queue::{self, Notifications};
use crate::stats::{PollerStats, PollerStatsSnapshot};
use crate::store::{StoreOp, TimerStore, context_key};
use crate::timer::{Timer, TimerId};

/// Persistent manager of delayed notifications for one namespace.
///
/// Timers are written to the store and fired by a background poller, so
/// they survive a restart of the process: a new manager built over the
/// same store and namespace picks up every timer still registered.
///
/// Run at most one manager per namespace at a time.
pub struct TimerManager {
    config: ManagerConfig,
    /// `None` once the manager has been stopped.
    store: RwLock<Option<Arc<dyn TimerStore>>>,
    notifications: Notifications,
    stats: Arc<PollerStats>,
    stop_tx: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    /// Create a manager for namespace `name` and start its poller.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Config`] if the name is empty, the capacity is
    /// zero, or no tokio runtime is running. The queue always buffers at
    /// least one notification; there is no unbuffered hand-off mode.
    pub fn new(name: impl Into<String>, capacity: usize, store: Arc<dyn TimerStore>) -> Result<Self> {
        Self::with_config(ManagerConfig::new(name, capacity), store)
    }

    /// Create a manager from a full configuration and start its poller.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Config`] if the configuration is invalid or no
    /// tokio runtime is running.
    pub fn with_config(config: ManagerConfig, store: Arc<dyn TimerStore>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TimerError::config(format!("no tokio runtime: {err}")))?;

        let (queue, notifications) = queue::channel(config.capacity, config.overflow);
        let stats = Arc::new(PollerStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let poller = Poller::new(Arc::clone(&store), config.clone(), queue, Arc::clone(&stats));
        let handle = runtime.spawn(poller.run(stop_rx));

        info!(
            namespace = %config.namespace,
            capacity = config.capacity,
            overflow = ?config.overflow,
            "Timer manager started"
        );

        Ok(Self {
            config,
            store: RwLock::new(Some(store)),
            notifications,
            stats,
            stop_tx,
            poller: Mutex::new(Some(handle)),
        })
    }

    /// Receiving side of the notification queue.
    ///
    /// Handles may be cloned freely; each notification goes to one receiver.
    #[must_use]
    pub fn notifications(&self) -> Notifications {
        self.notifications.clone()
    }

    /// Register `timer`, replacing any timer with the same id.
    ///
    /// Both the context record and the schedule entry are written in one
    /// batch. The context outlives the deadline by the configured margin.
    ///
    /// Ids are validated when the [`Timer`] is built: any non-empty string
    /// without control characters is accepted, including spaces and
    /// non-ASCII text. Ids containing `\n`, `\r` or other control
    /// characters cannot be registered.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Stopped`] after [`stop`](Self::stop), or
    /// [`TimerError::Registration`] if the store rejects the write.
    pub async fn add_timer(&self, timer: &Timer) -> Result<()> {
        let store = self.store()?;
        let id = timer.id().as_str();
        let ttl = timer.context_ttl(Utc::now(), self.config.context_ttl_margin());

        store
            .batch(vec![
                StoreOp::SetWithExpiry {
                    key: self.context_key(id),
                    value: timer.context().to_string(),
                    ttl,
                },
                StoreOp::UpsertScore {
                    set: self.config.namespace.clone(),
                    member: id.to_string(),
                    score: timer.deadline_secs(),
                },
            ])
            .await
            .map_err(|err| TimerError::registration("add", err))?;

        debug!(
            namespace = %self.config.namespace,
            timer_id = %id,
            deadline = %timer.deadline(),
            ttl_secs = ttl.as_secs(),
            "Timer registered"
        );
        Ok(())
    }

    /// Cancel the timer `id`. Unknown ids are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidTimer`] for a malformed id,
    /// [`TimerError::Stopped`] after [`stop`](Self::stop), or
    /// [`TimerError::Registration`] if the store rejects the write.
    pub async fn del_timer(&self, id: &str) -> Result<()> {
        let id = TimerId::parse(id)?;
        let store = self.store()?;

        store
            .batch(vec![
                StoreOp::RemoveMember {
                    set: self.config.namespace.clone(),
                    member: id.as_str().to_string(),
                },
                StoreOp::DeleteKey {
                    key: self.context_key(id.as_str()),
                },
            ])
            .await
            .map_err(|err| TimerError::registration("delete", err))?;

        debug!(namespace = %self.config.namespace, timer_id = %id, "Timer cancelled");
        Ok(())
    }

    /// Store key holding the context of timer `id` in this namespace.
    #[must_use]
    pub fn context_key(&self, id: &str) -> String {
        context_key(&self.config.namespace, id)
    }

    /// Stop the poller and wait for it to exit.
    ///
    /// The notification queue is closed; buffered notifications can still
    /// be received. Timers left in the store fire once a new manager is
    /// started over it. Calling this more than once is harmless.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let handle = self.lock_poller().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(namespace = %self.config.namespace, error = %err, "Timer poller ended abnormally");
            }
            info!(namespace = %self.config.namespace, "Timer manager stopped");
        }

        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Check if the poller is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.stop_tx.borrow()
            && self
                .lock_poller()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Namespace this manager serves.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current poller counters.
    #[must_use]
    pub fn stats(&self) -> PollerStatsSnapshot {
        self.stats.snapshot()
    }

    fn store(&self) -> Result<Arc<dyn TimerStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TimerError::Stopped)
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
