//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TimerError};
use crate::queue::OverflowPolicy;

/// Longest accepted poll horizon.
pub const MAX_POLL_HORIZON_SECS: u64 = 3_600;

/// Configuration for a [`TimerManager`](crate::manager::TimerManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Namespace of this manager's timers. Must be unique among all managers
    /// sharing a store.
    pub namespace: String,
    /// Capacity of the notification queue. Must be at least 1; there is no
    /// unbuffered hand-off mode.
    pub capacity: usize,
    /// What to do when the notification queue is full.
    pub overflow: OverflowPolicy,
    /// Upper bound of a single blocking pop, 1..=[`MAX_POLL_HORIZON_SECS`].
    pub poll_horizon_secs: u64,
    /// Sleep after a store failure.
    pub error_backoff_ms: u64,
    /// Extra lifetime of a context record past its deadline.
    pub context_ttl_margin_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: "timers".to_string(),
            capacity: 128,
            overflow: OverflowPolicy::default(),
            poll_horizon_secs: 60,
            error_backoff_ms: 3_000,
            context_ttl_margin_secs: 600, // 10 minutes
        }
    }
}

impl ManagerConfig {
    /// Create a configuration with defaults for everything but the namespace
    /// and queue capacity.
    #[must_use]
    pub fn new(namespace: impl Into<String>, capacity: usize) -> Self {
        Self {
            namespace: namespace.into(),
            capacity,
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Config`] if the document does not parse or the
    /// result fails [`validate`](Self::validate).
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(document).map_err(|e| TimerError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the overflow policy.
    #[must_use]
    pub const fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set the poll horizon.
    #[must_use]
    pub const fn with_poll_horizon_secs(mut self, secs: u64) -> Self {
        self.poll_horizon_secs = secs;
        self
    }

    /// Set the backoff after store errors.
    #[must_use]
    pub const fn with_error_backoff_ms(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    /// Set the context TTL margin.
    #[must_use]
    pub const fn with_context_ttl_margin_secs(mut self, secs: u64) -> Self {
        self.context_ttl_margin_secs = secs;
        self
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(TimerError::config("namespace must not be empty"));
        }
        if self.namespace.chars().any(char::is_control) {
            return Err(TimerError::config(format!(
                "namespace {:?} contains control characters",
                self.namespace
            )));
        }
        if self.capacity == 0 {
            return Err(TimerError::config("notification capacity must be at least 1"));
        }
        if self.poll_horizon_secs == 0 {
            return Err(TimerError::config("poll horizon must be at least one second"));
        }
        if self.poll_horizon_secs > MAX_POLL_HORIZON_SECS {
            return Err(TimerError::config(format!(
                "poll horizon of {}s exceeds the {MAX_POLL_HORIZON_SECS}s limit",
                self.poll_horizon_secs
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn poll_horizon(&self) -> Duration {
        Duration::from_secs(self.poll_horizon_secs)
    }

    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    #[must_use]
    pub const fn context_ttl_margin(&self) -> Duration {
        Duration::from_secs(self.context_ttl_margin_secs)
    }
}
