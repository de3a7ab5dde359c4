//! Persistent, crash-tolerant delayed notifications.
//!
//! A [`TimerManager`] registers one-shot timers in an external store and
//! fires each one, at or after its deadline, onto a bounded notification
//! queue. Key features:
//!
//! - **Durability**: timers live in the store, so they survive restarts
//! - **Replacement**: re-adding an id replaces its deadline and context
//! - **Cancellation**: deleting a timer before it fires suppresses it
//! - **Backpressure**: a configurable overflow policy for full queues
//!
//! Deadlines have whole-second resolution and are never delivered early.
//! Delivery is at most once: a notification lost to overflow or a crash is
//! not retried.
//!
//! # Example
//!
//! ```ignore
//! use persistimer::{MemoryStore, Timer, TimerManager};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> persistimer::Result<()> {
//!     let manager = TimerManager::new("orders", 128, MemoryStore::new_arc())?;
//!     let notifications = manager.notifications();
//!
//!     let timer = Timer::after("order-42", "expire", Duration::from_secs(3))?;
//!     manager.add_timer(&timer).await?;
//!
//!     if let Some(fired) = notifications.recv().await {
//!         println!("{} fired with {}", fired.id(), fired.context());
//!     }
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod manager;
mod poller;
pub mod queue;
pub mod stats;
pub mod store;
pub mod timer;

// Re-export main types
pub use config::ManagerConfig;
pub use error::{Result, StoreError, StoreResult, TimerError};
pub use manager::TimerManager;
pub use queue::{NotificationQueue, Notifications, OverflowPolicy, PushOutcome};
pub use stats::{PollerStats, PollerStatsSnapshot};
pub use store::{
    Credentials, MemoryStore, ScoredMember, StoreOp, SurrealStoreConfig, SurrealTimerStore,
    TimerStore,
};
pub use timer::{Timer, TimerId};
