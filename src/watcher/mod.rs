//! The `watcher` module is the sequenced event source the dispatcher drains.
//!
//! An `EventStore` is a durable log of `Event`s with monotonically
//! increasing sequence numbers plus name-scoped checkpoints. A `Watcher`
//! iterates a store from its last checkpoint and hands every event to an
//! `EventHandler`.

pub mod memory;
pub mod source;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::utils::error::{StoreError, WatcherError};

pub use memory::MemoryEventStore;
pub use source::{EventIterator, RetryStrategy, Watcher, WatcherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq_num: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub object_type: String,
    pub object: serde_json::Value,
}

/// Name-scoped sequence number persistence.
pub trait Checkpointer: Send + Sync {
    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>, StoreError>;

    fn checkpoint(&self, name: &str, seq_num: u64) -> Result<(), StoreError>;
}

pub trait EventStore: Checkpointer {
    /// Appends an event, assigning the next sequence number.
    fn store_event(
        &self,
        operation: Operation,
        object_type: &str,
        object: serde_json::Value,
    ) -> Result<Event, StoreError>;

    /// Up to `limit` events with a sequence number greater than `after`.
    fn get_events(&self, after: u64, limit: usize) -> Result<Vec<Event>, StoreError>;

    fn latest_seq_num(&self) -> Result<u64, StoreError>;

    /// Woken whenever an event is stored.
    fn notifier(&self) -> Arc<Notify>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), WatcherError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatcherState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherStats {
    pub id: String,
    pub state: WatcherState,
    pub last_processed_seq_num: u64,
    pub last_checkpoint: u64,
}

/// What the dispatcher needs from an event source.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn id(&self) -> &str;

    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), WatcherError>;

    /// Begins iteration after the stored checkpoint. Fails with
    /// `AlreadyRunning` if iteration is in progress.
    async fn start(&self) -> Result<(), WatcherError>;

    /// Stops iteration and waits for it to wind down. Idempotent.
    async fn stop(&self);

    fn stats(&self) -> WatcherStats;

    /// The durable checkpoint, 0 when none was stored.
    fn get_checkpoint(&self) -> Result<u64, WatcherError>;

    fn checkpoint(&self, seq_num: u64) -> Result<(), WatcherError>;
}
