use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::{Checkpointer, Event, EventStore, Operation};
use crate::utils::error::StoreError;

/// Event store kept in memory. Sequence numbers start at 1.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<Event>>,
    checkpoints: RwLock<HashMap<String, u64>>,
    notify: Arc<Notify>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl Checkpointer for MemoryEventStore {
    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.checkpoints.read().get(name).copied())
    }

    fn checkpoint(&self, name: &str, seq_num: u64) -> Result<(), StoreError> {
        self.checkpoints.write().insert(name.to_string(), seq_num);
        Ok(())
    }
}

impl EventStore for MemoryEventStore {
    fn store_event(
        &self,
        operation: Operation,
        object_type: &str,
        object: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let event = {
            let mut events = self.events.write();
            let seq_num = events.last().map_or(1, |e| e.seq_num + 1);
            let event = Event {
                seq_num,
                timestamp: Utc::now(),
                operation,
                object_type: object_type.to_string(),
                object,
            };
            events.push(event.clone());
            event
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    fn get_events(&self, after: u64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read();
        let start = events.partition_point(|e| e.seq_num <= after);
        Ok(events[start..].iter().take(limit).cloned().collect())
    }

    fn latest_seq_num(&self) -> Result<u64, StoreError> {
        Ok(self.events.read().last().map_or(0, |e| e.seq_num))
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
