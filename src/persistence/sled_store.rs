use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use sled::{Db, Tree};
use tokio::sync::Notify;
use tracing::debug;

use crate::utils::error::StoreError;
use crate::watcher::{Checkpointer, Event, EventStore, Operation};

const EVENTS_TREE: &str = "events";
const CHECKPOINTS_TREE: &str = "checkpoints";

/// Event store backed by `sled`.
///
/// Events are keyed by their big-endian sequence number so tree order is
/// sequence order. Checkpoints live in a separate tree keyed by name.
#[derive(Clone)]
pub struct SledEventStore {
    db: Db,
    events: Tree,
    checkpoints: Tree,
    append: Arc<Mutex<()>>,
    notify: Arc<Notify>,
}

impl SledEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// A store that lives only as long as the process.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, StoreError> {
        let events = db.open_tree(EVENTS_TREE)?;
        let checkpoints = db.open_tree(CHECKPOINTS_TREE)?;
        Ok(Self {
            db,
            events,
            checkpoints,
            append: Arc::new(Mutex::new(())),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn decode_seq(bytes: &[u8]) -> Result<u64, StoreError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StoreError::Codec(format!("bad sequence key length {}", bytes.len())))?;
        Ok(u64::from_be_bytes(raw))
    }
}

impl Checkpointer for SledEventStore {
    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>, StoreError> {
        self.checkpoints
            .get(name)?
            .map(|value| Self::decode_seq(&value))
            .transpose()
    }

    fn checkpoint(&self, name: &str, seq_num: u64) -> Result<(), StoreError> {
        self.checkpoints.insert(name, &seq_num.to_be_bytes()[..])?;
        debug!(name, seq_num, "checkpoint stored");
        Ok(())
    }
}

impl EventStore for SledEventStore {
    fn store_event(
        &self,
        operation: Operation,
        object_type: &str,
        object: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let event = {
            let _guard = self.append.lock();
            let seq_num = self.latest_seq_num()? + 1;
            let event = Event {
                seq_num,
                timestamp: Utc::now(),
                operation,
                object_type: object_type.to_string(),
                object,
            };
            let serialized = serde_json::to_vec(&event)?;
            self.events.insert(seq_num.to_be_bytes(), serialized)?;
            event
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    fn get_events(&self, after: u64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        self.events
            .range(start.to_be_bytes()..)
            .take(limit)
            .map(|entry| -> Result<Event, StoreError> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn latest_seq_num(&self) -> Result<u64, StoreError> {
        match self.events.last()? {
            Some((key, _)) => Self::decode_seq(&key),
            None => Ok(0),
        }
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl std::fmt::Debug for SledEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledEventStore")
            .field("db", &"sled::Db")
            .field("events", &self.events.len())
            .finish()
    }
}
