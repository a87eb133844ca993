//! The `persistence` module provides durable storage for the event log.
//!
//! `SledEventStore` implements `EventStore` and `Checkpointer` on top of
//! `sled`, so a worker or orchestrator that restarts resumes dispatching
//! from its last persisted checkpoint instead of from the beginning.

pub mod sled_store;

pub use sled_store::SledEventStore;
