//! # FleetLink
//!
//! `fleetlink` is a reliable, ordered message transport between compute
//! workers and a central orchestrator, built with Rust on top of a
//! subject-based publish/subscribe broker.
//!
//! Each side drains a sequenced event log through a `Dispatcher` into an
//! `OrderedPublisher`, so messages arrive in sequence order, are
//! acknowledged per message, and are redelivered from the last checkpoint
//! after a failure.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: The in-process pub/sub engine that routes packets to subject subscribers.
//! - `client`: Represents a connection registered with the broker.
//! - `compute`: The worker side: `ConnectionManager`, control plane and data plane.
//! - `config`: Handles loading and managing configuration.
//! - `dispatcher`: Reliable event-to-message delivery with checkpointing and recovery.
//! - `envelope`: Message model and the CRC-checked wire framing.
//! - `messaging`: Ordered and unordered publishers, subscribers and responders.
//! - `orchestrator`: The orchestrator side: `ComputeManager` and node management.
//! - `persistence`: A `sled` backed event store and checkpointer.
//! - `protocol`: Control-plane messages, subjects and shared connection types.
//! - `transport`: In-memory and websocket connections to the broker.
//! - `utils`: Contains shared utilities, such as error handling and logging.
//! - `watcher`: The sequenced event source a dispatcher drains.

pub mod broker;
pub mod client;
pub mod compute;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod messaging;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;
pub mod transport;
pub mod utils;
pub mod watcher;

#[cfg(test)]
mod tests;
