//! The `compute` module is the worker side of the connection.
//!
//! `ConnectionManager` owns the lifecycle: it connects, handshakes, and runs
//! a `ControlPlane` and a `DataPlane` for as long as the connection is
//! healthy, reconnecting with backoff when it is not.

pub mod config;
pub mod control_plane;
pub mod data_plane;
pub mod health;
pub mod manager;

pub use config::{Collaborators, Config};
pub use control_plane::ControlPlane;
pub use data_plane::{DISPATCHER_WATCHER_ID, DataPlane};
pub use health::HealthTracker;
pub use manager::ConnectionManager;

#[cfg(test)]
mod tests;
