//! The `broker` module is the in-process publish/subscribe substrate.
//!
//! It routes `Packet`s between registered clients by subject pattern and
//! signals "no responders" for requests nobody is listening to.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::{Broker, SharedBroker};
pub use message::{Delivery, Packet};
pub use topic::{SubjectPattern, validate_subject};
