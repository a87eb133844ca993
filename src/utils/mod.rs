//! The `utils` module provides a collection of utility functions and common
//! definitions used across `fleetlink`.
//!
//! It centralizes the error types, logging setup and the exponential backoff
//! policy shared by every retrying loop.

pub mod backoff;
pub mod error;
pub mod logging;

pub use backoff::ExponentialBackoff;
pub use error::{
    EnvelopeError, ProtocolError, PublishError, StoreError, TransportError, WatcherError,
};
