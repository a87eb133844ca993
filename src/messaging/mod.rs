//! The `messaging` module layers envelope-aware messaging on top of a
//! `Transport`.
//!
//! - `Publisher`: unordered publish and request/reply.
//! - `OrderedPublisher`: in-order asynchronous publish with per-message acks.
//! - `Responder`: request handling by message type.
//! - `Subscriber`: message handling with ack/nack replies.

pub mod future;
pub mod ordered;
pub mod publisher;
pub mod responder;
pub mod result;
pub mod subscriber;

pub use future::PublishFuture;
pub use ordered::{AckMode, OrderedPublisher, OrderedPublisherConfig};
pub use publisher::{PublishRequest, Publisher};
pub use responder::{RequestHandler, Responder};
pub use result::{AckResult, ack_message, parse_result, respond};
pub use subscriber::{MessageHandler, ProcessingNotifier, Subscriber};
