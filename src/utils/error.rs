//! The `error` module defines the error types used across `fleetlink`.
//!
//! Each layer gets its own enum so callers can match on the failures that
//! are meaningful at that layer:
//!
//! - `EnvelopeError`: framing and payload codec failures. Always fatal to a
//!   single message, never to a connection.
//! - `TransportError`: the pub/sub substrate failed (no responders, timeout,
//!   closed connection).
//! - `PublishError`: a published message did not get a positive
//!   acknowledgment. `Clone` so one failure can resolve many futures.
//! - `WatcherError` / `StoreError`: the sequenced event source.
//! - `ProtocolError`: control-plane level failures between worker and
//!   orchestrator.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("data too short: got {0} bytes, need at least 5")]
    TooShort(usize),
    #[error("unsupported encoding version: {0}")]
    UnsupportedEncoding(u8),
    #[error("CRC check failed: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
    #[error("unsupported message type: {0}")]
    UnsupportedType(String),
    #[error("message type {0} already registered")]
    AlreadyRegistered(String),
    #[error("missing message type in metadata")]
    MissingType,
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        EnvelopeError::Codec(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no responders available for subject {0}")]
    NoResponders(String),
    #[error("request to {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },
    #[error("connection closed")]
    Closed,
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("publisher max pending messages reached ({0})")]
    MaxPendingReached(usize),
    #[error("publisher queue full")]
    QueueFull,
    #[error("publish ack timeout")]
    AckTimeout,
    #[error("publisher reset")]
    Reset,
    #[error("publisher shutdown")]
    Shutdown,
    #[error("publisher closed")]
    Closed,
    #[error("negative acknowledgment: {0}")]
    Nack(String),
    #[error("publish cancelled")]
    Cancelled,
    #[error("invalid publish request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("sequence number {got} must be greater than {latest}")]
    OutOfOrder { latest: u64, got: u64 },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("watcher {0} already running")]
    AlreadyRunning(String),
    #[error("watcher {0} has no handler")]
    NoHandler(String),
    #[error("watcher {0} already has a handler")]
    HandlerExists(String),
    #[error("event handler failed: {0}")]
    Handler(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake rejected by orchestrator: {0}")]
    HandshakeRejected(String),
    #[error("no active data plane for node {0} - handshake required")]
    NoActiveDataPlane(String),
    #[error("handshake required for node {0}")]
    HandshakeRequired(String),
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },
    #[error("unexpected request: expected {expected}, got {got}")]
    UnexpectedRequest { expected: String, got: String },
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("node manager error: {0}")]
    NodeManager(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("{0} already running")]
    AlreadyRunning(String),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProtocolError {
    /// Whether the remote side asked for a fresh handshake.
    pub fn is_handshake_required(&self) -> bool {
        match self {
            ProtocolError::HandshakeRequired(_) | ProtocolError::NoActiveDataPlane(_) => true,
            ProtocolError::Remote(msg) => msg.contains("handshake required"),
            ProtocolError::Publish(PublishError::Nack(msg)) => msg.contains("handshake required"),
            _ => false,
        }
    }
}
