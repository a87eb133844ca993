//! The `transport` module is the publish/subscribe connection used by the
//! messaging layer.
//!
//! `Transport` is an unordered, at-most-once connection with request/reply.
//! Two implementations exist: `MemoryTransport` talks to an in-process
//! `Broker`, `WsTransport` talks to a broker behind the websocket server.

pub mod memory;
pub mod message;
pub mod websocket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::Packet;
use crate::utils::error::TransportError;

pub use memory::{MemoryTransport, MemoryTransportFactory};
pub use websocket::{WsTransport, WsTransportFactory, serve, start_websocket_server};

/// Stream of packets for one subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Packet>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Packet>,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            closer: Some(Box::new(closer)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next packet, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn publish(&self, packet: Packet) -> Result<(), TransportError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);

    /// A unique subject suitable for replies.
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }

    /// Publishes `data` to `subject` and waits for one reply.
    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Packet, TransportError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox).await?;
        self.publish(Packet::new(subject, data).with_reply(inbox))
            .await?;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(reply)) if reply.no_responders => {
                Err(TransportError::NoResponders(subject.to_string()))
            }
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Opens fresh connections. Workers open a new one on every reconnect.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}
