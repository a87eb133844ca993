use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::publisher::correlate;
use crate::broker::Packet;
use crate::envelope::{Message, Serializer};
use crate::protocol::messages::ErrorResponse;
use crate::transport::{Subscription, Transport};
use crate::utils::error::{ProtocolError, TransportError};

/// Answers one request type.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Message) -> Result<Message, ProtocolError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Message, ProtocolError>> + Send,
{
    async fn handle_request(&self, request: Message) -> Result<Message, ProtocolError> {
        (self)(request).await
    }
}

struct Inner {
    name: String,
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
}

/// Subscribes one (possibly wildcard) subject and routes each request to
/// the handler registered for its message type. Every request is handled
/// on its own task; the reply goes to the request's reply subject.
pub struct Responder {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Responder {
    pub async fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        serializer: Serializer,
        subject: &str,
    ) -> Result<Self, TransportError> {
        let sub = transport.subscribe(subject).await?;
        let inner = Arc::new(Inner {
            name: name.into(),
            transport,
            serializer,
            handlers: RwLock::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen_loop(inner.clone(), sub, cancel.clone()));
        Ok(Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Registers the handler for `message_type`.
    pub fn listen(
        &self,
        message_type: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), ProtocolError> {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(message_type) {
            return Err(ProtocolError::InvalidConfig(format!(
                "handler already registered for message type {message_type}"
            )));
        }
        handlers.insert(message_type.to_string(), handler);
        Ok(())
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen_loop(inner: Arc<Inner>, mut sub: Subscription, cancel: CancellationToken) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = sub.next() => packet,
        };
        let Some(packet) = packet else { break };
        let inner = inner.clone();
        tokio::spawn(async move { inner.handle(packet).await });
    }
    debug!(responder = %inner.name, "responder stopped");
}

impl Inner {
    async fn handle(&self, packet: Packet) {
        let Some(reply) = packet.reply.clone() else {
            debug!(responder = %self.name, subject = %packet.subject, "request without reply subject");
            return;
        };
        let request = match self.serializer.deserialize(&packet.data) {
            Ok(request) => request,
            Err(e) => {
                warn!(responder = %self.name, subject = %packet.subject, error = %e, "dropping undecodable request");
                return;
            }
        };

        let handler = self.handlers.read().get(request.message_type()).cloned();
        let response = match handler {
            Some(handler) => handler.handle_request(request.clone()).await,
            None => Err(ProtocolError::Remote(format!(
                "no handler found for message type: {}",
                request.message_type()
            ))),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(responder = %self.name, error = %e, "request failed");
                Message::new(ErrorResponse::new(e))
            }
        };

        let data = match self.serializer.serialize(&correlate(response, &request)) {
            Ok(data) => data,
            Err(e) => {
                warn!(responder = %self.name, error = %e, "failed to encode response");
                return;
            }
        };
        if let Err(e) = self.transport.publish(Packet::new(reply, data)).await {
            warn!(responder = %self.name, error = %e, "failed to send response");
        }
    }
}
