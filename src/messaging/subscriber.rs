use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::result::{ack_message, respond};
use crate::broker::Packet;
use crate::envelope::{Message, Serializer};
use crate::transport::{Subscription, Transport};
use crate::utils::error::{ProtocolError, TransportError};

/// Processes messages delivered to a `Subscriber`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: Message) -> Result<(), ProtocolError>;
}

/// Told about every message a handler processed successfully.
pub trait ProcessingNotifier: Send + Sync {
    fn on_processed(&self, message: &Message);
}

/// Delivers messages from one subject to a handler, one at a time, acking
/// or nacking each one that carries a reply subject.
pub struct Subscriber {
    subject: String,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub async fn subscribe(
        transport: Arc<dyn Transport>,
        serializer: Serializer,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        notifier: Option<Arc<dyn ProcessingNotifier>>,
    ) -> Result<Self, TransportError> {
        let sub = transport.subscribe(subject).await?;
        let cancel = CancellationToken::new();
        let worker = Worker {
            transport,
            serializer,
            handler,
            notifier,
        };
        let task = tokio::spawn(worker.run(sub, cancel.clone()));
        Ok(Self {
            subject: subject.to_string(),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    handler: Arc<dyn MessageHandler>,
    notifier: Option<Arc<dyn ProcessingNotifier>>,
}

impl Worker {
    async fn run(self, mut sub: Subscription, cancel: CancellationToken) {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = sub.next() => packet,
            };
            let Some(packet) = packet else { break };
            self.process(packet).await;
        }
        debug!(subject = sub.subject(), "subscriber stopped");
    }

    async fn process(&self, packet: Packet) {
        let outcome = match self.serializer.deserialize(&packet.data) {
            Ok(message) => {
                let result = self.handler.handle_message(message.clone()).await;
                if result.is_ok() {
                    if let Some(notifier) = &self.notifier {
                        notifier.on_processed(&message);
                    }
                }
                result.map_err(|e| e.to_string())
            }
            Err(e) => {
                warn!(subject = %packet.subject, error = %e, "discarding undecodable message");
                Err(e.to_string())
            }
        };

        if packet.reply.is_none() {
            return;
        }
        let ack = ack_message(outcome.as_ref().err().map(String::as_str));
        if let Err(e) = respond(self.transport.as_ref(), &packet, &ack).await {
            debug!(subject = %packet.subject, error = %e, "failed to ack message");
        }
    }
}
