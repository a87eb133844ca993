use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::broker::Packet;
use crate::envelope::{
    KEY_CORRELATION_ID, KEY_EVENT_TIME, KEY_MESSAGE_ID, KEY_SOURCE, Message, Serializer,
};
use crate::protocol::messages::ErrorResponse;
use crate::transport::Transport;
use crate::utils::error::PublishError;

/// A message plus an optional subject overriding the publisher's destination.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub message: Message,
    pub subject: Option<String>,
}

impl PublishRequest {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Unordered publisher and request client bound to a destination subject.
#[derive(Debug, Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    name: String,
    destination: String,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializer: Serializer,
        name: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            serializer,
            name: name.into(),
            destination: destination.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Stamps source, id and event time, then frames the message.
    pub fn encode(&self, request: PublishRequest) -> Result<Packet, PublishError> {
        let subject = request
            .subject
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.destination.clone());
        if subject.is_empty() {
            return Err(PublishError::InvalidRequest(
                "no subject or destination".into(),
            ));
        }

        let mut message = request.message;
        if !message.metadata.has(KEY_SOURCE) {
            message.metadata.set(KEY_SOURCE, self.name.as_str());
        }
        if !message.metadata.has(KEY_MESSAGE_ID) {
            message
                .metadata
                .set(KEY_MESSAGE_ID, uuid::Uuid::new_v4().to_string());
        }
        if !message.metadata.has(KEY_EVENT_TIME) {
            message.metadata.set_time(KEY_EVENT_TIME, Utc::now());
        }

        let data = self.serializer.serialize(&message)?;
        Ok(Packet::new(subject, data))
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, request: PublishRequest) -> Result<(), PublishError> {
        let packet = self.encode(request)?;
        self.transport.publish(packet).await?;
        Ok(())
    }

    /// Sends a request and decodes the reply. An `ErrorResponse` reply is
    /// returned as `PublishError::Nack`.
    pub async fn request(
        &self,
        request: PublishRequest,
        timeout: Duration,
    ) -> Result<Message, PublishError> {
        let packet = self.encode(request)?;
        let reply = self
            .transport
            .request(&packet.subject, packet.data, timeout)
            .await?;
        let response = self.serializer.deserialize(&reply.data)?;
        if let Some(err) = response.get_payload::<ErrorResponse>() {
            return Err(PublishError::Nack(err.error.clone()));
        }
        Ok(response)
    }
}

/// Links a reply to the request it answers.
pub fn correlate(reply: Message, request: &Message) -> Message {
    let id = request.metadata.get(KEY_MESSAGE_ID).to_string();
    reply.with_metadata_value(KEY_CORRELATION_ID, id)
}
