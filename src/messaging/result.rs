use serde::{Deserialize, Serialize};

use crate::broker::Packet;
use crate::transport::Transport;
use crate::utils::error::{PublishError, TransportError};

/// Acknowledgment sent back on a message's reply subject.
///
/// An empty `error` is a positive ack; anything else is a nack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl AckResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, err: impl ToString) -> Self {
        self.error = err.to_string();
        self
    }

    pub fn is_ack(&self) -> bool {
        self.error.is_empty()
    }

    pub fn into_result(self) -> Result<AckResult, PublishError> {
        if self.is_ack() {
            Ok(self)
        } else {
            Err(PublishError::Nack(self.error))
        }
    }
}

/// Positive ack when `error` is `None`, nack otherwise.
pub fn ack_message(error: Option<&str>) -> AckResult {
    match error {
        Some(err) => AckResult::new().with_error(err),
        None => AckResult::new(),
    }
}

/// Decodes the reply to a published message.
pub fn parse_result(packet: &Packet) -> Result<AckResult, PublishError> {
    if packet.no_responders {
        return Err(TransportError::NoResponders(packet.subject.clone()).into());
    }
    serde_json::from_slice::<AckResult>(&packet.data)
        .map_err(|e| PublishError::InvalidRequest(format!("failed to parse ack: {e}")))
}

/// Answers `request` with `result` on its reply subject.
pub async fn respond(
    transport: &dyn Transport,
    request: &Packet,
    result: &AckResult,
) -> Result<(), PublishError> {
    let Some(reply) = request.reply.as_deref() else {
        return Err(PublishError::InvalidRequest("no reply subject".into()));
    };
    let data = serde_json::to_vec(result)
        .map_err(|e| PublishError::InvalidRequest(format!("failed to encode ack: {e}")))?;
    transport.publish(Packet::new(reply, data)).await?;
    Ok(())
}
