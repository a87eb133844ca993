use serde::{Deserialize, Serialize};

/// A unit routed by the broker.
///
/// - `subject` - Concrete destination subject.
/// - `reply` - Optional subject the receiver should answer on.
/// - `data` - Opaque bytes, usually an envelope frame.
/// - `no_responders` - Set on the status packet the broker sends back when a
///   request matched no subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Packet {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_responders: bool,
}

impl Packet {
    pub fn new(subject: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            data,
            ..Default::default()
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub(crate) fn no_responders(reply: &str) -> Self {
        Self {
            subject: reply.to_string(),
            no_responders: true,
            ..Default::default()
        }
    }
}

/// A packet tagged with the subscription it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sid: u64,
    pub packet: Packet,
}
