use serde::{Deserialize, Serialize};

/// Frames a websocket client sends to the broker server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "subscribe")]
    Subscribe { sid: u64, subject: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { sid: u64 },

    #[serde(rename = "publish")]
    Publish {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        data: Vec<u8>,
    },
}

/// Frames the broker server pushes to a websocket client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "message")]
    Message {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        data: Vec<u8>,
        #[serde(default)]
        no_responders: bool,
    },

    #[serde(rename = "error")]
    Error { message: String },
}
