//! Envelope framing.
//!
//! Wire layout: `[1 byte version][4 bytes big-endian CRC-32/IEEE][body]`.
//! Version 1 bodies are JSON `RawMessage`s.

use std::sync::Arc;

use super::message::{KEY_MESSAGE_TYPE, KEY_PAYLOAD_ENCODING, Message, RawMessage};
use super::payload::Registry;
use crate::utils::error::EnvelopeError;

pub const VERSION_JSON: u8 = 1;
pub const HEADER_LEN: usize = 5;
pub const PAYLOAD_ENCODING_JSON: &str = "json";

pub fn encode_frame(version: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(version);
    out.extend_from_slice(&crc32fast::hash(body).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Splits a frame into version and body after validating the header.
pub fn decode_frame(data: &[u8]) -> Result<(u8, &[u8]), EnvelopeError> {
    if data.len() < HEADER_LEN {
        return Err(EnvelopeError::TooShort(data.len()));
    }
    let version = data[0];
    if version != VERSION_JSON {
        return Err(EnvelopeError::UnsupportedEncoding(version));
    }
    let expected = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let body = &data[HEADER_LEN..];
    let got = crc32fast::hash(body);
    if expected != got {
        return Err(EnvelopeError::CrcMismatch { expected, got });
    }
    Ok((version, body))
}

/// Converts `Message`s to framed bytes and back.
#[derive(Debug, Clone)]
pub struct Serializer {
    registry: Arc<Registry>,
}

impl Serializer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn serialize(&self, message: &Message) -> Result<Vec<u8>, EnvelopeError> {
        let mut metadata = message.metadata.clone();
        metadata.set(KEY_MESSAGE_TYPE, message.payload.type_name());
        metadata.set(KEY_PAYLOAD_ENCODING, PAYLOAD_ENCODING_JSON);
        let raw = RawMessage {
            metadata,
            payload: message.payload.to_value()?,
        };
        let body = serde_json::to_vec(&raw)?;
        Ok(encode_frame(VERSION_JSON, &body))
    }

    pub fn deserialize(&self, data: &[u8]) -> Result<Message, EnvelopeError> {
        let (_, body) = decode_frame(data)?;
        let raw: RawMessage = serde_json::from_slice(body)?;
        let type_name = raw.metadata.get(KEY_MESSAGE_TYPE);
        if type_name.is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        let payload = self.registry.decode(type_name, raw.payload)?;
        Ok(Message {
            metadata: raw.metadata,
            payload,
        })
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(Arc::new(Registry::with_all()))
    }
}
