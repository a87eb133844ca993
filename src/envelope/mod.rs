//! The `envelope` module defines what travels over the wire.
//!
//! A `Message` is string metadata plus a typed `Payload`. The `Serializer`
//! turns it into a versioned, CRC-protected frame and back, using a
//! `Registry` to map the `Type` metadata tag to a payload decoder.

pub mod message;
pub mod payload;
pub mod serializer;

pub use message::{
    KEY_CORRELATION_ID, KEY_EVENT_TIME, KEY_MESSAGE_ID, KEY_MESSAGE_TYPE, KEY_PAYLOAD_ENCODING,
    KEY_SEQ_NUM, KEY_SOURCE, Message, Metadata, RawMessage,
};
pub use payload::{Payload, PayloadType, Registry};
pub use serializer::{Serializer, VERSION_JSON, decode_frame, encode_frame};

#[cfg(test)]
mod tests;
