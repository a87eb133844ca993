use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::{Payload, PayloadType};

pub const KEY_MESSAGE_ID: &str = "MessageID";
pub const KEY_MESSAGE_TYPE: &str = "Type";
pub const KEY_SOURCE: &str = "Source";
pub const KEY_EVENT_TIME: &str = "EventTime";
pub const KEY_PAYLOAD_ENCODING: &str = "PayloadEncoding";
pub const KEY_SEQ_NUM: &str = "SeqNum";
pub const KEY_CORRELATION_ID: &str = "CorrelationID";

/// Ordered string to string map carried alongside every payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, or an empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set(key, value.to_string());
    }

    /// Parses `key` as an unsigned integer. Missing or malformed values are 0.
    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key).parse().unwrap_or(0)
    }

    /// Stores a timestamp as integer nanoseconds since the epoch.
    pub fn set_time(&mut self, key: &str, value: DateTime<Utc>) {
        let nanos = value.timestamp_nanos_opt().unwrap_or_default();
        self.set(key, nanos.to_string());
    }

    /// Reads a nanosecond timestamp. Always UTC; `None` when absent or malformed.
    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key)
            .parse::<i64>()
            .ok()
            .map(DateTime::<Utc>::from_timestamp_nanos)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A fully decoded message: metadata plus a typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub metadata: Metadata,
    pub payload: Payload,
}

impl Message {
    pub fn new<T: PayloadType>(payload: T) -> Self {
        Self::from_payload(payload.into_payload())
    }

    pub fn from_payload(payload: Payload) -> Self {
        let mut metadata = Metadata::new();
        metadata.set(KEY_MESSAGE_TYPE, payload.type_name());
        Self { metadata, payload }
    }

    pub fn with_metadata_value(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.set(key, value);
        self
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Borrow the payload as `T` if that is what this message carries.
    pub fn get_payload<T: PayloadType>(&self) -> Option<&T> {
        T::from_payload(&self.payload)
    }

    pub fn seq_num(&self) -> u64 {
        self.metadata.get_u64(KEY_SEQ_NUM)
    }
}

/// A message after envelope handling but before payload decoding. The
/// payload is embedded as a JSON value, not as opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub metadata: Metadata,
    pub payload: serde_json::Value,
}
