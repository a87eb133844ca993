use chrono::{TimeZone, Utc};

use super::message::{KEY_EVENT_TIME, KEY_MESSAGE_TYPE, KEY_SEQ_NUM, Message, Metadata, RawMessage};
use super::payload::Registry;
use super::serializer::{HEADER_LEN, Serializer, VERSION_JSON, decode_frame, encode_frame};
use crate::protocol::messages::{ExecutionUpdate, HeartbeatRequest, Resources};
use crate::utils::error::EnvelopeError;

fn update(id: &str) -> ExecutionUpdate {
    ExecutionUpdate {
        execution_id: id.to_string(),
        job_id: "job-1".to_string(),
        state: "Running".to_string(),
        message: None,
    }
}

#[test]
fn test_metadata_typed_accessors() {
    let mut metadata = Metadata::new();
    metadata.set_u64(KEY_SEQ_NUM, 42);
    assert_eq!(metadata.get_u64(KEY_SEQ_NUM), 42);
    assert_eq!(metadata.get("missing"), "");
    assert_eq!(metadata.get_u64("missing"), 0);

    let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    metadata.set_time(KEY_EVENT_TIME, when);
    assert_eq!(metadata.get_time(KEY_EVENT_TIME), Some(when));
    assert!(metadata.get_time("missing").is_none());
}

#[test]
fn test_message_new_sets_type() {
    let msg = Message::new(update("e1"));
    assert_eq!(msg.metadata.get(KEY_MESSAGE_TYPE), "ExecutionUpdate");
    assert_eq!(msg.message_type(), "ExecutionUpdate");
    assert_eq!(msg.get_payload::<ExecutionUpdate>().unwrap().execution_id, "e1");
    assert!(msg.get_payload::<HeartbeatRequest>().is_none());
}

#[test]
fn test_serialize_preserves_metadata_and_payload() {
    let serializer = Serializer::default();
    let msg = Message::new(update("e1")).with_metadata_value(KEY_SEQ_NUM, "7");

    let bytes = serializer.serialize(&msg).unwrap();
    assert_eq!(bytes[0], VERSION_JSON);

    let decoded = serializer.deserialize(&bytes).unwrap();
    assert_eq!(decoded.seq_num(), 7);
    assert_eq!(decoded.payload, msg.payload);
    assert_eq!(decoded.metadata.get("PayloadEncoding"), "json");
}

#[test]
fn test_body_embeds_payload_as_json_object() {
    let serializer = Serializer::default();
    let bytes = serializer.serialize(&Message::new(update("e1"))).unwrap();

    let body: serde_json::Value = serde_json::from_slice(&bytes[HEADER_LEN..]).unwrap();
    assert_eq!(
        body["payload"],
        serde_json::json!({ "execution_id": "e1", "job_id": "job-1", "state": "Running" })
    );
    let raw: RawMessage = serde_json::from_value(body).unwrap();
    assert_eq!(raw.metadata.get(KEY_MESSAGE_TYPE), "ExecutionUpdate");
}

#[test]
fn test_rejects_short_input() {
    let serializer = Serializer::default();
    let err = serializer.deserialize(&[1, 2, 3, 4]).unwrap_err();
    assert_eq!(err, EnvelopeError::TooShort(4));
    assert!(err.to_string().contains("too short"));
}

#[test]
fn test_rejects_unknown_version() {
    let mut frame = encode_frame(VERSION_JSON, b"{}");
    frame[0] = 9;
    let err = decode_frame(&frame).unwrap_err();
    assert_eq!(err, EnvelopeError::UnsupportedEncoding(9));
    assert!(err.to_string().contains("unsupported encoding"));
}

#[test]
fn test_crc_corruption_only_affects_that_message() {
    let serializer = Serializer::default();
    let good = serializer.serialize(&Message::new(update("a"))).unwrap();
    let mut bad = serializer.serialize(&Message::new(update("b"))).unwrap();
    bad[2] ^= 0xff;

    let err = serializer.deserialize(&bad).unwrap_err();
    assert!(matches!(err, EnvelopeError::CrcMismatch { .. }));
    assert!(err.to_string().contains("CRC check failed"));

    let ok = serializer.deserialize(&good).unwrap();
    assert_eq!(ok.get_payload::<ExecutionUpdate>().unwrap().execution_id, "a");
}

#[test]
fn test_body_corruption_detected_by_crc() {
    let serializer = Serializer::default();
    let mut frame = serializer.serialize(&Message::new(update("a"))).unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    assert!(matches!(
        serializer.deserialize(&frame),
        Err(EnvelopeError::CrcMismatch { .. })
    ));
}

#[test]
fn test_unregistered_type_is_unsupported() {
    let mut registry = Registry::new();
    registry.register::<HeartbeatRequest>().unwrap();
    let serializer = Serializer::new(std::sync::Arc::new(registry));

    let heartbeat = HeartbeatRequest {
        node_id: "n1".into(),
        available_capacity: Resources::default(),
        queue_used_capacity: Resources::default(),
        last_orchestrator_seq_num: 3,
    };
    let bytes = serializer.serialize(&Message::new(heartbeat.clone())).unwrap();
    let decoded = serializer.deserialize(&bytes).unwrap();
    assert_eq!(decoded.get_payload::<HeartbeatRequest>(), Some(&heartbeat));

    let bytes = serializer.serialize(&Message::new(update("x"))).unwrap();
    let err = serializer.deserialize(&bytes).unwrap_err();
    assert_eq!(err, EnvelopeError::UnsupportedType("ExecutionUpdate".into()));
}

#[test]
fn test_register_rejects_duplicates() {
    let mut registry = Registry::new();
    registry.register::<ExecutionUpdate>().unwrap();
    assert!(matches!(
        registry.register::<ExecutionUpdate>(),
        Err(EnvelopeError::AlreadyRegistered(_))
    ));
    assert!(Registry::with_all().is_registered("HandshakeResponse"));
}
