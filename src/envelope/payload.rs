use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::messages::{
    ErrorResponse, ExecutionUpdate, HandshakeRequest, HandshakeResponse, HeartbeatRequest,
    HeartbeatResponse, ShutdownNoticeRequest, ShutdownNoticeResponse, UpdateNodeInfoRequest,
    UpdateNodeInfoResponse,
};
use crate::utils::error::EnvelopeError;

/// A concrete payload type with a stable wire tag.
pub trait PayloadType: Serialize + DeserializeOwned + Sized {
    const TYPE: &'static str;

    fn into_payload(self) -> Payload;

    fn from_payload(payload: &Payload) -> Option<&Self>;
}

/// Decodes the embedded payload of one registered type.
pub type Decoder = fn(Value) -> Result<Payload, EnvelopeError>;

pub fn decode_as<T: PayloadType>(value: Value) -> Result<Payload, EnvelopeError> {
    Ok(serde_json::from_value::<T>(value)?.into_payload())
}

macro_rules! payloads {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Every payload the transport knows how to carry.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Payload {
            $($variant($variant)),+
        }

        impl Payload {
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Payload::$variant(_) => $tag),+
                }
            }

            pub fn to_value(&self) -> Result<Value, EnvelopeError> {
                match self {
                    $(Payload::$variant(p) => Ok(serde_json::to_value(p)?)),+
                }
            }
        }

        $(
            impl PayloadType for $variant {
                const TYPE: &'static str = $tag;

                fn into_payload(self) -> Payload {
                    Payload::$variant(self)
                }

                fn from_payload(payload: &Payload) -> Option<&Self> {
                    match payload {
                        Payload::$variant(p) => Some(p),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )+

        impl Registry {
            /// A registry that knows every payload type.
            pub fn with_all() -> Self {
                let mut registry = Self::new();
                $(registry.decoders.insert($tag.to_string(), decode_as::<$variant> as Decoder);)+
                registry
            }
        }
    };
}

payloads! {
    HandshakeRequest => "HandshakeRequest",
    HandshakeResponse => "HandshakeResponse",
    HeartbeatRequest => "HeartbeatRequest",
    HeartbeatResponse => "HeartbeatResponse",
    UpdateNodeInfoRequest => "UpdateNodeInfoRequest",
    UpdateNodeInfoResponse => "UpdateNodeInfoResponse",
    ShutdownNoticeRequest => "ShutdownNoticeRequest",
    ShutdownNoticeResponse => "ShutdownNoticeResponse",
    ExecutionUpdate => "ExecutionUpdate",
    ErrorResponse => "ErrorResponse",
}

/// Maps a type tag to the decoder for that payload.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    decoders: HashMap<String, Decoder>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: PayloadType>(&mut self) -> Result<(), EnvelopeError> {
        if self.decoders.contains_key(T::TYPE) {
            return Err(EnvelopeError::AlreadyRegistered(T::TYPE.to_string()));
        }
        self.decoders.insert(T::TYPE.to_string(), decode_as::<T>);
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn decode(&self, type_name: &str, value: Value) -> Result<Payload, EnvelopeError> {
        let decoder = self
            .decoders
            .get(type_name)
            .ok_or_else(|| EnvelopeError::UnsupportedType(type_name.to_string()))?;
        decoder(value)
    }
}
