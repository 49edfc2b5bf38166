//! JSON codec for protocol frames
//!
//! Decoding is done in two steps so that an unknown `type` can be told
//! apart from a known kind with bad fields: callers drop both, but log them
//! differently.

use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::{Message, MessageKind};

/// Maximum accepted size of a single text frame (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }

    /// Encode a message as a JSON text frame
    pub fn encode(&self, message: &Message) -> Result<String, ProtocolError> {
        serde_json::to_string(message).map_err(ProtocolError::Serialization)
    }

    /// Decode a JSON text frame
    pub fn decode(&self, text: &str) -> Result<Message, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingKind)?;

        if MessageKind::from_wire(kind).is_none() {
            return Err(ProtocolError::UnknownKind(kind.to_string()));
        }
        let kind = kind.to_string();

        serde_json::from_value(value)
            .map_err(|source| ProtocolError::InvalidFields { kind, source })
    }
}
