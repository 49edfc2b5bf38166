//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding or encoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame is not a JSON object
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The frame has no `type` field
    #[error("Frame has no message type")]
    MissingKind,

    /// The `type` field names a kind this protocol does not define
    #[error("Unknown message type: {0}")]
    UnknownKind(String),

    /// The kind is known but its fields do not match
    #[error("Invalid fields for {kind}: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// Frame exceeds maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}
