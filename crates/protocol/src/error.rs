//! Error types for the protocol crate.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
///
/// Both decode variants are recoverable: the gateway answers with an `error`
/// message and keeps the connection open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload was valid JSON with a `type` the protocol does not define.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// The payload could not be decoded into any message variant.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Failed to serialize an outgoing message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Malformed(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
