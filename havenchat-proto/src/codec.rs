//! Serialization and deserialization for the `HavenChat` wire protocol.
//!
//! Frames travel as JSON text over WebSocket, one object per text frame, so
//! no extra framing layer is needed. Encoding is generic over both frame
//! directions; decoding is direction-specific so each side only accepts the
//! frames it expects.

use serde::Serialize;

use crate::frame::{ClientFrame, ServerFrame};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The text is not a frame this side accepts.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Encodes a frame into its JSON text form.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame sent by a client, as the gateway reads it.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the text is not valid JSON or not a
/// known client frame.
pub fn decode_client(text: &str) -> Result<ClientFrame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decodes a frame pushed by the gateway, as the client reads it.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the text is not valid JSON or not a
/// known server frame.
pub fn decode_server(text: &str) -> Result<ServerFrame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}
