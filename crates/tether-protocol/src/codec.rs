//! JSON codec for envelopes and replies.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::reply::Reply;

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    /// Frame is not JSON.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame is JSON but not an object.
    #[error("Envelope is not a JSON object")]
    NotAnObject,
}

/// Decode an envelope from a text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a JSON object.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    decode_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode an envelope, enforcing a caller-supplied size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a JSON object.
pub fn decode_with_limit(text: &str, limit: usize) -> Result<Envelope, ProtocolError> {
    if text.len() > limit {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    parse(text)
}

/// Decode an envelope from a binary frame holding UTF-8 JSON.
///
/// # Errors
///
/// Returns an error if the frame is too large, not UTF-8 or not JSON.
pub fn decode_bytes(data: &[u8], limit: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > limit {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
    parse(text)
}

fn parse(text: &str) -> Result<Envelope, ProtocolError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(object) => Ok(Envelope::from_object(object)),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Encode a reply to a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(reply: &Reply) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(reply)?)
}
