//! Payload codec for inbound transport frames
//!
//! Transports hand over a raw payload in one of three shapes:
//! ```text
//! Text(String)                      UTF-8 text frame
//! Binary(Bytes)                     binary frame carrying UTF-8 JSON
//! View { buffer, offset, len }      typed view into a shared buffer
//! ```
//!
//! Every shape is decoded to text, then parsed as a JSON object with a
//! string `type` field. Anything else is a [`CodecError`]; callers drop such
//! frames since upstream may emit control frames the client does not know.

use bytes::Bytes;
use std::borrow::Cow;
use thiserror::Error;

use crate::Message;

/// Maximum payload size (10 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Raw inbound payload as delivered by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Text(String),
    Binary(Bytes),
    /// A window of `len` bytes starting at `offset` within `buffer`
    View { buffer: Bytes, offset: usize, len: usize },
}

impl From<String> for RawPayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawPayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for RawPayload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

/// Errors that can occur while decoding a payload
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("View out of bounds: offset {offset} + len {len} exceeds {available} bytes")]
    ViewOutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error("Payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload has no string `type` field")]
    MissingType,
}

/// Decode any payload shape to text
pub fn payload_text(raw: &RawPayload) -> Result<Cow<'_, str>, CodecError> {
    let bytes: &[u8] = match raw {
        RawPayload::Text(text) => {
            if text.len() > MAX_MESSAGE_SIZE {
                return Err(CodecError::MessageTooLarge(text.len()));
            }
            return Ok(Cow::Borrowed(text.as_str()));
        }
        RawPayload::Binary(bytes) => bytes.as_ref(),
        RawPayload::View {
            buffer,
            offset,
            len,
        } => {
            let end = offset
                .checked_add(*len)
                .filter(|end| *end <= buffer.len())
                .ok_or(CodecError::ViewOutOfBounds {
                    offset: *offset,
                    len: *len,
                    available: buffer.len(),
                })?;
            &buffer[*offset..end]
        }
    };

    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(bytes.len()));
    }

    Ok(Cow::Borrowed(std::str::from_utf8(bytes)?))
}

/// Decode a raw payload into a [`Message`]
pub fn decode(raw: &RawPayload) -> Result<Message, CodecError> {
    let text = payload_text(raw)?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    Message::try_from(value)
}

/// Encode a message as a single JSON text frame
pub fn encode(message: &Message) -> Result<String, CodecError> {
    let text = serde_json::to_string(message.body())?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }
    Ok(text)
}
