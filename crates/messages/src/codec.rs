//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: bincode-encoded Message]
//! ```
//!
//! - Version is currently `1`
//! - The message's own `payload` field holds the bincode-encoded typed body
//!   (`Subject`, `Preprepare`, `ViewChangeVote`, `CheckpointVote`)
//!
//! The message code travels inside the envelope, so a receiver can decode the
//! typed body without out-of-band routing information.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Encode a typed body.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(body).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a typed body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Prepend the version byte to an encoded envelope.
pub(crate) fn frame(envelope: Vec<u8>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + envelope.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(envelope);
    bytes
}

/// Strip and check the version byte.
pub(crate) fn unframe(data: &[u8]) -> Result<&[u8], CodecError> {
    let (&version, rest) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    Ok(rest)
}
