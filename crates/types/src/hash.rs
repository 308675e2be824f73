//! 32-byte content digest.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors parsing a hex-encoded hash.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    /// Input is not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Decoded input is not 32 bytes.
    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero hash. Used as the parent of the first proposal.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap raw digest bytes without hashing them.
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash several byte slices as one contiguous input.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is [`Hash::ZERO`].
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Full lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HexError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
