//! The signed consensus message envelope.

use crate::codec::{self, CodecError};
use pbft_types::ValidatorId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Kind of consensus message. Determines the type of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageCode {
    /// Body: `Preprepare`.
    PrePrepare,
    /// Body: `Subject`.
    Prepare,
    /// Body: `Subject`.
    Commit,
    /// Body: `ViewChangeVote`.
    ViewChange,
    /// Body: `CheckpointVote`.
    Checkpoint,
}

impl MessageCode {
    /// Stable numeric code, included in the signed bytes.
    pub fn as_u8(self) -> u8 {
        match self {
            MessageCode::PrePrepare => 0,
            MessageCode::Prepare => 1,
            MessageCode::Commit => 2,
            MessageCode::ViewChange => 3,
            MessageCode::Checkpoint => 4,
        }
    }

    /// Get a human-readable name for this message code.
    pub fn type_name(self) -> &'static str {
        match self {
            MessageCode::PrePrepare => "PrePrepare",
            MessageCode::Prepare => "Prepare",
            MessageCode::Commit => "Commit",
            MessageCode::ViewChange => "ViewChange",
            MessageCode::Checkpoint => "Checkpoint",
        }
    }

    /// Prepare or commit.
    pub fn is_vote(self) -> bool {
        matches!(self, MessageCode::Prepare | MessageCode::Commit)
    }
}

/// A consensus message as sent between validators.
///
/// Immutable once signed. The signature covers [`Message::signing_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Kind of message.
    pub code: MessageCode,
    /// Validator that created and signed the message.
    pub sender: ValidatorId,
    /// Encoded typed body.
    pub payload: Vec<u8>,
    /// Sender's signature over `signing_bytes()`.
    pub signature: Vec<u8>,
}

impl Message {
    /// Encode a typed body into an unsigned message.
    pub fn encode<T: Serialize>(
        code: MessageCode,
        body: &T,
        sender: ValidatorId,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            code,
            sender,
            payload: codec::encode_body(body)?,
            signature: Vec::new(),
        })
    }

    /// Decode the typed body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::decode_body(&self.payload)
    }

    /// Attach a signature.
    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Bytes covered by the signature: `code || sender || payload`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(9 + self.payload.len());
        bytes.push(self.code.as_u8());
        bytes.extend_from_slice(&self.sender.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Serialize to a transport payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        Ok(codec::frame(codec::encode_body(self)?))
    }

    /// Parse a transport payload.
    pub fn from_payload(data: &[u8]) -> Result<Self, CodecError> {
        codec::decode_body(codec::unframe(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::{Hash, Subject, View};

    fn prepare() -> Message {
        let subject = Subject::new(View::new(0, 1), Hash::from_bytes(b"p"));
        Message::encode(MessageCode::Prepare, &subject, ValidatorId(2)).unwrap()
    }

    #[test]
    fn test_payload_preserves_code_and_body() {
        let message = prepare().with_signature(vec![7; 32]);
        let decoded = Message::from_payload(&message.to_payload().unwrap()).unwrap();

        assert_eq!(decoded, message);
        let subject: Subject = decoded.decode().unwrap();
        assert_eq!(subject.view, View::new(0, 1));
    }

    #[test]
    fn test_truncated_body_fails_to_decode() {
        let mut message = prepare();
        message.payload.truncate(4);
        assert!(matches!(
            message.decode::<Subject>(),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_signing_bytes_cover_code_and_sender() {
        let message = prepare();
        let mut other = message.clone();
        other.code = MessageCode::Commit;
        assert_ne!(message.signing_bytes(), other.signing_bytes());

        let mut other = message.clone();
        other.sender = ValidatorId(3);
        assert_ne!(message.signing_bytes(), other.signing_bytes());

        let signed = message.clone().with_signature(vec![1]);
        assert_eq!(message.signing_bytes(), signed.signing_bytes());
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(Message::from_payload(&[crate::WIRE_VERSION, 0xff]).is_err());
    }
}
