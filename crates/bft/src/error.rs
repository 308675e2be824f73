//! Message rejection reasons.

use pbft_messages::CodecError;
use pbft_types::ValidatorId;
use thiserror::Error;

/// Why a message or request was not applied.
///
/// None of these are fatal: the state machine is left untouched apart from
/// queueing future messages.
#[derive(Debug, Error)]
pub enum BftError {
    /// Behind the current view. Dropped.
    #[error("old message")]
    OldMessage,

    /// Ahead of the current view or phase. Queued in the backlog.
    #[error("future message")]
    FutureMessage,

    /// View matches but the digest or another field does not.
    #[error("inconsistent subject")]
    InconsistentSubject,

    /// Preprepare from a validator that is not the view's proposer.
    #[error("message not from proposer")]
    NotFromProposer,

    /// Sender is not in the validator set.
    #[error("unauthorized address {0}")]
    UnauthorizedAddress(ValidatorId),

    /// Signature does not match the sender.
    #[error("invalid signature from {0}")]
    InvalidSignature(ValidatorId),

    /// Proposal header does not match its view or payload.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// Payload could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

impl BftError {
    /// Short label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            BftError::OldMessage => "old_message",
            BftError::FutureMessage => "future_message",
            BftError::InconsistentSubject => "inconsistent_subject",
            BftError::NotFromProposer => "not_from_proposer",
            BftError::UnauthorizedAddress(_) => "unauthorized_address",
            BftError::InvalidSignature(_) => "invalid_signature",
            BftError::InvalidProposal(_) => "invalid_proposal",
            BftError::Codec(_) => "codec",
        }
    }

    /// Expected during normal operation (message raced a state change).
    pub fn is_benign(&self) -> bool {
        matches!(self, BftError::OldMessage | BftError::FutureMessage)
    }
}
