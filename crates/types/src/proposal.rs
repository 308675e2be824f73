//! Proposals and the subjects that votes attest to.

use crate::{Hash, View};
use serde::{Deserialize, Serialize};

/// A client request waiting to be proposed.
///
/// A request is identified by its payload. Clients that need to submit the
/// same operation twice must make the payloads differ (a nonce, a client
/// sequence number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

impl Request {
    /// Create a new request.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Consensus metadata of a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalHeader {
    /// Sequence this proposal is for.
    pub sequence: u64,
    /// Digest of the previously committed proposal, [`Hash::ZERO`] for the first.
    pub parent_hash: Hash,
    /// Hash of the payload.
    pub data_hash: Hash,
}

/// The value being agreed upon for one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Consensus metadata.
    pub header: ProposalHeader,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

impl Proposal {
    /// Create a proposal. `data_hash` must be the payload hash.
    pub fn new(sequence: u64, parent_hash: Hash, data_hash: Hash, payload: Vec<u8>) -> Self {
        Self {
            header: ProposalHeader {
                sequence,
                parent_hash,
                data_hash,
            },
            payload,
        }
    }

    /// Content digest identifying this proposal.
    ///
    /// Covers the header only; the payload is bound through `data_hash`.
    pub fn hash(&self) -> Hash {
        Hash::from_parts(&[
            &self.header.sequence.to_le_bytes(),
            self.header.parent_hash.as_bytes(),
            self.header.data_hash.as_bytes(),
        ])
    }

    /// Sequence this proposal is for.
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }
}

/// The unit prepare and commit votes attest to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// View of the vote.
    pub view: View,
    /// Digest of the proposal voted for.
    pub digest: Hash,
}

impl Subject {
    /// Create a new subject.
    pub const fn new(view: View, digest: Hash) -> Self {
        Self { view, digest }
    }
}

/// A proposal bound to the view it was proposed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprepare {
    /// View the proposal was made in.
    pub view: View,
    /// The proposal.
    pub proposal: Proposal,
}

impl Preprepare {
    /// Create a new preprepare.
    pub fn new(view: View, proposal: Proposal) -> Self {
        Self { view, proposal }
    }

    /// Subject votes for this preprepare must carry.
    pub fn subject(&self) -> Subject {
        Subject::new(self.view, self.proposal.hash())
    }
}
