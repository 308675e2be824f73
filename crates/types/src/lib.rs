//! Foundation types for PBFT consensus.
//!
//! This crate provides the types shared by every other crate in the
//! workspace:
//!
//! - **Primitives**: [`Hash`] (blake3 digests)
//! - **Identifiers**: [`ValidatorId`], [`View`]
//! - **Consensus types**: [`Proposal`], [`Subject`], [`Preprepare`], [`Snapshot`]
//! - **Membership**: [`ValidatorSet`] with quorum arithmetic and proposer selection
//!
//! # Design Philosophy
//!
//! This crate does not depend on any other workspace crate, making it the
//! foundation layer.

mod hash;
mod identifiers;
mod proposal;
mod snapshot;
mod validator;

pub use hash::{Hash, HexError};
pub use identifiers::{ValidatorId, View};
pub use proposal::{Preprepare, Proposal, ProposalHeader, Request, Subject};
pub use snapshot::{Snapshot, StableCheckpoint};
pub use validator::{ProposerPolicy, ValidatorSet, ValidatorSetError};

/// Test utilities.
pub mod test_utils {
    use super::*;

    /// Validators `0..n`.
    pub fn validator_ids(n: u64) -> Vec<ValidatorId> {
        (0..n).map(ValidatorId).collect()
    }

    /// Round-robin validator set of `n` validators.
    pub fn test_validator_set(n: u64) -> ValidatorSet {
        ValidatorSet::new(validator_ids(n), ProposerPolicy::RoundRobin)
            .expect("non-empty set of distinct ids")
    }

    /// A proposal for `sequence` whose payload is derived from `seed`.
    pub fn test_proposal(sequence: u64, seed: u8) -> Proposal {
        let payload = vec![seed; 8];
        Proposal::new(sequence, Hash::ZERO, Hash::from_bytes(&payload), payload)
    }
}
