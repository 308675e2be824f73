//! Frozen records of decided rounds and stable checkpoints.

use crate::{Hash, Proposal, Subject, ValidatorId, View};
use serde::{Deserialize, Serialize};

/// A completed round, frozen at commit time.
///
/// Holds the decided proposal so a failed durable apply can be re-attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// View the proposal was committed in.
    pub view: View,
    /// The committed proposal.
    pub proposal: Proposal,
    /// Validators whose prepare votes were counted, in id order.
    pub prepares: Vec<ValidatorId>,
    /// Validators whose commit votes were counted, in id order.
    pub commits: Vec<ValidatorId>,
}

impl Snapshot {
    /// Digest of the committed proposal.
    pub fn digest(&self) -> Hash {
        self.proposal.hash()
    }

    /// Subject the commit quorum attested to.
    pub fn subject(&self) -> Subject {
        Subject::new(self.view, self.digest())
    }

    /// Committed sequence.
    pub fn sequence(&self) -> u64 {
        self.view.sequence
    }
}

/// A checkpoint that a quorum of validators reported having built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableCheckpoint {
    /// View of the last proposal covered by the checkpoint.
    pub view: View,
    /// Digest of that proposal.
    pub digest: Hash,
    /// Validators that attested, in id order.
    pub signers: Vec<ValidatorId>,
}
