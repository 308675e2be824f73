//! Checkpoint message body.

use pbft_types::{Hash, View};
use serde::{Deserialize, Serialize};

/// Announces that the sender built a checkpoint covering everything up to
/// and including `view.sequence`. 2F+1 matching votes make it stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointVote {
    /// View of the last committed proposal covered.
    pub view: View,
    /// Digest of that proposal.
    pub digest: Hash,
}

impl CheckpointVote {
    /// Create a new checkpoint vote.
    pub fn new(view: View, digest: Hash) -> Self {
        Self { view, digest }
    }
}
