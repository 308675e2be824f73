//! Per-sequence phases.

use std::fmt;

/// Phase of the current round.
///
/// `AcceptRequest → Preprepared → Prepared → Committed → AcceptRequest`.
/// `CheckpointReady` is entered from `Committed` when a checkpoint is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    /// Waiting for a proposal.
    #[default]
    AcceptRequest,
    /// A proposal was accepted; collecting prepares.
    Preprepared,
    /// Prepare quorum reached; collecting commits.
    Prepared,
    /// Commit quorum reached.
    Committed,
    /// Committed and a checkpoint build was requested.
    CheckpointReady,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::AcceptRequest => "AcceptRequest",
            State::Preprepared => "Preprepared",
            State::Prepared => "Prepared",
            State::Committed => "Committed",
            State::CheckpointReady => "CheckpointReady",
        };
        f.write_str(name)
    }
}
