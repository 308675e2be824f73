//! In-memory application that records what consensus hands it.

use parking_lot::Mutex;
use pbft_core::{Application, ApplyError};
use pbft_types::{Hash, Proposal, View};

/// Records committed proposals and checkpoint requests in order.
#[derive(Debug, Default)]
pub struct RecordingApplication {
    commits: Mutex<Vec<(View, Proposal)>>,
    checkpoints: Mutex<Vec<(View, Hash)>>,
}

impl RecordingApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed proposals, in commit order.
    pub fn commits(&self) -> Vec<(View, Proposal)> {
        self.commits.lock().clone()
    }

    /// `(sequence, digest)` of every commit.
    pub fn committed_digests(&self) -> Vec<(u64, Hash)> {
        self.commits
            .lock()
            .iter()
            .map(|(view, proposal)| (view.sequence, proposal.hash()))
            .collect()
    }

    /// Checkpoints requested so far.
    pub fn checkpoints(&self) -> Vec<(View, Hash)> {
        self.checkpoints.lock().clone()
    }
}

impl Application for RecordingApplication {
    fn commit(&self, view: View, proposal: &Proposal) -> Result<(), ApplyError> {
        let mut commits = self.commits.lock();
        let expected = commits.last().map_or(1, |(v, _)| v.sequence + 1);
        if view.sequence != expected {
            return Err(ApplyError::Commit {
                sequence: view.sequence,
                reason: format!("expected sequence {expected}"),
            });
        }
        commits.push((view, proposal.clone()));
        Ok(())
    }

    fn build_checkpoint(&self, view: View, digest: Hash) -> Result<(), ApplyError> {
        self.checkpoints.lock().push((view, digest));
        Ok(())
    }
}
