//! Checkpoint trigger and stable-checkpoint vote collection.

use pbft_types::{Hash, StableCheckpoint, ValidatorId, View};
use std::collections::{BTreeMap, BTreeSet};

/// Decides when a checkpoint is due and collects checkpoint votes.
#[derive(Debug)]
pub struct CheckpointTracker {
    interval: u64,
    votes: BTreeMap<(u64, Hash), (View, BTreeSet<ValidatorId>)>,
    stable: Option<StableCheckpoint>,
}

impl CheckpointTracker {
    /// `interval == 0` disables checkpoints.
    pub fn new(interval: u64, stable: Option<StableCheckpoint>) -> Self {
        Self {
            interval,
            votes: BTreeMap::new(),
            stable,
        }
    }

    /// Whether committing `sequence` requires a checkpoint build.
    pub fn is_due(&self, sequence: u64) -> bool {
        self.interval > 0 && sequence > 0 && sequence % self.interval == 0
    }

    /// `(sequence, digest)` pairs with pending votes.
    pub fn tracked_buckets(&self) -> usize {
        self.votes.len()
    }

    /// Latest stable checkpoint.
    pub fn stable(&self) -> Option<&StableCheckpoint> {
        self.stable.as_ref()
    }

    /// Sequence covered by the stable checkpoint, 0 if none.
    pub fn stable_sequence(&self) -> u64 {
        self.stable.as_ref().map_or(0, |c| c.view.sequence)
    }

    /// Count a checkpoint vote.
    ///
    /// Only sequences on the checkpoint interval are counted, and a voter's
    /// first digest at a sequence is the only one kept. Returns the new
    /// stable checkpoint when this vote completes a quorum.
    pub fn add_vote(
        &mut self,
        view: View,
        digest: Hash,
        voter: ValidatorId,
        quorum: usize,
    ) -> Option<StableCheckpoint> {
        if view.sequence <= self.stable_sequence() || !self.is_due(view.sequence) {
            return None;
        }
        let already_voted = self
            .votes
            .range((view.sequence, Hash::ZERO)..(view.sequence + 1, Hash::ZERO))
            .any(|((_, voted), (_, voters))| *voted != digest && voters.contains(&voter));
        if already_voted {
            return None;
        }
        let (first_view, voters) = self
            .votes
            .entry((view.sequence, digest))
            .or_insert_with(|| (view, BTreeSet::new()));
        voters.insert(voter);
        if voters.len() < quorum {
            return None;
        }

        let checkpoint = StableCheckpoint {
            view: *first_view,
            digest,
            signers: voters.iter().copied().collect(),
        };
        self.votes = self.votes.split_off(&(view.sequence + 1, Hash::ZERO));
        self.stable = Some(checkpoint.clone());
        Some(checkpoint)
    }
}
