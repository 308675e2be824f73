//! Vote accumulator for one (view, sequence).

use crate::BftError;
use pbft_types::{Preprepare, Snapshot, Subject, ValidatorId, ValidatorSet, View};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The live round: accepted preprepare plus prepare and commit votes.
///
/// Every admitted vote carries a subject equal to the accepted preprepare's
/// subject, so a tally is always for a single digest. Votes are keyed by
/// sender and a re-vote never counts twice.
#[derive(Debug, Clone)]
pub struct RoundState {
    view: View,
    validators: Arc<ValidatorSet>,
    preprepare: Option<Preprepare>,
    prepares: BTreeSet<ValidatorId>,
    commits: BTreeSet<ValidatorId>,
    completed: bool,
}

impl RoundState {
    /// Start a round. The validator set is fixed for the round's lifetime.
    pub fn new(view: View, validators: Arc<ValidatorSet>) -> Self {
        Self {
            view,
            validators,
            preprepare: None,
            prepares: BTreeSet::new(),
            commits: BTreeSet::new(),
            completed: false,
        }
    }

    /// View this round decides.
    pub fn view(&self) -> View {
        self.view
    }

    /// Membership for this round.
    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    /// Accepted preprepare, if any.
    pub fn preprepare(&self) -> Option<&Preprepare> {
        self.preprepare.as_ref()
    }

    /// Accept a preprepare.
    ///
    /// Returns `Ok(true)` on first acceptance and `Ok(false)` when the same
    /// subject was already accepted.
    pub fn set_preprepare(&mut self, preprepare: Preprepare) -> Result<bool, BftError> {
        if preprepare.view != self.view {
            return Err(BftError::InconsistentSubject);
        }
        match &self.preprepare {
            Some(existing) if existing.subject() == preprepare.subject() => Ok(false),
            Some(_) => Err(BftError::InconsistentSubject),
            None => {
                self.preprepare = Some(preprepare);
                Ok(true)
            }
        }
    }

    /// Subject of the accepted preprepare.
    pub fn subject(&self) -> Option<Subject> {
        self.preprepare.as_ref().map(Preprepare::subject)
    }

    fn admit(&self, subject: &Subject, sender: ValidatorId) -> Result<(), BftError> {
        if !self.validators.is_member(sender) {
            return Err(BftError::UnauthorizedAddress(sender));
        }
        if subject.view != self.view || self.subject().as_ref() != Some(subject) {
            return Err(BftError::InconsistentSubject);
        }
        Ok(())
    }

    /// Record a prepare vote. Returns the prepare count.
    pub fn add_prepare(&mut self, subject: &Subject, sender: ValidatorId) -> Result<usize, BftError> {
        self.admit(subject, sender)?;
        self.prepares.insert(sender);
        Ok(self.prepares.len())
    }

    /// Record a commit vote. Returns the commit count.
    pub fn add_commit(&mut self, subject: &Subject, sender: ValidatorId) -> Result<usize, BftError> {
        self.admit(subject, sender)?;
        self.commits.insert(sender);
        Ok(self.commits.len())
    }

    /// Number of distinct prepare voters.
    pub fn prepare_count(&self) -> usize {
        self.prepares.len()
    }

    /// Number of distinct commit voters.
    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// 2F+1 prepares.
    pub fn prepared_quorum_reached(&self) -> bool {
        self.prepares.len() >= self.validators.quorum()
    }

    /// 2F+1 commits.
    pub fn committed_quorum_reached(&self) -> bool {
        self.commits.len() >= self.validators.quorum()
    }

    /// Whether the round has been frozen.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Mark the round complete and return its frozen record.
    ///
    /// `None` if nothing was accepted or the round was already frozen.
    pub fn freeze(&mut self) -> Option<Snapshot> {
        if self.completed {
            return None;
        }
        let preprepare = self.preprepare.as_ref()?;
        self.completed = true;
        Some(Snapshot {
            view: self.view,
            proposal: preprepare.proposal.clone(),
            prepares: self.prepares.iter().copied().collect(),
            commits: self.commits.iter().copied().collect(),
        })
    }
}
