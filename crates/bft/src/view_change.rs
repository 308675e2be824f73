//! View change bookkeeping for liveness.
//!
//! # Exponential Backoff
//!
//! The view-change timeout doubles with each consecutive view change at the
//! same sequence, up to `2^max_backoff_exponent` times the base timeout. A
//! commit resets it.

use pbft_types::{ValidatorId, View};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// View-change votes and timeout backoff.
#[derive(Debug)]
pub struct ViewChangeState {
    /// Base view change timeout duration.
    base_timeout: Duration,

    /// Cap on the backoff exponent.
    max_backoff_exponent: u32,

    /// View changes applied since the last commit.
    consecutive: u32,

    /// Highest target we voted for.
    last_voted: Option<View>,

    /// Voters per target view.
    votes: BTreeMap<View, BTreeSet<ValidatorId>>,

    /// Each voter's live target. A voter counts toward one target at a time.
    latest: BTreeMap<ValidatorId, View>,
}

impl ViewChangeState {
    /// Create a new view change state.
    pub fn new(base_timeout: Duration, max_backoff_exponent: u32) -> Self {
        Self {
            base_timeout,
            max_backoff_exponent,
            consecutive: 0,
            last_voted: None,
            votes: BTreeMap::new(),
            latest: BTreeMap::new(),
        }
    }

    /// Current timeout with exponential backoff. Saturates at `Duration::MAX`.
    pub fn current_timeout(&self) -> Duration {
        let exponent = self.consecutive.min(self.max_backoff_exponent);
        2u32.checked_pow(exponent)
            .map_or(Duration::MAX, |factor| self.base_timeout.saturating_mul(factor))
    }

    /// Target to vote for when the timer fires at `current`.
    ///
    /// One view past `current`, or one past our last vote if we already voted
    /// at this sequence and no view change followed.
    pub fn next_target(&self, current: View) -> View {
        match self.last_voted {
            Some(last) if last.sequence == current.sequence && last > current => {
                last.next_view_number()
            }
            _ => current.next_view_number(),
        }
    }

    /// Whether we already voted for `target` or beyond.
    pub fn has_voted_for(&self, target: View) -> bool {
        self.last_voted.is_some_and(|last| last >= target)
    }

    /// Record that we voted for `target`.
    pub fn record_own_vote(&mut self, target: View) {
        self.last_voted = Some(target);
    }

    /// Count a vote. Returns the number of distinct voters for `target`.
    ///
    /// A higher target replaces the voter's earlier vote; a lower one is
    /// ignored. The tally therefore never holds more targets than voters.
    pub fn add_vote(&mut self, target: View, voter: ValidatorId) -> usize {
        match self.latest.get(&voter).copied() {
            Some(previous) if previous >= target => return self.vote_count(target),
            Some(previous) => {
                if let Some(voters) = self.votes.get_mut(&previous) {
                    voters.remove(&voter);
                    if voters.is_empty() {
                        self.votes.remove(&previous);
                    }
                }
            }
            None => {}
        }
        self.latest.insert(voter, target);
        let voters = self.votes.entry(target).or_default();
        voters.insert(voter);
        voters.len()
    }

    /// Targets with at least one live vote.
    pub fn tracked_targets(&self) -> usize {
        self.votes.len()
    }

    /// Voters for `target`.
    pub fn vote_count(&self, target: View) -> usize {
        self.votes.get(&target).map_or(0, BTreeSet::len)
    }

    /// A quorum moved us to `target`.
    pub fn on_view_changed(&mut self, target: View) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.votes = self.votes.split_off(&target.next_view_number());
        self.latest.retain(|_, view| *view > target);
        debug!(%target, consecutive = self.consecutive, "View change applied");
    }

    /// A sequence was committed at `committed`.
    pub fn on_commit(&mut self, committed: View) {
        self.consecutive = 0;
        self.votes = self.votes.split_off(&committed.next_sequence());
        self.latest.retain(|_, view| view.sequence > committed.sequence);
    }

    /// View changes since the last commit.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let base = Duration::from_secs(5);
        let mut state = ViewChangeState::new(base, 6);
        assert_eq!(state.current_timeout(), base);

        for round in 1..=10u32 {
            state.on_view_changed(View::new(round as u64, 1));
            let expected = base * 2u32.pow(round.min(6));
            assert_eq!(state.current_timeout(), expected, "round {round}");
        }

        state.on_commit(View::new(10, 1));
        assert_eq!(state.current_timeout(), base);
    }

    #[test]
    fn test_backoff_saturates_for_large_exponent() {
        let mut state = ViewChangeState::new(Duration::from_secs(5), 40);
        for round in 1..=40u64 {
            state.on_view_changed(View::new(round, 1));
        }
        assert_eq!(state.current_timeout(), Duration::MAX);

        let mut state = ViewChangeState::new(Duration::from_secs(u64::MAX / 2), 31);
        for round in 1..=31u64 {
            state.on_view_changed(View::new(round, 1));
        }
        assert_eq!(state.current_timeout(), Duration::MAX);
    }

    #[test]
    fn test_next_target_escalates_unanswered_vote() {
        let mut state = ViewChangeState::new(Duration::from_secs(1), 6);
        let current = View::new(0, 4);
        assert_eq!(state.next_target(current), View::new(1, 4));

        state.record_own_vote(View::new(1, 4));
        assert_eq!(state.next_target(current), View::new(2, 4));
        assert!(state.has_voted_for(View::new(1, 4)));
        assert!(!state.has_voted_for(View::new(2, 4)));

        // After the view change the next vote is relative to the new view.
        assert_eq!(state.next_target(View::new(1, 4)), View::new(2, 4));
        assert_eq!(state.next_target(View::new(0, 5)), View::new(1, 5));
    }

    #[test]
    fn test_votes_are_counted_per_target() {
        let mut state = ViewChangeState::new(Duration::from_secs(1), 6);
        let target = View::new(1, 2);
        assert_eq!(state.add_vote(target, ValidatorId(1)), 1);
        assert_eq!(state.add_vote(target, ValidatorId(1)), 1);
        assert_eq!(state.add_vote(target, ValidatorId(2)), 2);
        assert_eq!(state.add_vote(View::new(2, 2), ValidatorId(3)), 1);

        state.on_view_changed(target);
        assert_eq!(state.vote_count(target), 0);
        assert_eq!(state.vote_count(View::new(2, 2)), 1);

        state.on_commit(View::new(1, 2));
        assert_eq!(state.vote_count(View::new(2, 2)), 0);
        assert_eq!(state.tracked_targets(), 0);
    }

    #[test]
    fn test_higher_vote_replaces_earlier_one() {
        let mut state = ViewChangeState::new(Duration::from_secs(1), 6);
        assert_eq!(state.add_vote(View::new(1, 1), ValidatorId(0)), 1);
        assert_eq!(state.add_vote(View::new(1, 1), ValidatorId(1)), 2);

        assert_eq!(state.add_vote(View::new(2, 1), ValidatorId(1)), 1);
        assert_eq!(state.vote_count(View::new(1, 1)), 1);

        // Going back does not resurrect the earlier vote.
        assert_eq!(state.add_vote(View::new(1, 1), ValidatorId(1)), 1);
        assert_eq!(state.vote_count(View::new(2, 1)), 1);
    }

    #[test]
    fn test_flooding_voter_holds_one_target() {
        let mut state = ViewChangeState::new(Duration::from_secs(1), 6);
        for view_number in 1..=10_000 {
            state.add_vote(View::new(view_number, 1), ValidatorId(3));
        }
        assert_eq!(state.tracked_targets(), 1);
        assert_eq!(state.vote_count(View::new(10_000, 1)), 1);
    }
}
