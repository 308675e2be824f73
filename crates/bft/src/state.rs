//! BFT consensus state machine.
//!
//! This module implements the three-phase PBFT core as a synchronous,
//! event-driven model.

use pbft_core::{Action, Backend, Event, StateMachine, TimerId};
use pbft_messages::{CheckpointVote, Message, MessageCode, ViewChangeVote};
use pbft_types::{
    Hash, Preprepare, Proposal, Request, StableCheckpoint, Subject, ValidatorId,
    ValidatorSet, View,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use crate::backlog::Backlog;
use crate::checkpoint::CheckpointTracker;
use crate::config::BftConfig;
use crate::persistence::RecoveredState;
use crate::round_state::RoundState;
use crate::snapshots::SnapshotHistory;
use crate::view_change::ViewChangeState;
use crate::{BftError, State};

/// BFT statistics for monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct BftStats {
    /// View changes applied.
    pub view_changes: u64,
    /// Last committed sequence.
    pub committed_sequence: u64,
    /// View number of the current round.
    pub current_view_number: u64,
    /// Messages rejected with a non-benign error.
    pub rejected_messages: u64,
    /// Messages queued in the backlog.
    pub queued_messages: u64,
}

/// BFT consensus state machine.
///
/// Owns the live [`RoundState`], the backlog and the snapshot history.
///
/// # State Machine Flow
///
/// 1. **Request** → If proposer, broadcast PrePrepare and own Prepare
/// 2. **PrePrepare** → Validate, accept, broadcast own Prepare
/// 3. **Prepare** → Collect; on quorum broadcast own Commit
/// 4. **Commit** → Collect; on quorum apply, snapshot, advance sequence
/// 5. **View Change Timer** → Vote to move to the next view if stuck
pub struct BftState {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    /// Identity, membership and signing.
    backend: Arc<dyn Backend>,

    /// Configuration.
    config: BftConfig,

    // ═══════════════════════════════════════════════════════════════════════════
    // Round State
    // ═══════════════════════════════════════════════════════════════════════════
    /// Phase of the current round.
    state: State,

    /// The live round.
    current: RoundState,

    /// View of the last committed proposal.
    committed: View,

    /// Digest of the last committed proposal. Parent of the next proposal.
    last_digest: Hash,

    /// Proposal we prepared in an abandoned view at the current sequence.
    /// Re-proposed if we become proposer.
    locked: Option<Proposal>,

    /// Client requests not yet committed, in arrival order.
    pending: VecDeque<Request>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Sub-components
    // ═══════════════════════════════════════════════════════════════════════════
    backlog: Backlog,
    snapshots: SnapshotHistory,
    view_change: ViewChangeState,
    checkpoints: CheckpointTracker,

    // ═══════════════════════════════════════════════════════════════════════════
    // Bookkeeping
    // ═══════════════════════════════════════════════════════════════════════════
    /// A state change happened; queued messages must be re-evaluated.
    replay_pending: bool,

    /// Progress was made; the view-change timer must be re-armed.
    rearm_timer: bool,

    stats: BftStats,

    /// Reason label of the most recent non-benign rejection, until taken.
    last_rejection: Option<&'static str>,

    now: Duration,
}

impl std::fmt::Debug for BftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BftState")
            .field("address", &self.address())
            .field("state", &self.state)
            .field("view", &self.current.view())
            .field("committed", &self.committed)
            .field("pending", &self.pending.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

impl BftState {
    /// Create a new BFT state machine resuming from `recovered`.
    pub fn new(config: BftConfig, backend: Arc<dyn Backend>, recovered: RecoveredState) -> Self {
        let view = View::new(
            recovered.committed.view_number,
            recovered.committed.sequence + 1,
        );
        let current = RoundState::new(view, backend.validators());
        Self {
            state: State::AcceptRequest,
            current,
            committed: recovered.committed,
            last_digest: recovered.last_digest,
            locked: None,
            pending: VecDeque::new(),
            backlog: Backlog::new(config.backlog_capacity_per_sender),
            snapshots: SnapshotHistory::new(),
            view_change: ViewChangeState::new(
                config.view_change_timeout(),
                config.max_backoff_exponent,
            ),
            checkpoints: CheckpointTracker::new(
                config.checkpoint_interval,
                recovered.stable_checkpoint,
            ),
            replay_pending: false,
            rearm_timer: false,
            stats: BftStats {
                committed_sequence: recovered.committed.sequence,
                current_view_number: view.view_number,
                ..BftStats::default()
            },
            last_rejection: None,
            now: Duration::ZERO,
            backend,
            config,
        }
    }

    /// Arm the view-change timer. Call once when the node starts.
    pub fn start(&mut self) -> Vec<Action> {
        info!(
            validator = %self.address(),
            view = %self.current.view(),
            "Starting consensus"
        );
        vec![self.timer_action()]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    fn address(&self) -> ValidatorId {
        self.backend.address()
    }

    fn validators(&self) -> &Arc<ValidatorSet> {
        self.current.validators()
    }

    /// Phase of the current round.
    pub fn state(&self) -> State {
        self.state
    }

    /// View of the current round.
    pub fn current_view(&self) -> View {
        self.current.view()
    }

    /// View of the last committed proposal.
    pub fn committed(&self) -> View {
        self.committed
    }

    /// Digest of the last committed proposal.
    pub fn last_digest(&self) -> Hash {
        self.last_digest
    }

    /// The live round.
    pub fn round_state(&self) -> &RoundState {
        &self.current
    }

    /// Shared handle to the committed history.
    pub fn snapshots(&self) -> SnapshotHistory {
        self.snapshots.clone()
    }

    /// Messages waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Requests not yet committed.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Latest stable checkpoint.
    pub fn stable_checkpoint(&self) -> Option<&StableCheckpoint> {
        self.checkpoints.stable()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BftStats {
        BftStats {
            current_view_number: self.current.view().view_number,
            ..self.stats
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    /// Take the reason of the last rejection `handle` swallowed, if any.
    pub fn take_last_rejection(&mut self) -> Option<&'static str> {
        self.last_rejection.take()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    fn timer_action(&self) -> Action {
        Action::SetTimer {
            id: TimerId::ViewChange,
            duration: self.view_change.current_timeout(),
        }
    }

    fn sign<T: Serialize>(&self, code: MessageCode, body: &T) -> Result<Message, BftError> {
        let message = Message::encode(code, body, self.address())?;
        let signature = self.backend.sign(&message.signing_bytes());
        Ok(message.with_signature(signature))
    }

    fn broadcast<T: Serialize>(&self, code: MessageCode, body: &T) -> Result<Action, BftError> {
        Ok(Action::Broadcast {
            message: self.sign(code, body)?,
        })
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!(from = %self.state, to = %state, view = %self.current.view(), "State change");
        }
        self.state = state;
        self.replay_pending = true;
        self.rearm_timer = true;
    }

    /// Re-arm the timer and replay the backlog if the state moved.
    fn finish(&mut self, actions: &mut Vec<Action>) {
        if std::mem::take(&mut self.rearm_timer) {
            actions.push(self.timer_action());
        }
        if std::mem::take(&mut self.replay_pending) {
            let ready = self.backlog.drain_ready(self.current.view(), self.state);
            if !ready.is_empty() {
                debug!(count = ready.len(), view = %self.current.view(), "Replaying backlog");
            }
            actions.extend(ready.into_iter().map(|message| Action::EnqueueInternal {
                event: Event::BacklogMessage { message },
            }));
        }
    }

    fn queue(&mut self, view: View, message: Message) -> BftError {
        if self.backlog.push(view, message) {
            self.stats.queued_messages += 1;
        }
        BftError::FutureMessage
    }

    /// Old/future check for preprepare, prepare and commit messages.
    fn check_message(&self, code: MessageCode, view: View) -> Result<(), BftError> {
        let current = self.current.view();
        if view > current {
            return Err(BftError::FutureMessage);
        }
        if view < current {
            return Err(BftError::OldMessage);
        }
        if self.state == State::AcceptRequest && code != MessageCode::PrePrepare {
            return Err(BftError::FutureMessage);
        }
        Ok(())
    }

    /// Run `check_message`, queueing the message if it is from the future.
    fn admit(&mut self, message: &Message, view: View) -> Result<(), BftError> {
        match self.check_message(message.code, view) {
            Err(BftError::FutureMessage) => Err(self.queue(view, message.clone())),
            other => other,
        }
    }

    /// A vote must carry exactly the subject of the accepted preprepare.
    fn verify_subject(&self, subject: &Subject) -> Result<(), BftError> {
        match self.current.subject() {
            Some(current) if current == *subject => Ok(()),
            _ => Err(BftError::InconsistentSubject),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Requests and proposing
    // ═══════════════════════════════════════════════════════════════════════════

    fn locked_at(&self, sequence: u64) -> Option<&Proposal> {
        self.locked.as_ref().filter(|p| p.sequence() == sequence)
    }

    /// Handle a client request.
    ///
    /// Requests are deduplicated by payload: a request equal to one already
    /// pending is ignored, since every replica receives the same submission
    /// and the committed proposal removes it by payload.
    pub fn on_request(&mut self, request: Request) -> Result<Vec<Action>, BftError> {
        if self.pending.iter().any(|r| r == &request) {
            debug!(bytes = request.payload.len(), "Duplicate request ignored");
            return Ok(vec![]);
        }
        if self.pending.len() >= self.config.max_pending_requests {
            warn!(
                pending = self.pending.len(),
                "Pending request queue full, dropping request"
            );
            return Ok(vec![]);
        }
        self.pending.push_back(request);

        let mut actions = self.try_propose()?;
        self.finish(&mut actions);
        Ok(actions)
    }

    /// Propose if we lead the current view and nothing is in flight.
    fn try_propose(&mut self) -> Result<Vec<Action>, BftError> {
        let view = self.current.view();
        if self.state != State::AcceptRequest
            || self.validators().proposer_for(&view) != self.address()
        {
            return Ok(vec![]);
        }

        let proposal = match self.locked_at(view.sequence) {
            Some(locked) => locked.clone(),
            None => match self.pending.front() {
                Some(request) => {
                    let payload = request.payload.clone();
                    let data_hash = self.backend.hash(&payload);
                    Proposal::new(view.sequence, self.last_digest, data_hash, payload)
                }
                None => return Ok(vec![]),
            },
        };

        let preprepare = Preprepare::new(view, proposal);
        let subject = preprepare.subject();
        self.current.set_preprepare(preprepare.clone())?;
        info!(
            validator = %self.address(),
            %view,
            digest = %subject.digest,
            "Proposing"
        );

        let mut actions = vec![self.broadcast(MessageCode::PrePrepare, &preprepare)?];
        actions.extend(self.accept_preprepared(subject)?);
        Ok(actions)
    }

    /// Broadcast and count our own prepare, then enter Preprepared.
    fn accept_preprepared(&mut self, subject: Subject) -> Result<Vec<Action>, BftError> {
        let mut actions = vec![self.broadcast(MessageCode::Prepare, &subject)?];
        self.current.add_prepare(&subject, self.address())?;
        self.set_state(State::Preprepared);
        if self.current.prepared_quorum_reached() {
            actions.extend(self.enter_prepared(subject)?);
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Inbound messages
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle a message received from the network.
    ///
    /// Membership and signature are checked before anything else, so only
    /// authenticated messages reach the backlog.
    #[instrument(level = "trace", skip(self, message), fields(
        code = message.code.type_name(),
        sender = %message.sender,
    ))]
    pub fn on_message(&mut self, message: Message) -> Result<Vec<Action>, BftError> {
        if !self.validators().is_member(message.sender) {
            return Err(BftError::UnauthorizedAddress(message.sender));
        }
        if !self
            .backend
            .verify(message.sender, &message.signing_bytes(), &message.signature)
        {
            return Err(BftError::InvalidSignature(message.sender));
        }
        self.process(message)
    }

    /// Handle a message replayed from the backlog.
    pub fn on_backlog_message(&mut self, message: Message) -> Result<Vec<Action>, BftError> {
        self.process(message)
    }

    fn process(&mut self, message: Message) -> Result<Vec<Action>, BftError> {
        let mut actions = match message.code {
            MessageCode::PrePrepare => {
                let preprepare: Preprepare = message.decode()?;
                self.handle_preprepare(&message, preprepare)?
            }
            MessageCode::Prepare => {
                let subject: Subject = message.decode()?;
                self.handle_prepare(&message, subject)?
            }
            MessageCode::Commit => {
                let subject: Subject = message.decode()?;
                self.handle_commit(&message, subject)?
            }
            MessageCode::ViewChange => {
                let vote: ViewChangeVote = message.decode()?;
                self.handle_view_change(&message, vote)?
            }
            MessageCode::Checkpoint => {
                let vote: CheckpointVote = message.decode()?;
                self.handle_checkpoint(&message, vote)?
            }
        };
        self.finish(&mut actions);
        Ok(actions)
    }

    fn handle_preprepare(
        &mut self,
        message: &Message,
        preprepare: Preprepare,
    ) -> Result<Vec<Action>, BftError> {
        let view = preprepare.view;
        if self.validators().proposer_for(&view) != message.sender {
            return Err(BftError::NotFromProposer);
        }
        self.admit(message, view)?;

        let header = &preprepare.proposal.header;
        if header.sequence != view.sequence {
            return Err(BftError::InvalidProposal(format!(
                "sequence {} in view {}",
                header.sequence, view
            )));
        }
        if self.backend.hash(&preprepare.proposal.payload) != header.data_hash {
            return Err(BftError::InvalidProposal("data hash mismatch".into()));
        }
        if header.parent_hash != self.last_digest {
            return Err(BftError::InvalidProposal(format!(
                "parent {} does not extend {}",
                header.parent_hash, self.last_digest
            )));
        }

        // A proposal prepared in an earlier view stays locked until committed.
        if let Some(locked) = self.locked_at(view.sequence) {
            if locked.hash() != preprepare.proposal.hash() {
                debug!(
                    %view,
                    locked = %locked.hash(),
                    proposed = %preprepare.proposal.hash(),
                    "Preprepare conflicts with locked proposal"
                );
                return Err(BftError::InconsistentSubject);
            }
        }

        let subject = preprepare.subject();
        if !self.current.set_preprepare(preprepare)? {
            trace!(%view, "Duplicate preprepare ignored");
            return Ok(vec![]);
        }
        debug!(
            validator = %self.address(),
            %view,
            digest = %subject.digest,
            "Accepted preprepare"
        );
        self.accept_preprepared(subject)
    }

    fn handle_prepare(&mut self, message: &Message, subject: Subject) -> Result<Vec<Action>, BftError> {
        self.admit(message, subject.view)?;
        self.verify_subject(&subject)?;

        let count = self.current.add_prepare(&subject, message.sender)?;
        trace!(sender = %message.sender, count, "Prepare counted");

        if self.state == State::Preprepared && self.current.prepared_quorum_reached() {
            return self.enter_prepared(subject);
        }
        Ok(vec![])
    }

    fn handle_commit(&mut self, message: &Message, subject: Subject) -> Result<Vec<Action>, BftError> {
        self.admit(message, subject.view)?;
        self.verify_subject(&subject)?;

        let count = self.current.add_commit(&subject, message.sender)?;
        trace!(sender = %message.sender, count, "Commit counted");

        if self.state == State::Prepared && self.current.committed_quorum_reached() {
            return self.commit();
        }
        Ok(vec![])
    }

    /// Prepare quorum: broadcast and count our own commit.
    ///
    /// Commits may have arrived before the prepares, so the commit quorum is
    /// re-checked here.
    fn enter_prepared(&mut self, subject: Subject) -> Result<Vec<Action>, BftError> {
        debug!(validator = %self.address(), view = %subject.view, "Prepared");
        self.set_state(State::Prepared);
        let mut actions = vec![self.broadcast(MessageCode::Commit, &subject)?];
        self.current.add_commit(&subject, self.address())?;
        if self.current.committed_quorum_reached() {
            actions.extend(self.commit()?);
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commit
    // ═══════════════════════════════════════════════════════════════════════════

    /// Commit quorum: hand the proposal to the application and advance.
    fn commit(&mut self) -> Result<Vec<Action>, BftError> {
        self.set_state(State::Committed);
        let Some(snapshot) = self.current.freeze() else {
            warn!(view = %self.current.view(), "Commit quorum without a preprepare");
            return Ok(vec![]);
        };
        let view = snapshot.view;
        let digest = snapshot.digest();
        info!(
            validator = %self.address(),
            %view,
            %digest,
            commits = snapshot.commits.len(),
            "Committed"
        );

        let mut actions = vec![Action::CommitProposal {
            view,
            proposal: snapshot.proposal.clone(),
        }];

        if let Some(pos) = self
            .pending
            .iter()
            .position(|r| r.payload == snapshot.proposal.payload)
        {
            self.pending.remove(pos);
        }
        self.snapshots.append(snapshot.clone());
        actions.push(Action::PersistSnapshot { snapshot });

        self.committed = view;
        self.last_digest = digest;
        self.locked = None;
        self.stats.committed_sequence = view.sequence;
        self.view_change.on_commit(view);
        self.current = RoundState::new(view.next_sequence(), self.backend.validators());

        if self.checkpoints.is_due(view.sequence) {
            self.set_state(State::CheckpointReady);
            debug!(%view, "Checkpoint due");
            actions.push(Action::BuildCheckpoint { view, digest });
        }

        self.set_state(State::AcceptRequest);
        actions.extend(self.try_propose()?);
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════════

    fn has_work_in_flight(&self) -> bool {
        self.state != State::AcceptRequest || !self.pending.is_empty()
    }

    /// Handle the view-change timer.
    ///
    /// Always re-arms. Votes for the next view only when a round is stuck,
    /// so an idle cluster keeps its view.
    pub fn on_view_change_timer(&mut self) -> Result<Vec<Action>, BftError> {
        let mut actions = vec![self.timer_action()];
        if !self.has_work_in_flight() {
            trace!("View change timer fired while idle");
            return Ok(actions);
        }

        let target = self.view_change.next_target(self.current.view());
        info!(
            validator = %self.address(),
            current = %self.current.view(),
            %target,
            timeout = ?self.view_change.current_timeout(),
            "View change timer fired, voting for next view"
        );
        actions.extend(self.vote_view_change(target)?);
        self.finish(&mut actions);
        Ok(actions)
    }

    fn vote_view_change(&mut self, target: View) -> Result<Vec<Action>, BftError> {
        self.view_change.record_own_vote(target);
        let mut actions = vec![self.broadcast(MessageCode::ViewChange, &ViewChangeVote::new(target))?];
        let count = self.view_change.add_vote(target, self.address());
        if count >= self.validators().quorum() {
            actions.extend(self.apply_view_change(target)?);
        }
        Ok(actions)
    }

    fn handle_view_change(
        &mut self,
        message: &Message,
        vote: ViewChangeVote,
    ) -> Result<Vec<Action>, BftError> {
        let target = vote.target;
        let current = self.current.view();
        if target.sequence < current.sequence || target <= current {
            return Err(BftError::OldMessage);
        }
        if target.sequence > current.sequence {
            return Err(self.queue(target, message.clone()));
        }

        let count = self.view_change.add_vote(target, message.sender);
        debug!(sender = %message.sender, %target, count, "View change vote");

        let (quorum, faulty) = (self.validators().quorum(), self.validators().f());
        if count >= quorum {
            return self.apply_view_change(target);
        }
        // F+1 votes include an honest validator: join rather than wait for our timer.
        if count > faulty && !self.view_change.has_voted_for(target) {
            return self.vote_view_change(target);
        }
        Ok(vec![])
    }

    /// Quorum reached: abandon the current round and start `target`.
    fn apply_view_change(&mut self, target: View) -> Result<Vec<Action>, BftError> {
        if self.state == State::Prepared {
            self.locked = self.current.preprepare().map(|p| p.proposal.clone());
        }
        info!(
            validator = %self.address(),
            from = %self.current.view(),
            to = %target,
            "Applied view change"
        );
        self.current = RoundState::new(target, self.backend.validators());
        self.view_change.on_view_changed(target);
        self.stats.view_changes += 1;
        self.set_state(State::AcceptRequest);
        self.try_propose()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════════

    /// The application built the checkpoint requested for `view`.
    pub fn on_checkpoint_built(&mut self, view: View, digest: Hash) -> Result<Vec<Action>, BftError> {
        debug!(%view, "Checkpoint built, announcing");
        let mut actions =
            vec![self.broadcast(MessageCode::Checkpoint, &CheckpointVote::new(view, digest))?];
        actions.extend(self.count_checkpoint_vote(view, digest, self.address()));
        Ok(actions)
    }

    fn handle_checkpoint(
        &mut self,
        message: &Message,
        vote: CheckpointVote,
    ) -> Result<Vec<Action>, BftError> {
        if vote.view.sequence <= self.checkpoints.stable_sequence() {
            return Err(BftError::OldMessage);
        }
        if !self.checkpoints.is_due(vote.view.sequence) {
            return Err(BftError::InconsistentSubject);
        }
        if vote.view.sequence > self.committed.sequence {
            return Err(self.queue(vote.view, message.clone()));
        }
        Ok(self.count_checkpoint_vote(vote.view, vote.digest, message.sender))
    }

    fn count_checkpoint_vote(&mut self, view: View, digest: Hash, voter: ValidatorId) -> Vec<Action> {
        let quorum = self.validators().quorum();
        match self.checkpoints.add_vote(view, digest, voter, quorum) {
            Some(checkpoint) => {
                info!(view = %checkpoint.view, signers = checkpoint.signers.len(), "Checkpoint stable");
                vec![Action::PersistCheckpoint { checkpoint }]
            }
            None => vec![],
        }
    }

    fn record_rejection(&mut self, event: &'static str, error: &BftError) {
        if error.is_benign() {
            trace!(event, %error, "Message not processed");
        } else {
            self.stats.rejected_messages += 1;
            self.last_rejection = Some(error.reason());
            warn!(validator = %self.address(), event, %error, "Rejected");
        }
    }
}

impl StateMachine for BftState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        let name = event.type_name();
        let result = match event {
            Event::RequestReceived { request } => self.on_request(request),
            Event::MessageReceived { message } => self.on_message(message),
            Event::BacklogMessage { message } => self.on_backlog_message(message),
            Event::ViewChangeTimer => self.on_view_change_timer(),
            Event::CheckpointBuilt { view, digest } => self.on_checkpoint_built(view, digest),
        };
        match result {
            Ok(actions) => actions,
            Err(error) => {
                self.record_rejection(name, &error);
                let mut actions = vec![];
                self.finish(&mut actions);
                actions
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_core::StaticBackend;
    use pbft_types::test_utils::test_validator_set;
    use tracing_test::traced_test;

    const N: u64 = 4;

    fn backend(id: u64) -> Arc<StaticBackend> {
        Arc::new(StaticBackend::insecure_for_testing(
            ValidatorId(id),
            test_validator_set(N),
        ))
    }

    fn make_state(id: u64, config: BftConfig) -> BftState {
        BftState::new(config, backend(id), RecoveredState::default())
    }

    fn signed<T: Serialize>(from: u64, code: MessageCode, body: &T) -> Message {
        let message = Message::encode(code, body, ValidatorId(from)).unwrap();
        let signature = backend(from).sign(&message.signing_bytes());
        message.with_signature(signature)
    }

    fn proposal(sequence: u64, parent: Hash, payload: &[u8]) -> Proposal {
        Proposal::new(sequence, parent, Hash::from_bytes(payload), payload.to_vec())
    }

    fn preprepare_at(view: View) -> Preprepare {
        Preprepare::new(view, proposal(view.sequence, Hash::ZERO, b"tx"))
    }

    /// Put `state` in Preprepared at `view` without emitting anything.
    fn preprepared(state: &mut BftState, view: View) -> Subject {
        state.current = RoundState::new(view, state.backend.validators());
        let preprepare = preprepare_at(view);
        let subject = preprepare.subject();
        state.current.set_preprepare(preprepare).unwrap();
        state.state = State::Preprepared;
        subject
    }

    fn broadcasts(actions: &[Action], code: MessageCode) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { message } if message.code == code => Some(message),
                _ => None,
            })
            .collect()
    }

    fn replayed(actions: &[Action]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::EnqueueInternal {
                    event: Event::BacklogMessage { message },
                } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Prepare handling
    // ═══════════════════════════════════════════════════════════════════════════

    #[traced_test]
    #[test]
    fn test_prepare_quorum_sends_one_commit() {
        let mut state = make_state(0, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));

        let mut commits = 0;
        for sender in 0..N {
            let actions = state
                .on_message(signed(sender, MessageCode::Prepare, &subject))
                .unwrap();
            let sent = broadcasts(&actions, MessageCode::Commit);
            for message in &sent {
                assert_eq!(message.decode::<Subject>().unwrap(), subject);
            }
            commits += sent.len();
        }

        assert_eq!(state.state(), State::Prepared);
        assert!(state.round_state().prepare_count() > 2);
        assert_eq!(commits, 1);
    }

    #[test]
    fn test_prepare_below_quorum_stays_preprepared() {
        let mut state = make_state(0, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));

        for sender in [2, 3] {
            let actions = state
                .on_message(signed(sender, MessageCode::Prepare, &subject))
                .unwrap();
            assert!(broadcasts(&actions, MessageCode::Commit).is_empty());
        }
        assert_eq!(state.state(), State::Preprepared);
        assert_eq!(state.round_state().prepare_count(), 2);
    }

    #[test]
    fn test_prepare_from_future_view_is_queued() {
        let mut state = make_state(0, BftConfig::default());
        preprepared(&mut state, View::new(0, 1));

        let future = Subject::new(View::new(2, 3), Hash::from_bytes(b"x"));
        let err = state
            .on_message(signed(1, MessageCode::Prepare, &future))
            .unwrap_err();
        assert!(matches!(err, BftError::FutureMessage));
        assert_eq!(state.backlog_len(), 1);
        assert_eq!(state.round_state().prepare_count(), 0);
    }

    #[test]
    fn test_prepare_from_old_view_is_dropped() {
        let mut state = make_state(0, BftConfig::default());
        preprepared(&mut state, View::new(0, 1));

        let old = Subject::new(View::new(0, 0), Hash::from_bytes(b"x"));
        let err = state
            .on_message(signed(1, MessageCode::Prepare, &old))
            .unwrap_err();
        assert!(matches!(err, BftError::OldMessage));
        assert_eq!(state.backlog_len(), 0);
    }

    #[test]
    fn test_prepare_with_other_digest_is_inconsistent() {
        let mut state = make_state(0, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));

        let other = Subject::new(subject.view, Hash::from_bytes(b"other"));
        let err = state
            .on_message(signed(1, MessageCode::Prepare, &other))
            .unwrap_err();
        assert!(matches!(err, BftError::InconsistentSubject));
        assert_eq!(state.round_state().prepare_count(), 0);
    }

    #[test]
    fn test_verify_subject_grid() {
        let mut state = make_state(0, BftConfig::default());
        let digest = preprepare_at(View::new(0, 0)).subject().digest;
        let cases = [
            // (round state view, vote subject, accepted)
            (View::new(0, 0), Subject::new(View::new(0, 0), digest), true),
            // old message
            (View::new(1, 1), Subject::new(View::new(0, 0), digest), false),
            // different digest
            (View::new(1, 1), Subject::new(View::new(0, 0), Hash::from_bytes(b"1234567890")), false),
            // same sequence, different view number
            (View::new(0, 0), Subject::new(View::new(1, 0), digest), false),
            // same view number, different sequence
            (View::new(0, 0), Subject::new(View::new(0, 1), digest), false),
        ];

        for (i, (round_view, subject, accepted)) in cases.into_iter().enumerate() {
            preprepared(&mut state, round_view);
            let result = state.verify_subject(&subject);
            if accepted {
                assert!(result.is_ok(), "case {i}");
            } else {
                assert!(matches!(result, Err(BftError::InconsistentSubject)), "case {i}");
            }
        }
    }

    #[test]
    fn test_truncated_payload_is_codec_error() {
        let mut state = make_state(0, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));

        let mut message = Message::encode(MessageCode::Prepare, &subject, ValidatorId(1)).unwrap();
        message.payload.truncate(10);
        let signature = backend(1).sign(&message.signing_bytes());
        let err = state.on_message(message.with_signature(signature)).unwrap_err();

        assert!(matches!(err, BftError::Codec(_)));
        assert_eq!(state.state(), State::Preprepared);
    }

    #[test]
    fn test_unknown_sender_and_bad_signature() {
        let mut state = make_state(0, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));

        let stranger = Message::encode(MessageCode::Prepare, &subject, ValidatorId(9)).unwrap();
        assert!(matches!(
            state.on_message(stranger),
            Err(BftError::UnauthorizedAddress(ValidatorId(9)))
        ));

        let forged = signed(1, MessageCode::Prepare, &subject).with_signature(vec![0; 32]);
        assert!(matches!(
            state.on_message(forged),
            Err(BftError::InvalidSignature(ValidatorId(1)))
        ));
        assert_eq!(state.round_state().prepare_count(), 0);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commit handling
    // ═══════════════════════════════════════════════════════════════════════════

    #[traced_test]
    #[test]
    fn test_commit_quorum_boundary() {
        let mut state = make_state(0, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));
        state.state = State::Prepared;

        state.on_message(signed(1, MessageCode::Commit, &subject)).unwrap();
        state.on_message(signed(2, MessageCode::Commit, &subject)).unwrap();
        assert_eq!(state.state(), State::Prepared);
        assert!(state.snapshots().is_empty());

        let actions = state.on_message(signed(3, MessageCode::Commit, &subject)).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CommitProposal { view, .. } if *view == subject.view)));
        assert!(actions.iter().any(|a| matches!(a, Action::PersistSnapshot { .. })));

        assert_eq!(state.committed(), subject.view);
        assert_eq!(state.last_digest(), subject.digest);
        assert_eq!(state.current_view(), View::new(0, 2));
        assert_eq!(state.state(), State::AcceptRequest);
        let snapshot = state.snapshots().last().unwrap();
        assert_eq!(snapshot.commits.len(), 3);
    }

    #[test]
    fn test_early_commits_complete_on_prepared() {
        let mut state = make_state(1, BftConfig::default());
        let subject = preprepared(&mut state, View::new(0, 1));

        for sender in [0, 2, 3] {
            state.on_message(signed(sender, MessageCode::Commit, &subject)).unwrap();
        }
        assert_eq!(state.state(), State::Preprepared);

        state.on_message(signed(0, MessageCode::Prepare, &subject)).unwrap();
        state.on_message(signed(2, MessageCode::Prepare, &subject)).unwrap();
        let actions = state.on_message(signed(3, MessageCode::Prepare, &subject)).unwrap();

        assert_eq!(broadcasts(&actions, MessageCode::Commit).len(), 1);
        assert_eq!(state.committed(), subject.view);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Preprepare handling
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_preprepare_accept_then_idempotent() {
        let mut state = make_state(1, BftConfig::default());
        let preprepare = preprepare_at(View::new(0, 1));

        let actions = state
            .on_message(signed(0, MessageCode::PrePrepare, &preprepare))
            .unwrap();
        let prepares = broadcasts(&actions, MessageCode::Prepare);
        assert_eq!(prepares.len(), 1);
        assert_eq!(prepares[0].decode::<Subject>().unwrap(), preprepare.subject());
        assert_eq!(state.state(), State::Preprepared);
        assert_eq!(state.round_state().prepare_count(), 1);

        let again = state
            .on_message(signed(0, MessageCode::PrePrepare, &preprepare))
            .unwrap();
        assert!(broadcasts(&again, MessageCode::Prepare).is_empty());

        let conflicting = Preprepare::new(View::new(0, 1), proposal(1, Hash::ZERO, b"other"));
        assert!(matches!(
            state.on_message(signed(0, MessageCode::PrePrepare, &conflicting)),
            Err(BftError::InconsistentSubject)
        ));
    }

    #[test]
    fn test_preprepare_checks() {
        let mut state = make_state(1, BftConfig::default());

        let from_replica = preprepare_at(View::new(0, 1));
        assert!(matches!(
            state.on_message(signed(2, MessageCode::PrePrepare, &from_replica)),
            Err(BftError::NotFromProposer)
        ));

        let wrong_sequence = Preprepare::new(View::new(0, 1), proposal(2, Hash::ZERO, b"tx"));
        assert!(matches!(
            state.on_message(signed(0, MessageCode::PrePrepare, &wrong_sequence)),
            Err(BftError::InvalidProposal(_))
        ));

        let mut tampered = preprepare_at(View::new(0, 1));
        tampered.proposal.payload = b"changed".to_vec();
        assert!(matches!(
            state.on_message(signed(0, MessageCode::PrePrepare, &tampered)),
            Err(BftError::InvalidProposal(_))
        ));

        let wrong_parent = Preprepare::new(
            View::new(0, 1),
            proposal(1, Hash::from_bytes(b"fork"), b"tx"),
        );
        assert!(matches!(
            state.on_message(signed(0, MessageCode::PrePrepare, &wrong_parent)),
            Err(BftError::InvalidProposal(_))
        ));
        assert_eq!(state.state(), State::AcceptRequest);
    }

    #[test]
    fn test_future_votes_replay_after_preprepare() {
        let mut state = make_state(1, BftConfig::default());
        let preprepare = preprepare_at(View::new(0, 1));
        let subject = preprepare.subject();

        for sender in [2, 3] {
            let err = state
                .on_message(signed(sender, MessageCode::Prepare, &subject))
                .unwrap_err();
            assert!(matches!(err, BftError::FutureMessage));
        }
        assert_eq!(state.backlog_len(), 2);
        assert_eq!(state.round_state().prepare_count(), 0);

        let actions = state
            .on_message(signed(0, MessageCode::PrePrepare, &preprepare))
            .unwrap();
        let queued = replayed(&actions);
        assert_eq!(queued.len(), 2);
        assert_eq!(state.backlog_len(), 0);

        let mut commits = 0;
        for message in queued {
            let actions = state.handle(Event::BacklogMessage { message });
            commits += broadcasts(&actions, MessageCode::Commit).len();
        }
        assert_eq!(commits, 1);
        assert_eq!(state.state(), State::Prepared);
        assert_eq!(state.round_state().prepare_count(), 3);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_proposer_broadcasts_preprepare_and_prepare() {
        let mut state = make_state(0, BftConfig::default());
        let actions = state.on_request(Request::new(b"tx".to_vec())).unwrap();

        let preprepares = broadcasts(&actions, MessageCode::PrePrepare);
        assert_eq!(preprepares.len(), 1);
        let preprepare: Preprepare = preprepares[0].decode().unwrap();
        assert_eq!(preprepare.view, View::new(0, 1));
        assert_eq!(preprepare.proposal.header.parent_hash, Hash::ZERO);
        assert_eq!(broadcasts(&actions, MessageCode::Prepare).len(), 1);
        assert_eq!(state.state(), State::Preprepared);
        assert!(actions.iter().any(|a| matches!(a, Action::SetTimer { .. })));
    }

    #[test]
    fn test_replica_only_queues_request() {
        let mut state = make_state(2, BftConfig::default());
        let actions = state.on_request(Request::new(b"tx".to_vec())).unwrap();
        assert!(actions.is_empty());
        assert_eq!(state.pending_requests(), 1);
        assert_eq!(state.state(), State::AcceptRequest);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════════

    fn commit_at(state: &mut BftState, sequence: u64) -> Vec<Action> {
        let view = View::new(0, sequence);
        state.current = RoundState::new(view, state.backend.validators());
        let preprepare = Preprepare::new(view, proposal(sequence, state.last_digest, b"tx"));
        let subject = preprepare.subject();
        state.current.set_preprepare(preprepare).unwrap();
        state.state = State::Prepared;
        let mut actions = vec![];
        for sender in 1..N {
            actions.extend(
                state
                    .on_message(signed(sender, MessageCode::Commit, &subject))
                    .unwrap(),
            );
        }
        actions
    }

    fn checkpoint_requests(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::BuildCheckpoint { .. }))
            .count()
    }

    #[test]
    fn test_checkpoint_triggered_at_interval_only() {
        let mut state = make_state(2, BftConfig::default());
        assert_eq!(checkpoint_requests(&commit_at(&mut state, 99)), 0);
        assert_eq!(checkpoint_requests(&commit_at(&mut state, 100)), 1);
        assert_eq!(checkpoint_requests(&commit_at(&mut state, 101)), 0);
        assert_eq!(state.state(), State::AcceptRequest);
    }

    #[test]
    fn test_checkpoint_becomes_stable_on_quorum() {
        let mut state = make_state(2, BftConfig::default().with_checkpoint_interval(1));
        commit_at(&mut state, 1);
        let view = state.committed();
        let digest = state.last_digest();

        let actions = state.on_checkpoint_built(view, digest).unwrap();
        assert_eq!(broadcasts(&actions, MessageCode::Checkpoint).len(), 1);

        let vote = CheckpointVote::new(view, digest);
        state.on_message(signed(0, MessageCode::Checkpoint, &vote)).unwrap();
        let actions = state.on_message(signed(1, MessageCode::Checkpoint, &vote)).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::PersistCheckpoint { .. })));
        assert_eq!(state.stable_checkpoint().unwrap().view, view);

        assert!(matches!(
            state.on_message(signed(3, MessageCode::Checkpoint, &vote)),
            Err(BftError::OldMessage)
        ));
    }

    #[test]
    fn test_checkpoint_vote_off_interval_is_rejected() {
        let mut state = make_state(2, BftConfig::default().with_checkpoint_interval(2));
        commit_at(&mut state, 1);
        commit_at(&mut state, 2);

        let vote = CheckpointVote::new(View::new(0, 1), Hash::from_bytes(b"1"));
        assert!(matches!(
            state.on_message(signed(0, MessageCode::Checkpoint, &vote)),
            Err(BftError::InconsistentSubject)
        ));
        assert_eq!(state.checkpoints.tracked_buckets(), 0);

        let vote = CheckpointVote::new(View::new(0, 2), state.last_digest());
        state.on_message(signed(0, MessageCode::Checkpoint, &vote)).unwrap();
        assert_eq!(state.checkpoints.tracked_buckets(), 1);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_idle_timer_only_rearms() {
        let mut state = make_state(1, BftConfig::default());
        let actions = state.on_view_change_timer().unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::SetTimer { id: TimerId::ViewChange, .. }));
    }

    #[traced_test]
    #[test]
    fn test_view_change_quorum_moves_to_new_proposer() {
        let mut state = make_state(1, BftConfig::default());
        state.on_request(Request::new(b"tx".to_vec())).unwrap();

        let actions = state.on_view_change_timer().unwrap();
        let votes = broadcasts(&actions, MessageCode::ViewChange);
        assert_eq!(votes.len(), 1);
        let target = votes[0].decode::<ViewChangeVote>().unwrap().target;
        assert_eq!(target, View::new(1, 1));

        state
            .on_message(signed(2, MessageCode::ViewChange, &ViewChangeVote::new(target)))
            .unwrap();
        let actions = state
            .on_message(signed(3, MessageCode::ViewChange, &ViewChangeVote::new(target)))
            .unwrap();

        assert_eq!(state.current_view(), target);
        assert_eq!(state.stats().view_changes, 1);
        // Validator 1 leads view 1 and re-proposes the pending request.
        assert_eq!(broadcasts(&actions, MessageCode::PrePrepare).len(), 1);
        assert_eq!(state.state(), State::Preprepared);
        match actions.iter().find(|a| matches!(a, Action::SetTimer { .. })) {
            Some(Action::SetTimer { duration, .. }) => {
                assert_eq!(*duration, state.config().view_change_timeout() * 2)
            }
            _ => panic!("timer not re-armed"),
        }
    }

    #[test]
    fn test_f_plus_one_votes_join_view_change() {
        let mut state = make_state(2, BftConfig::default());
        let target = View::new(1, 1);

        state
            .on_message(signed(0, MessageCode::ViewChange, &ViewChangeVote::new(target)))
            .unwrap();
        let actions = state
            .on_message(signed(3, MessageCode::ViewChange, &ViewChangeVote::new(target)))
            .unwrap();

        // Our own vote completes the quorum of three.
        assert_eq!(broadcasts(&actions, MessageCode::ViewChange).len(), 1);
        assert_eq!(state.current_view(), target);
    }

    #[test]
    fn test_locked_proposal_is_reproposed() {
        let mut state = make_state(1, BftConfig::default());
        let view = View::new(0, 1);
        let locked = preprepared(&mut state, view);
        state.state = State::Prepared;
        state.on_request(Request::new(b"other".to_vec())).unwrap();

        state.on_view_change_timer().unwrap();
        let target = View::new(1, 1);
        state
            .on_message(signed(2, MessageCode::ViewChange, &ViewChangeVote::new(target)))
            .unwrap();
        let actions = state
            .on_message(signed(3, MessageCode::ViewChange, &ViewChangeVote::new(target)))
            .unwrap();

        let proposals = broadcasts(&actions, MessageCode::PrePrepare);
        assert_eq!(proposals.len(), 1);
        let preprepare = proposals[0].decode::<Preprepare>().unwrap();
        assert_eq!(preprepare.view, target);
        assert_eq!(preprepare.proposal.hash(), locked.digest);
        assert_eq!(state.pending_requests(), 1);
    }

    #[test]
    fn test_locked_replica_rejects_conflicting_preprepare() {
        let mut state = make_state(2, BftConfig::default());
        let locked = preprepared(&mut state, View::new(0, 1));
        state.state = State::Prepared;

        state.on_view_change_timer().unwrap();
        let target = View::new(1, 1);
        for sender in [0, 3] {
            state
                .on_message(signed(sender, MessageCode::ViewChange, &ViewChangeVote::new(target)))
                .unwrap();
        }
        assert_eq!(state.current_view(), target);
        assert_eq!(state.state(), State::AcceptRequest);

        let conflicting = Preprepare::new(target, proposal(1, Hash::ZERO, b"other"));
        assert!(matches!(
            state.on_message(signed(1, MessageCode::PrePrepare, &conflicting)),
            Err(BftError::InconsistentSubject)
        ));
        assert_eq!(state.state(), State::AcceptRequest);
        assert!(state.round_state().preprepare().is_none());

        let reproposed = Preprepare::new(target, proposal(1, Hash::ZERO, b"tx"));
        assert_eq!(reproposed.proposal.hash(), locked.digest);
        let actions = state
            .on_message(signed(1, MessageCode::PrePrepare, &reproposed))
            .unwrap();
        assert_eq!(broadcasts(&actions, MessageCode::Prepare).len(), 1);
        assert_eq!(state.state(), State::Preprepared);
    }

    #[traced_test]
    #[test]
    fn test_duplicate_request_is_deduplicated() {
        let mut state = make_state(1, BftConfig::default());
        state.on_request(Request::new(b"tx".to_vec())).unwrap();
        let actions = state.on_request(Request::new(b"tx".to_vec())).unwrap();
        assert!(actions.is_empty());
        assert_eq!(state.pending_requests(), 1);
        assert!(logs_contain("Duplicate request ignored"));

        state.on_request(Request::new(b"tx-2".to_vec())).unwrap();
        assert_eq!(state.pending_requests(), 2);
    }

    #[test]
    fn test_view_change_flood_from_one_sender_stays_bounded() {
        let mut state = make_state(2, BftConfig::default());
        for view_number in 1..=10_000 {
            let vote = ViewChangeVote::new(View::new(view_number, 1));
            state
                .on_message(signed(3, MessageCode::ViewChange, &vote))
                .unwrap();
        }
        assert_eq!(state.view_change.tracked_targets(), 1);
        assert_eq!(state.current_view(), View::new(0, 1));
    }

    #[test]
    fn test_view_change_for_later_sequence_is_queued() {
        let mut state = make_state(2, BftConfig::default());
        let err = state
            .on_message(signed(0, MessageCode::ViewChange, &ViewChangeVote::new(View::new(1, 5))))
            .unwrap_err();
        assert!(matches!(err, BftError::FutureMessage));

        let err = state
            .on_message(signed(0, MessageCode::ViewChange, &ViewChangeVote::new(View::new(0, 1))))
            .unwrap_err();
        assert!(matches!(err, BftError::OldMessage));
    }

    #[test]
    fn test_handle_logs_and_swallows_rejections() {
        let mut state = make_state(0, BftConfig::default());
        let subject = Subject::new(View::new(0, 0), Hash::ZERO);
        let actions = state.handle(Event::MessageReceived {
            message: signed(1, MessageCode::Commit, &subject),
        });
        assert!(actions.is_empty());
        assert_eq!(state.stats().rejected_messages, 0);
        assert_eq!(state.take_last_rejection(), None);

        let stranger = Message::encode(MessageCode::Commit, &subject, ValidatorId(7)).unwrap();
        state.handle(Event::MessageReceived { message: stranger });
        assert_eq!(state.stats().rejected_messages, 1);
        assert_eq!(state.take_last_rejection(), Some("unauthorized_address"));
        assert_eq!(state.take_last_rejection(), None);
    }

    #[test]
    fn test_resume_from_recovered_state() {
        let recovered = RecoveredState {
            committed: View::new(2, 41),
            last_digest: Hash::from_bytes(b"41"),
            stable_checkpoint: None,
        };
        let state = BftState::new(BftConfig::default(), backend(3), recovered);
        assert_eq!(state.current_view(), View::new(2, 42));
        assert_eq!(state.last_digest(), Hash::from_bytes(b"41"));
    }
}
