//! State machine and collaborator traits.

use crate::{Action, Event};
use pbft_types::{Hash, Proposal, View};
use std::time::Duration;
use thiserror::Error;

/// A synchronous, deterministic state machine.
///
/// `handle` must not perform I/O. All effects are returned as actions.
pub trait StateMachine {
    /// Process one event and return the resulting actions.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Update the state machine's view of the current time.
    fn set_time(&mut self, now: Duration);

    /// Current time as last set by the runner.
    fn now(&self) -> Duration;
}

/// Errors from broadcasting a payload.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Broadcast channel to every other validator.
///
/// Delivery may be unreliable and reordered. The consensus core tolerates
/// both.
pub trait Transport: Send + Sync {
    /// Send an encoded message to all other validators.
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Errors from applying decided proposals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("apply of sequence {sequence} failed: {reason}")]
    Commit { sequence: u64, reason: String },

    #[error("checkpoint at {view} failed: {reason}")]
    Checkpoint { view: View, reason: String },
}

/// The replicated application.
///
/// Called off the consensus path. Commits arrive in strictly increasing
/// sequence order.
pub trait Application: Send + Sync {
    /// Durably apply a decided proposal.
    fn commit(&self, view: View, proposal: &Proposal) -> Result<(), ApplyError>;

    /// Build a checkpoint of all state up to and including `view.sequence`.
    fn build_checkpoint(&self, view: View, digest: Hash) -> Result<(), ApplyError>;
}
