//! Action types for the deterministic state machine.

use crate::{Event, TimerId};
use pbft_messages::Message;
use pbft_types::{Hash, Proposal, Snapshot, StableCheckpoint, View};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are commands. The runner executes them and may convert results
/// back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a signed message to every other validator.
    ///
    /// The transport never loops the message back to the sender.
    Broadcast { message: Message },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// (Re)arm a timer. Replaces any pending timer with the same id.
    SetTimer { id: TimerId, duration: Duration },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Application (background, off the consensus path)
    // ═══════════════════════════════════════════════════════════════════════
    /// Durably apply a decided proposal.
    ///
    /// Applies must be executed in emission order. Failures are reported
    /// out of band and never roll back consensus state.
    CommitProposal { view: View, proposal: Proposal },

    /// Build a checkpoint covering everything up to `view.sequence`.
    ///
    /// Returns `Event::CheckpointBuilt` on success.
    BuildCheckpoint { view: View, digest: Hash },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Persist a frozen round.
    PersistSnapshot { snapshot: Snapshot },

    /// Persist a checkpoint that reached quorum.
    PersistCheckpoint { checkpoint: StableCheckpoint },
}

impl Action {
    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Check if this is a storage write action.
    pub fn is_storage_write(&self) -> bool {
        matches!(
            self,
            Action::PersistSnapshot { .. } | Action::PersistCheckpoint { .. }
        )
    }

    /// Check if this action is delegated to the application.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::CommitProposal { .. } | Action::BuildCheckpoint { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::CommitProposal { .. } => "CommitProposal",
            Action::BuildCheckpoint { .. } => "BuildCheckpoint",
            Action::PersistSnapshot { .. } => "PersistSnapshot",
            Action::PersistCheckpoint { .. } => "PersistCheckpoint",
        }
    }
}
