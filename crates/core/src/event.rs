//! Event types for the deterministic state machine.

use pbft_messages::Message;
use pbft_types::{Hash, Request, View};

/// Priority levels for event ordering within the same timestamp.
///
/// Lower values are processed first, so consequences of an event are handled
/// before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing.
    Internal = 0,

    /// Scheduled by the node itself.
    Timer = 1,

    /// Inputs from other validators.
    Network = 2,

    /// Inputs from clients.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are passive data. The state machine processes them and returns
/// actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Client (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client request to be ordered.
    RequestReceived { request: Request },

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A decoded consensus message from another validator.
    ///
    /// Sender identity is `message.sender`, authenticated by its signature.
    MessageReceived { message: Message },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The round made no progress before the view-change timeout.
    ViewChangeTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// A previously queued message that became ready after a state change.
    ///
    /// Signature and membership were checked when it was first received.
    BacklogMessage { message: Message },

    /// The application finished building a checkpoint.
    ///
    /// Callback from `Action::BuildCheckpoint`. Only emitted on success.
    CheckpointBuilt { view: View, digest: Hash },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::BacklogMessage { .. } | Event::CheckpointBuilt { .. } => {
                EventPriority::Internal
            }
            Event::ViewChangeTimer => EventPriority::Timer,
            Event::MessageReceived { .. } => EventPriority::Network,
            Event::RequestReceived { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another node).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::RequestReceived { .. } => "RequestReceived",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::ViewChangeTimer => "ViewChangeTimer",
            Event::BacklogMessage { .. } => "BacklogMessage",
            Event::CheckpointBuilt { .. } => "CheckpointBuilt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_events_sort_first() {
        let internal = Event::CheckpointBuilt {
            view: View::default(),
            digest: Hash::ZERO,
        };
        let client = Event::RequestReceived {
            request: Request::new(vec![1]),
        };
        assert!(internal.priority() < Event::ViewChangeTimer.priority());
        assert!(Event::ViewChangeTimer.priority() < client.priority());
        assert!(internal.is_internal());
        assert!(!client.is_network());
    }
}
