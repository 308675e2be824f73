//! Ordering key for the global event queue.

use crate::NodeIndex;
use pbft_core::{Event, EventPriority};
use std::time::Duration;

/// Key ordering events by time, then priority, then node, then insertion.
///
/// The insertion sequence makes every key unique, so equal-time events are
/// still processed in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }
}
