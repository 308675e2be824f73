//! Per-sender queue of messages that arrived too early.

use crate::State;
use pbft_messages::{Message, MessageCode};
use pbft_types::{ValidatorId, View};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Ordering key within one sender's queue: view first, then arrival.
type EntryKey = (View, u64);

/// Messages waiting for the local view or phase to catch up.
///
/// Each sender has its own bounded queue ordered by `(view, arrival)`.
/// Entries behind the current view are discarded when encountered.
#[derive(Debug)]
pub struct Backlog {
    queues: BTreeMap<ValidatorId, BTreeMap<EntryKey, Message>>,
    capacity_per_sender: usize,
    next_arrival: u64,
    evicted: u64,
}

impl Backlog {
    /// Create an empty backlog.
    pub fn new(capacity_per_sender: usize) -> Self {
        Self {
            queues: BTreeMap::new(),
            capacity_per_sender: capacity_per_sender.max(1),
            next_arrival: 0,
            evicted: 0,
        }
    }

    /// Queue a message under `view`.
    ///
    /// When the sender's queue is full the entry furthest in the future makes
    /// room for an earlier newcomer; otherwise the newcomer is dropped.
    /// Returns whether the message was queued.
    pub fn push(&mut self, view: View, message: Message) -> bool {
        let key = (view, self.next_arrival);
        self.next_arrival += 1;

        let sender = message.sender;
        let queue = self.queues.entry(sender).or_default();
        if queue.len() >= self.capacity_per_sender {
            let furthest = queue.keys().next_back().copied();
            match furthest {
                Some(last) if key.0 < last.0 => {
                    queue.remove(&last);
                    self.evicted += 1;
                    debug!(%sender, evicted = %last.0, "Backlog full, evicted furthest entry");
                }
                _ => {
                    self.evicted += 1;
                    debug!(%sender, %view, "Backlog full, dropped message");
                    return false;
                }
            }
        }
        trace!(%sender, %view, code = message.code.type_name(), "Queued future message");
        queue.insert(key, message);
        true
    }

    /// Remove and return the next message that can be processed now.
    ///
    /// Senders are visited in id order. Within a sender the lowest
    /// `(view, arrival)` ready entry wins; stale entries met on the way are
    /// dropped.
    pub fn pop_ready(&mut self, current: View, state: State) -> Option<Message> {
        let mut popped = None;
        for queue in self.queues.values_mut() {
            let mut stale = Vec::new();
            let mut ready = None;
            for (key, message) in queue.iter() {
                if is_stale(message.code, key.0, current) {
                    stale.push(*key);
                } else if is_ready(message.code, key.0, current, state) {
                    ready = Some(*key);
                    break;
                }
            }
            for key in stale {
                queue.remove(&key);
            }
            if let Some(key) = ready {
                popped = queue.remove(&key);
                break;
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        popped
    }

    /// Pop every message that is ready for `(current, state)`.
    pub fn drain_ready(&mut self, current: View, state: State) -> Vec<Message> {
        let mut ready = Vec::new();
        while let Some(message) = self.pop_ready(current, state) {
            ready.push(message);
        }
        ready
    }

    /// Total queued messages.
    pub fn len(&self) -> usize {
        self.queues.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queued messages from one sender.
    pub fn len_for(&self, sender: ValidatorId) -> usize {
        self.queues.get(&sender).map_or(0, BTreeMap::len)
    }

    /// Messages dropped or evicted because a queue was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

fn is_stale(code: MessageCode, view: View, current: View) -> bool {
    match code {
        MessageCode::ViewChange => view <= current,
        MessageCode::Checkpoint => false,
        _ => view < current,
    }
}

fn is_ready(code: MessageCode, view: View, current: View, state: State) -> bool {
    match code {
        MessageCode::PrePrepare => view == current,
        MessageCode::Prepare | MessageCode::Commit => {
            view == current && state != State::AcceptRequest
        }
        MessageCode::ViewChange => view.sequence == current.sequence && view > current,
        MessageCode::Checkpoint => view.sequence < current.sequence,
    }
}
