//! Append-only history of decided rounds.

use parking_lot::RwLock;
use pbft_types::Snapshot;
use std::sync::Arc;

/// Committed rounds in sequence order.
///
/// The state machine is the only writer. Clones share the same history, so
/// operational tooling can hold a read handle while consensus appends.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHistory {
    inner: Arc<RwLock<Vec<Snapshot>>>,
}

impl SnapshotHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, snapshot: Snapshot) {
        self.inner.write().push(snapshot);
    }

    /// Number of recorded rounds.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Most recent round.
    pub fn last(&self) -> Option<Snapshot> {
        self.inner.read().last().cloned()
    }

    /// Round that decided `sequence`.
    pub fn get(&self, sequence: u64) -> Option<Snapshot> {
        let history = self.inner.read();
        history
            .binary_search_by_key(&sequence, Snapshot::sequence)
            .ok()
            .map(|i| history[i].clone())
    }

    /// Copy of the whole history.
    pub fn to_vec(&self) -> Vec<Snapshot> {
        self.inner.read().clone()
    }
}
