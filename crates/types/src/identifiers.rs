//! Identifiers: validator identity and the (view number, sequence) pair.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identity of a validator. Messages carry it as the sender address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ValidatorId(pub u64);

impl ValidatorId {
    /// Little-endian bytes, used when signing and hashing.
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validator-{}", self.0)
    }
}

/// A (view number, sequence) pair.
///
/// The view number identifies the proposer epoch, the sequence identifies the
/// slot being decided. Views are ordered by sequence first, then view number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct View {
    /// Proposer epoch. Incremented by view changes.
    pub view_number: u64,
    /// Slot being decided. Incremented by commits.
    pub sequence: u64,
}

impl View {
    /// Create a new view.
    pub const fn new(view_number: u64, sequence: u64) -> Self {
        Self {
            view_number,
            sequence,
        }
    }

    /// Same view number, next sequence.
    pub const fn next_sequence(&self) -> Self {
        Self::new(self.view_number, self.sequence + 1)
    }

    /// Next view number, same sequence.
    pub const fn next_view_number(&self) -> Self {
        Self::new(self.view_number + 1, self.sequence)
    }
}

impl Ord for View {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.view_number.cmp(&other.view_number))
    }
}

impl PartialOrd for View {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(view {}, seq {})", self.view_number, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_orders_by_sequence_first() {
        assert!(View::new(5, 1) < View::new(0, 2));
        assert!(View::new(0, 2) < View::new(1, 2));
        assert_eq!(View::new(3, 3).cmp(&View::new(3, 3)), Ordering::Equal);
    }

    #[test]
    fn test_next_views() {
        let view = View::new(2, 7);
        assert_eq!(view.next_sequence(), View::new(2, 8));
        assert_eq!(view.next_view_number(), View::new(3, 7));
        assert!(view.next_sequence() > view);
        assert!(view.next_view_number() > view);
    }
}
