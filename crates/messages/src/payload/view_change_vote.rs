//! ViewChange message body.

use pbft_types::View;
use serde::{Deserialize, Serialize};

/// Vote to move to `target`. 2F+1 votes for the same target move every
/// honest validator to that view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeVote {
    /// View the sender wants to move to: a higher view number at the sequence
    /// still being decided.
    pub target: View,
}

impl ViewChangeVote {
    /// Create a new view change vote.
    pub fn new(target: View) -> Self {
        Self { target }
    }
}
