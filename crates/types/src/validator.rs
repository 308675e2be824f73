//! Validator set: ordered membership, quorum arithmetic and proposer selection.

use crate::{ValidatorId, View};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rule selecting the proposer of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposerPolicy {
    /// `validators[view_number % N]`. The proposer only changes on view change.
    #[default]
    RoundRobin,
    /// `validators[(view_number + sequence) % N]`. Rotates every sequence.
    Rotating,
}

/// Errors building a validator set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorSetError {
    /// No validators.
    #[error("validator set is empty")]
    Empty,

    /// The same validator appears twice.
    #[error("duplicate validator {0}")]
    Duplicate(ValidatorId),

    /// Fault tolerance larger than N can support (N >= 3F+1).
    #[error("cannot tolerate {faulty} faults with {size} validators")]
    TooManyFaulty { faulty: usize, size: usize },
}

/// Ordered, immutable membership for one or more views.
///
/// A new set is only picked up when a new round starts, so membership never
/// changes in the middle of a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<ValidatorId>,
    policy: ProposerPolicy,
    max_faulty: usize,
}

impl ValidatorSet {
    /// Create a validator set with F = ceil(N/3) - 1.
    pub fn new(
        validators: Vec<ValidatorId>,
        policy: ProposerPolicy,
    ) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut seen = HashSet::with_capacity(validators.len());
        for id in &validators {
            if !seen.insert(*id) {
                return Err(ValidatorSetError::Duplicate(*id));
            }
        }
        let max_faulty = Self::default_max_faulty(validators.len());
        Ok(Self {
            validators,
            policy,
            max_faulty,
        })
    }

    /// Override the tolerated fault count.
    pub fn with_max_faulty(mut self, faulty: usize) -> Result<Self, ValidatorSetError> {
        if 3 * faulty + 1 > self.size() {
            return Err(ValidatorSetError::TooManyFaulty {
                faulty,
                size: self.size(),
            });
        }
        self.max_faulty = faulty;
        Ok(self)
    }

    /// ceil(N/3) - 1.
    pub fn default_max_faulty(size: usize) -> usize {
        size.div_ceil(3).saturating_sub(1)
    }

    /// Number of validators (N).
    pub fn size(&self) -> usize {
        self.validators.len()
    }

    /// Tolerated Byzantine validators (F).
    pub fn f(&self) -> usize {
        self.max_faulty
    }

    /// Votes needed for a quorum (2F+1).
    pub fn quorum(&self) -> usize {
        2 * self.max_faulty + 1
    }

    /// The proposer selection rule.
    pub fn policy(&self) -> ProposerPolicy {
        self.policy
    }

    /// Proposer for a view.
    pub fn proposer_for(&self, view: &View) -> ValidatorId {
        let n = self.validators.len() as u64;
        let index = match self.policy {
            ProposerPolicy::RoundRobin => view.view_number % n,
            ProposerPolicy::Rotating => view.view_number.wrapping_add(view.sequence) % n,
        };
        self.validators[index as usize]
    }

    /// Position of a validator in the ordering.
    pub fn index_of(&self, id: ValidatorId) -> Option<usize> {
        self.validators.iter().position(|v| *v == id)
    }

    /// Whether the validator is a member.
    pub fn is_member(&self, id: ValidatorId) -> bool {
        self.index_of(id).is_some()
    }

    /// Validator at a position.
    pub fn get_by_index(&self, index: usize) -> Option<ValidatorId> {
        self.validators.get(index).copied()
    }

    /// Members in order.
    pub fn validators(&self) -> &[ValidatorId] {
        &self.validators
    }

    /// Iterate members in order.
    pub fn iter(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.validators.iter().copied()
    }
}
