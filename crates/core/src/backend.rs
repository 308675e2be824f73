//! Identity, membership and cryptography capabilities.

use parking_lot::RwLock;
use pbft_types::{Hash, ValidatorId, ValidatorSet, View};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the consensus core needs to know about itself and its peers.
///
/// Implementations must be pure with respect to the arguments: the same input
/// always yields the same output.
pub trait Backend: Send + Sync {
    /// This validator's identity.
    fn address(&self) -> ValidatorId;

    /// Current validator set.
    ///
    /// Read once per round. A changed set takes effect at the next round.
    fn validators(&self) -> Arc<ValidatorSet>;

    /// Whether this validator proposes in `view`.
    fn is_proposer(&self, view: &View) -> bool {
        self.validators().proposer_for(view) == self.address()
    }

    /// Hash a payload.
    fn hash(&self, data: &[u8]) -> Hash {
        Hash::from_bytes(data)
    }

    /// Sign bytes as this validator.
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Check that `signature` was made by `sender` over `data`.
    fn verify(&self, sender: ValidatorId, data: &[u8], signature: &[u8]) -> bool;
}

/// A backend with a fixed key table.
///
/// Signatures are blake3 keyed MACs under a per-validator secret, in the
/// style of PBFT MAC authenticators. Every holder of the table can verify
/// every validator.
pub struct StaticBackend {
    address: ValidatorId,
    validators: RwLock<Arc<ValidatorSet>>,
    keys: BTreeMap<ValidatorId, [u8; 32]>,
}

impl StaticBackend {
    /// Create a backend from an explicit key table.
    pub fn new(
        address: ValidatorId,
        validators: ValidatorSet,
        keys: BTreeMap<ValidatorId, [u8; 32]>,
    ) -> Self {
        Self {
            address,
            validators: RwLock::new(Arc::new(validators)),
            keys,
        }
    }

    /// Create a backend whose keys are derived from validator ids.
    ///
    /// Anyone can forge signatures. Only for tests and local clusters.
    pub fn insecure_for_testing(address: ValidatorId, validators: ValidatorSet) -> Self {
        let keys = validators
            .iter()
            .map(|id| (id, Self::derive_key(id)))
            .collect();
        Self::new(address, validators, keys)
    }

    fn derive_key(id: ValidatorId) -> [u8; 32] {
        blake3::derive_key("pbft static backend v1", &id.to_le_bytes())
    }

    /// Replace the validator set. Rounds already in progress keep the old set.
    pub fn set_validators(&self, validators: ValidatorSet) {
        debug!(
            validator = %self.address,
            size = validators.size(),
            quorum = validators.quorum(),
            "Validator set replaced"
        );
        *self.validators.write() = Arc::new(validators);
    }

    fn mac(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
        *blake3::keyed_hash(key, data).as_bytes()
    }
}

impl Backend for StaticBackend {
    fn address(&self) -> ValidatorId {
        self.address
    }

    fn validators(&self) -> Arc<ValidatorSet> {
        self.validators.read().clone()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self.keys.get(&self.address) {
            Some(key) => Self::mac(key, data).to_vec(),
            None => {
                warn!(validator = %self.address, "No signing key, message goes out unsigned");
                Vec::new()
            }
        }
    }

    fn verify(&self, sender: ValidatorId, data: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.keys.get(&sender) else {
            debug!(%sender, "No verification key for sender");
            return false;
        };
        Self::mac(key, data).as_slice() == signature
    }
}
