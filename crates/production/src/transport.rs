//! In-process transport connecting runners through tokio channels.
//!
//! Every validator joins a [`LocalHub`] and gets a [`LocalTransport`] for
//! broadcasting plus the receiving end of its inbound channel. Delivery is
//! best-effort: a full or closed peer channel drops the payload, which the
//! consensus core tolerates like any lossy network.

use parking_lot::RwLock;
use pbft_core::{Transport, TransportError};
use pbft_types::ValidatorId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

type Peers = BTreeMap<ValidatorId, mpsc::Sender<Vec<u8>>>;

/// Registry of the inbound channels of all local validators.
#[derive(Clone, Default)]
pub struct LocalHub {
    peers: Arc<RwLock<Peers>>,
}

impl LocalHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as `id`.
    ///
    /// Replaces a previous registration under the same id.
    pub fn join(
        &self,
        id: ValidatorId,
        capacity: usize,
    ) -> (LocalTransport, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.peers.write().insert(id, tx);
        let transport = LocalTransport {
            local: id,
            peers: self.peers.clone(),
        };
        (transport, rx)
    }

    /// Remove `id` from the hub. Its inbound channel closes once all
    /// in-flight sends complete.
    pub fn leave(&self, id: ValidatorId) {
        self.peers.write().remove(&id);
    }

    /// Number of joined validators.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no validator has joined.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

/// Broadcasts to every other validator on the hub.
pub struct LocalTransport {
    local: ValidatorId,
    peers: Arc<RwLock<Peers>>,
}

impl Transport for LocalTransport {
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let peers = self.peers.read();
        if !peers.contains_key(&self.local) {
            return Err(TransportError::Closed);
        }
        for (&to, tx) in peers.iter() {
            if to == self.local {
                continue;
            }
            if let Err(e) = tx.try_send(payload.clone()) {
                trace!(from = %self.local, %to, error = %e, "Dropped payload");
            }
        }
        Ok(())
    }
}
