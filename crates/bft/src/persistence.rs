//! Durable records of committed rounds and stable checkpoints.
//!
//! Layout (all keys carry the store's `pbft_` prefix):
//!
//! | Key                     | Value                              |
//! |-------------------------|------------------------------------|
//! | `snapshot_<sequence>`   | [`Snapshot`] as JSON               |
//! | `head`                  | [`Subject`] of the last commit     |
//! | `checkpoint`            | latest [`StableCheckpoint`]        |

use pbft_core::{Dber, DberExt, StorageError};
use pbft_types::{Hash, Snapshot, StableCheckpoint, Subject, View};
use tracing::{debug, info};

const HEAD_KEY: &str = "head";
const CHECKPOINT_KEY: &str = "checkpoint";

fn snapshot_key(sequence: u64) -> String {
    format!("snapshot_{sequence:020}")
}

/// State recovered from storage on startup.
///
/// Passed to `BftState::new()`. For a fresh start use `RecoveredState::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredState {
    /// View of the last committed proposal (`View::default()` if none).
    pub committed: View,

    /// Digest of the last committed proposal ([`Hash::ZERO`] if none).
    pub last_digest: Hash,

    /// Latest stable checkpoint.
    pub stable_checkpoint: Option<StableCheckpoint>,
}

/// Store a committed round and advance the head.
pub fn persist_snapshot(db: &dyn Dber, snapshot: &Snapshot) -> Result<(), StorageError> {
    db.save_json(&snapshot_key(snapshot.sequence()), snapshot)?;
    db.save_json(HEAD_KEY, &snapshot.subject())?;
    debug!(sequence = snapshot.sequence(), "Persisted snapshot");
    Ok(())
}

/// Store the latest stable checkpoint.
pub fn persist_checkpoint(db: &dyn Dber, checkpoint: &StableCheckpoint) -> Result<(), StorageError> {
    db.save_json(CHECKPOINT_KEY, checkpoint)
}

/// Load the round that decided `sequence`.
pub fn load_snapshot(db: &dyn Dber, sequence: u64) -> Result<Snapshot, StorageError> {
    db.restore_json(&snapshot_key(sequence))
}

fn optional<T>(result: Result<T, StorageError>) -> Result<Option<T>, StorageError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Rebuild the resume point from storage. Missing records mean a fresh start.
pub fn load_recovered_state(db: &dyn Dber) -> Result<RecoveredState, StorageError> {
    let head: Option<Subject> = optional(db.restore_json(HEAD_KEY))?;
    let stable_checkpoint = optional(db.restore_json(CHECKPOINT_KEY))?;

    let recovered = match head {
        Some(head) => RecoveredState {
            committed: head.view,
            last_digest: head.digest,
            stable_checkpoint,
        },
        None => RecoveredState {
            stable_checkpoint,
            ..RecoveredState::default()
        },
    };
    info!(
        committed = %recovered.committed,
        has_checkpoint = recovered.stable_checkpoint.is_some(),
        "Loaded recovered state"
    );
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_core::MemoryDb;
    use pbft_types::test_utils::test_proposal;
    use pbft_types::ValidatorId;

    struct BrokenDb;

    impl Dber for BrokenDb {
        fn save(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Database("disk full".into()))
        }

        fn restore(&self, _key: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::Database("io error".into()))
        }
    }

    fn snapshot(sequence: u64) -> Snapshot {
        Snapshot {
            view: View::new(1, sequence),
            proposal: test_proposal(sequence, 4),
            prepares: vec![ValidatorId(0), ValidatorId(1), ValidatorId(2)],
            commits: vec![ValidatorId(0), ValidatorId(1), ValidatorId(3)],
        }
    }

    #[test]
    fn test_fresh_store_recovers_default() {
        let db = MemoryDb::new();
        assert_eq!(load_recovered_state(&db).unwrap(), RecoveredState::default());
    }

    #[test]
    fn test_recover_head_and_checkpoint() {
        let db = MemoryDb::new();
        persist_snapshot(&db, &snapshot(1)).unwrap();
        persist_snapshot(&db, &snapshot(2)).unwrap();
        let checkpoint = StableCheckpoint {
            view: View::new(1, 2),
            digest: snapshot(2).digest(),
            signers: vec![ValidatorId(0), ValidatorId(1), ValidatorId(2)],
        };
        persist_checkpoint(&db, &checkpoint).unwrap();

        let recovered = load_recovered_state(&db).unwrap();
        assert_eq!(recovered.committed, View::new(1, 2));
        assert_eq!(recovered.last_digest, snapshot(2).digest());
        assert_eq!(recovered.stable_checkpoint, Some(checkpoint));
        assert_eq!(load_snapshot(&db, 1).unwrap(), snapshot(1));
    }

    #[test]
    fn test_storage_errors_propagate() {
        assert!(matches!(
            persist_snapshot(&BrokenDb, &snapshot(1)),
            Err(StorageError::Database(_))
        ));
        assert!(matches!(
            load_recovered_state(&BrokenDb),
            Err(StorageError::Database(_))
        ));
    }
}
