//! Key-value persistence for consensus records.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix every consensus key is stored under.
pub const KEY_PREFIX: &str = "pbft_";

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No value stored under the key.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Backend failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored bytes could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Byte-oriented key-value store.
///
/// Keys passed in are unprefixed; implementations store them under
/// [`KEY_PREFIX`].
pub trait Dber: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Load the value under `key`.
    fn restore(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// JSON helpers over any [`Dber`].
pub trait DberExt: Dber {
    /// Store a value as JSON.
    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.save(key, &bytes)
    }

    /// Load a JSON value.
    fn restore_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
        let bytes = self.restore(key)?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

impl<D: Dber + ?Sized> DberExt for D {}

/// Full storage key for an unprefixed key.
pub fn prefixed(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// In-memory store for simulation and tests.
#[derive(Debug, Default)]
pub struct MemoryDb {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Dber for MemoryDb {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().insert(prefixed(key), value.to_vec());
        Ok(())
    }

    fn restore(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.entries
            .read()
            .get(&prefixed(key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        sequence: u64,
        label: String,
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let db = MemoryDb::new();
        assert!(matches!(db.restore("head"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_json_helpers() {
        let db = MemoryDb::new();
        let record = Record {
            sequence: 7,
            label: "seven".into(),
        };
        db.save_json("record", &record).unwrap();

        let restored: Record = db.restore_json("record").unwrap();
        assert_eq!(restored, record);
        assert!(db.entries.read().contains_key("pbft_record"));
    }

    #[test]
    fn test_bad_json_is_serialization_error() {
        let db = MemoryDb::new();
        db.save("record", b"not json").unwrap();
        assert!(matches!(
            db.restore_json::<Record>("record"),
            Err(StorageError::Serialization(_))
        ));
    }
}
