//! RocksDB blob store.
//!
//! Same bytes as the filesystem backend, keyed by the structured storage
//! key (`registry`, `bulletins`, `list/<uuid>`). A RocksDB `put` is an
//! atomic replacement, which is all the persistence contract asks for.

use std::path::PathBuf;

use rocksdb::{Direction, IteratorMode, Options, DB};
use uuid::Uuid;

use tandem_core::DocKey;

use super::{BlobStore, StoreError};

const LIST_PREFIX: &str = "list/";

/// Blob store backed by a RocksDB database.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open (creating the database as needed).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.into()).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl BlobStore for RocksStore {
    fn read(&self, key: &DocKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key.storage_key().as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn write(&self, key: &DocKey, bytes: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(key.storage_key().as_bytes(), bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn delete(&self, key: &DocKey) -> Result<(), StoreError> {
        self.db
            .delete(key.storage_key().as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn list_lists(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(LIST_PREFIX.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let Ok(key) = std::str::from_utf8(&key) else {
                continue;
            };
            let Some(id) = key.strip_prefix(LIST_PREFIX) else {
                break; // Past the list keyspace.
            };
            if let Ok(id) = Uuid::parse_str(id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
