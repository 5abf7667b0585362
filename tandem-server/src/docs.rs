//! Live document cache with dirty tracking.
//!
//! At most one [`DocHandle`] exists per document key. Handles are
//! shallow clones of the cached document, so every caller mutates the
//! same authoritative state. A dirty set records which documents have
//! advanced past the last flush; the flush timer and the shutdown hook
//! drain it through the store's atomic writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use tandem_core::{DocError, DocHandle, DocKey};

use crate::storage::{BlobStore, StoreError};

/// Failure while materializing a document.
#[derive(Debug, Error)]
pub enum DocsError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Doc(#[from] DocError),
}

/// Owner of all live documents.
pub struct DocumentRegistry {
    store: Arc<dyn BlobStore>,
    cache: HashMap<DocKey, DocHandle>,
    dirty: HashSet<DocKey>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// The cached handle, or load from storage, or initialize an empty
    /// document of the right shape.
    pub fn get_or_load(&mut self, key: DocKey) -> Result<DocHandle, DocsError> {
        if let Some(doc) = self.cache.get(&key) {
            return Ok(doc.clone());
        }
        let doc = match self.store.read(&key)? {
            Some(bytes) => match key {
                DocKey::Registry => DocHandle::load_registry(&bytes)?,
                DocKey::Bulletins => DocHandle::load_bulletins(&bytes)?,
                DocKey::List(id) => DocHandle::load_list(id, &bytes)?,
            },
            None => match key {
                DocKey::Registry => DocHandle::new_registry(),
                DocKey::Bulletins => DocHandle::new_bulletins(),
                DocKey::List(id) => DocHandle::new_list(id),
            },
        };
        self.cache.insert(key, doc.clone());
        Ok(doc)
    }

    /// The cached handle without touching storage.
    pub fn cached(&self, key: &DocKey) -> Option<DocHandle> {
        self.cache.get(key).cloned()
    }

    /// Create and cache the empty document for a fresh list, already
    /// marked dirty so the first flush persists it.
    pub fn create_list(&mut self, id: Uuid) -> DocHandle {
        let key = DocKey::List(id);
        let doc = DocHandle::new_list(id);
        self.cache.insert(key, doc.clone());
        self.dirty.insert(key);
        doc
    }

    /// Record that a document's in-memory state advanced past the last
    /// flush.
    pub fn mark_dirty(&mut self, key: DocKey) {
        self.dirty.insert(key);
    }

    /// Drop cache entry and dirty bit without writing. Used on delete.
    pub fn forget(&mut self, key: &DocKey) {
        self.cache.remove(key);
        self.dirty.remove(key);
    }

    /// Number of documents awaiting flush.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Serialize and write every dirty document. A bit is cleared only
    /// after its write succeeds; failed writes are logged and retried
    /// on the next flush. Returns how many blobs were written.
    pub fn flush_all(&mut self) -> usize {
        let keys: Vec<DocKey> = self.dirty.iter().copied().collect();
        let mut flushed = 0;
        for key in keys {
            let Some(doc) = self.cache.get(&key) else {
                self.dirty.remove(&key);
                continue;
            };
            let bytes = doc.save();
            match self.store.write(&key, &bytes) {
                Ok(()) => {
                    self.dirty.remove(&key);
                    flushed += 1;
                }
                Err(e) => {
                    log::warn!("flush of {key} failed, will retry: {e}");
                }
            }
        }
        flushed
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }
}
