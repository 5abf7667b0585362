//! Opaque byte-blob persistence.
//!
//! Documents persist as whole CRDT saves keyed by document identity:
//!
//! ```text
//! registry      — the list index
//! bulletins     — the bulletin board
//! list/<uuid>   — one blob per list
//! ```
//!
//! Both backends guarantee atomic replacement: no reader and no crash
//! observes a torn blob. The filesystem backend writes a unique temp
//! sibling then renames over the target; RocksDB point writes are atomic
//! by construction.

pub mod fs;
pub mod rocks;

use thiserror::Error;
use uuid::Uuid;

use tandem_core::DocKey;

pub use fs::FsStore;
pub use rocks::RocksStore;

/// Storage failure. Flush keeps the document dirty and retries later.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Byte-blob storage keyed by document identity.
pub trait BlobStore: Send + Sync {
    /// Read a blob; `None` when the key has never been written.
    fn read(&self, key: &DocKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replace a blob.
    fn write(&self, key: &DocKey, bytes: &[u8]) -> Result<(), StoreError>;

    /// Remove a blob. Removing an absent key is not an error.
    fn delete(&self, key: &DocKey) -> Result<(), StoreError>;

    /// Enumerate the list ids with a persisted blob.
    fn list_lists(&self) -> Result<Vec<Uuid>, StoreError>;
}
