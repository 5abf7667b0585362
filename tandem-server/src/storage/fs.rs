//! Filesystem blob store.
//!
//! Layout under the data directory:
//!
//! ```text
//! data/registry.bin
//! data/bulletins.bin
//! data/lists/<uuid>.bin
//! ```
//!
//! Writes go to a uniquely named temp sibling, fsync, then rename over
//! the target, so a concurrent reader or a crash mid-write only ever
//! sees the previous complete blob.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use tandem_core::DocKey;

use super::{BlobStore, StoreError};

const LISTS_DIR: &str = "lists";
const BLOB_EXT: &str = "bin";

/// Blob store rooted at a data directory.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating directories as needed).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(LISTS_DIR))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &DocKey) -> PathBuf {
        match key {
            DocKey::Registry => self.root.join("registry.bin"),
            DocKey::Bulletins => self.root.join("bulletins.bin"),
            DocKey::List(id) => self
                .root
                .join(LISTS_DIR)
                .join(format!("{id}.{BLOB_EXT}")),
        }
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("blob path {path:?} has no parent")))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob");
        // Unique per writer so concurrent flushes never collide.
        let tmp = parent.join(format!("{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let result = (|| -> Result<(), StoreError> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl BlobStore for FsStore {
    fn read(&self, key: &DocKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &DocKey, bytes: &[u8]) -> Result<(), StoreError> {
        Self::write_atomic(&self.path_for(key), bytes)
    }

    fn delete(&self, key: &DocKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_lists(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(LISTS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
