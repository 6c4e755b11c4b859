use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::caching::{StoredRecord, hashed_path};

use super::{Storage, StorageError};

/// The on-disk form of a record.
///
/// The original key is stored alongside the record, as the file path is only a hash of it.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    key: String,
    record: StoredRecord,
}

/// Keeps one JSON file per record in a directory tree.
///
/// Records live at `<root>/items/aa/bbccdd/eeff...`, a path derived from the SHA-256 hash of
/// the key. Writes go through a temporary file in `<root>/tmp` which is atomically moved into
/// place, so readers never observe partially written records.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Creates a storage rooted at `root`, creating the directory if necessary.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let storage = Self { root: root.into() };
        fs::create_dir_all(storage.items_dir())?;
        fs::create_dir_all(storage.tmp_dir())?;
        Ok(storage)
    }

    /// The directory this storage is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.items_dir().join(hashed_path(key))
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn get_item(&self, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        let path = self.item_path(key);
        tracing::trace!("Reading record from {}", path.display());

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedRecord = serde_json::from_slice(&bytes)?;

        if persisted.key != key {
            tracing::warn!(
                path = %path.display(),
                "Found a record for a different key with the same hash",
            );
            return Ok(None);
        }
        Ok(Some(persisted.record))
    }

    async fn set_item(&self, key: &str, record: StoredRecord) -> Result<(), StorageError> {
        let persisted = PersistedRecord {
            key: key.to_owned(),
            record,
        };
        let bytes = serde_json::to_vec(&persisted)?;

        let path = self.item_path(key);
        let tmp_dir = self.tmp_dir();
        tracing::trace!("Writing record to {}", path.display());

        tokio::task::spawn_blocking(move || persist_record(&tmp_dir, &path, &bytes))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.item_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let root = self.root.clone();
        let items = self.items_dir();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            // Move the whole item tree out of the way in one rename, then delete it at leisure.
            let trash = tempfile::Builder::new()
                .prefix(".clear-")
                .tempdir_in(&root)?;
            match fs::rename(&items, trash.path().join("items")) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            fs::create_dir_all(&items)?;
            trash.close()
        })
        .await
        .map_err(io::Error::other)??;

        tracing::debug!("Cleared filesystem storage at {}", self.root.display());
        Ok(())
    }
}

/// Writes `bytes` to a temp file in `tmp_dir` and moves it to `path`.
fn persist_record(tmp_dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist record"))?;

    // A concurrent `clear` could remove the parent directories we are operating in,
    // so retry the fs operations a couple of times.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        fs::create_dir_all(tmp_dir)?;
        let mut temp_file = NamedTempFile::new_in(tmp_dir)?;
        temp_file.write_all(bytes)?;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create record directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    error = &e.error as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to persist record",
                );
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}
