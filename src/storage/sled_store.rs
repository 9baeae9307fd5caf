use super::{Storage, StorageError};
use crate::domain::{RecordId, StorageRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const EVENTS_TREE: &str = "events";

/// Embedded database backend.
///
/// Keys are big-endian ids from `Db::generate_id`, which stays monotonic across
/// restarts, so tree order is insertion order. Every mutation is flushed before
/// returning.
pub struct SledStorage {
    db: sled::Db,
    tree: sled::Tree,
    count: AtomicUsize,
    path: PathBuf,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let tree = db.open_tree(EVENTS_TREE)?;
        // len() walks the tree; only done once at open
        let count = AtomicUsize::new(tree.len());

        tracing::debug!(
            "Opened sled storage at {} ({} items)",
            path.display(),
            count.load(Ordering::Relaxed)
        );

        Ok(Self {
            db,
            tree,
            count,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode_key(key: &[u8]) -> Result<u64, StorageError> {
        let bytes: [u8; 8] = key.try_into().map_err(|_| StorageError::CorruptRecord {
            id: 0,
            reason: format!("key has {} bytes, expected 8", key.len()),
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl Storage for SledStorage {
    fn put(&self, item: &str) -> Result<RecordId, StorageError> {
        let id = self.db.generate_id()?;
        self.tree.insert(id.to_be_bytes(), item.as_bytes())?;
        self.tree.flush()?;
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(RecordId(id))
    }

    fn take_last(&self, count: usize) -> Result<Vec<StorageRecord>, StorageError> {
        let mut records = Vec::with_capacity(count.min(1024));
        for entry in self.tree.iter().take(count) {
            let (key, value) = entry?;
            let id = Self::decode_key(&key)?;
            match String::from_utf8(value.to_vec()) {
                Ok(item) => records.push(StorageRecord::new(id, item)),
                Err(e) => {
                    tracing::warn!("Stored item {id} is not valid UTF-8");
                    records.push(StorageRecord::unreadable(
                        id,
                        format!("item is not valid UTF-8: {e}"),
                    ));
                }
            }
        }
        Ok(records)
    }

    fn delete(&self, ids: &[RecordId]) -> Result<bool, StorageError> {
        let mut all_found = true;
        for id in ids {
            if self.tree.remove(id.0.to_be_bytes())?.is_some() {
                self.count.fetch_sub(1, Ordering::AcqRel);
            } else {
                all_found = false;
            }
        }
        self.tree.flush()?;
        Ok(all_found)
    }

    fn total_items(&self) -> Result<usize, StorageError> {
        Ok(self.count.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for SledStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStorage")
            .field("path", &self.path)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}
