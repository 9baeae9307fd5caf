use super::{Storage, StorageError};
use crate::domain::{RecordId, StorageRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Non-durable backend. Ids are valid until the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    items: BTreeMap<u64, String>,
    next_id: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, item: &str) -> Result<RecordId, StorageError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.insert(id, item.to_string());
        Ok(RecordId(id))
    }

    fn take_last(&self, count: usize) -> Result<Vec<StorageRecord>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .items
            .iter()
            .take(count)
            .map(|(id, item)| StorageRecord::new(*id, item.as_str()))
            .collect())
    }

    fn delete(&self, ids: &[RecordId]) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        let mut all_found = true;
        for id in ids {
            if inner.items.remove(&id.0).is_none() {
                all_found = false;
            }
        }
        Ok(all_found)
    }

    fn total_items(&self) -> Result<usize, StorageError> {
        Ok(self.inner.lock().items.len())
    }
}
