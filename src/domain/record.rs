use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle issued by a storage backend for one stored item.
///
/// Ids grow monotonically in insertion order for every backend, so sorting by
/// id is sorting by age. An id is only meaningful to the backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A serialized item together with the id its backend assigned.
///
/// `unreadable` is set when the backend found the record but could not read
/// its item back (truncated file, bad encoding); `item` is empty then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    pub id: RecordId,
    pub item: String,
    pub unreadable: Option<String>,
}

impl StorageRecord {
    pub fn new(id: impl Into<RecordId>, item: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item: item.into(),
            unreadable: None,
        }
    }

    pub fn unreadable(id: impl Into<RecordId>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item: String::new(),
            unreadable: Some(reason.into()),
        }
    }

    pub fn is_readable(&self) -> bool {
        self.unreadable.is_none()
    }
}
