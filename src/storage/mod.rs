//! Durable append log of serialized events.
//!
//! Every backend implements the "peek + explicit delete" contract: `take_last`
//! never removes anything, deletion is a separate call by id. Items surface
//! oldest-first.

pub mod memory;
#[cfg(feature = "sled-storage")]
pub mod sled_store;
pub mod spool;

pub use memory::MemoryStorage;
#[cfg(feature = "sled-storage")]
pub use sled_store::SledStorage;
pub use spool::{SpoolConfig, SpoolStorage};

use crate::domain::{RecordId, StorageRecord};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "sled-storage")]
    #[error("Embedded database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::error::EncodeError),
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] bincode::error::DecodeError),
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: u64, reason: String },
    #[error("Disk space exceeded")]
    DiskSpaceExceeded,
    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("System time error: {0}")]
    SystemTimeError(String),
}

/// Backend-agnostic storage contract consumed by the blocking queue.
#[cfg_attr(test, automock)]
pub trait Storage: Send + Sync {
    /// Appends one item. Durable backends must not lose it once this returns.
    fn put(&self, item: &str) -> Result<RecordId, StorageError>;

    /// Returns up to `count` of the oldest items, oldest first, without removing them.
    ///
    /// An item the backend cannot read back is returned as
    /// [`StorageRecord::unreadable`] under its own id instead of failing the call.
    fn take_last(&self, count: usize) -> Result<Vec<StorageRecord>, StorageError>;

    /// Deletes by id. Returns false if any id was unknown; known ids are still deleted.
    fn delete(&self, ids: &[RecordId]) -> Result<bool, StorageError>;

    fn total_items(&self) -> Result<usize, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process only, lost on restart
    Memory,
    /// Embedded sled database file
    #[default]
    Sled,
    /// Directory spool, one transactional message file per event
    Spool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
    pub max_disk_usage: u64, // bytes, spool only
    pub compression: bool,   // spool only
    /// Spool messages older than this are deleted at open; `None` keeps everything
    pub retention: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: PathBuf::from("/tmp/snowplow-emitter/queue"),
            max_disk_usage: 1024 * 1024 * 1024, // 1GB
            compression: false,
            retention: None,
        }
    }
}

/// Opens the backend selected by `config`. Open failures are fatal to the caller.
pub fn open(config: &StorageConfig) -> Result<Box<dyn Storage>, StorageError> {
    let storage: Box<dyn Storage> = match config.backend {
        StorageBackend::Memory => Box::new(MemoryStorage::new()),
        StorageBackend::Sled => open_sled(config)?,
        StorageBackend::Spool => {
            let spool = SpoolStorage::open(SpoolConfig {
                storage_path: config.path.clone(),
                max_disk_usage: config.max_disk_usage,
                compression: config.compression,
            })?;
            if let Some(retention) = config.retention {
                spool.cleanup_expired(retention)?;
            }
            Box::new(spool)
        }
    };

    tracing::info!(
        backend = ?config.backend,
        path = %config.path.display(),
        items = storage.total_items()?,
        "Opened event storage"
    );
    Ok(storage)
}

#[cfg(feature = "sled-storage")]
fn open_sled(config: &StorageConfig) -> Result<Box<dyn Storage>, StorageError> {
    Ok(Box::new(SledStorage::open(&config.path)?))
}

#[cfg(not(feature = "sled-storage"))]
fn open_sled(_config: &StorageConfig) -> Result<Box<dyn Storage>, StorageError> {
    Err(StorageError::BackendUnavailable(
        "built without the sled-storage feature".to_string(),
    ))
}
