use super::{Storage, StorageError};
use crate::domain::{RecordId, StorageRecord};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MESSAGE_EXTENSION: &str = "msg";
const PENDING_EXTENSION: &str = "tmp";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub storage_path: PathBuf,
    pub max_disk_usage: u64, // bytes
    pub compression: bool,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("/tmp/snowplow-emitter/spool"),
            max_disk_usage: 1024 * 1024 * 1024, // 1GB
            compression: true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SpooledMessage {
    id: u64,
    item: String,
    enqueued_at: u64, // Unix timestamp
}

/// Message-queue style backend: one file per message in a spool directory.
///
/// A message is written to a pending file, synced, then renamed into place, so
/// a crash leaves either the whole message or nothing. Pending files found at
/// open time belong to uncommitted writes and are discarded.
pub struct SpoolStorage {
    config: SpoolConfig,
    state: Mutex<SpoolState>,
}

struct SpoolState {
    index: BTreeMap<u64, u64>, // id -> file size
    next_id: u64,
    current_usage: u64,
}

impl SpoolStorage {
    pub fn open(config: SpoolConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.storage_path)?;
        if !config.storage_path.is_dir() {
            return Err(StorageError::InvalidStoragePath(
                config.storage_path.display().to_string(),
            ));
        }

        let mut index = BTreeMap::new();
        let mut current_usage = 0u64;
        let mut discarded = 0usize;

        for entry in fs::read_dir(&config.storage_path)? {
            let entry = entry?;
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(MESSAGE_EXTENSION) => {
                    let Some(id) = Self::parse_id(&path) else {
                        tracing::warn!("Ignoring unrecognised spool file {}", path.display());
                        continue;
                    };
                    let size = entry.metadata()?.len();
                    current_usage += size;
                    index.insert(id, size);
                }
                Some(PENDING_EXTENSION) => {
                    fs::remove_file(&path)?;
                    discarded += 1;
                }
                _ => {}
            }
        }

        if discarded > 0 {
            tracing::warn!("Discarded {discarded} uncommitted spool writes");
        }

        let next_id = index.keys().next_back().map_or(1, |last| last + 1);

        Ok(Self {
            config,
            state: Mutex::new(SpoolState {
                index,
                next_id,
                current_usage,
            }),
        })
    }

    pub fn current_disk_usage(&self) -> u64 {
        self.state.lock().current_usage
    }

    /// Deletes messages enqueued longer ago than `retention`. Returns how many were removed.
    pub fn cleanup_expired(&self, retention: Duration) -> Result<usize, StorageError> {
        let now = unix_now()?;
        let ids: Vec<u64> = self.state.lock().index.keys().copied().collect();
        let mut expired = Vec::new();

        for id in ids {
            let message = match self.load_message(id) {
                Ok(message) => message,
                Err(StorageError::IoError(e)) if e.kind() == ErrorKind::NotFound => continue,
                Err(StorageError::IoError(e)) => return Err(e.into()),
                // Unreadable messages are left for the consumer to remove
                Err(_) => continue,
            };
            if now.saturating_sub(message.enqueued_at) > retention.as_secs() {
                expired.push(RecordId(id));
            }
        }

        self.delete(&expired)?;
        if !expired.is_empty() {
            tracing::info!("Cleaned up {} expired messages from spool", expired.len());
        }
        Ok(expired.len())
    }

    fn message_path(&self, id: u64) -> PathBuf {
        self.config
            .storage_path
            .join(format!("{id:020}.{MESSAGE_EXTENSION}"))
    }

    fn pending_path(&self, id: u64) -> PathBuf {
        self.config
            .storage_path
            .join(format!("{id:020}.{PENDING_EXTENSION}"))
    }

    fn parse_id(path: &Path) -> Option<u64> {
        path.file_stem()?.to_str()?.parse().ok()
    }

    fn encode(&self, message: &SpooledMessage) -> Result<Vec<u8>, StorageError> {
        let serialized = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
        if !self.config.compression {
            return Ok(serialized);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&serialized)?;
        Ok(encoder.finish()?)
    }

    fn load_message(&self, id: u64) -> Result<SpooledMessage, StorageError> {
        let data = fs::read(self.message_path(id))?;
        Self::parse_message(id, data)
    }

    fn parse_message(id: u64, data: Vec<u8>) -> Result<SpooledMessage, StorageError> {
        let raw = if data.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(data.as_slice());
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| StorageError::CorruptRecord {
                    id,
                    reason: format!("gzip stream: {e}"),
                })?;
            decompressed
        } else {
            data
        };

        let (message, _): (SpooledMessage, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())?;
        if message.id != id {
            return Err(StorageError::CorruptRecord {
                id,
                reason: format!("file holds message {}", message.id),
            });
        }
        Ok(message)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> Result<(), StorageError> {
        fs::File::open(&self.config.storage_path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl Storage for SpoolStorage {
    fn put(&self, item: &str) -> Result<RecordId, StorageError> {
        let mut state = self.state.lock();
        let id = state.next_id;

        let data = self.encode(&SpooledMessage {
            id,
            item: item.to_string(),
            enqueued_at: unix_now()?,
        })?;

        // Check disk space
        if state.current_usage + data.len() as u64 > self.config.max_disk_usage {
            return Err(StorageError::DiskSpaceExceeded);
        }

        let pending = self.pending_path(id);
        {
            let mut file = fs::File::create(&pending)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&pending, self.message_path(id))?;
        self.sync_directory()?;

        state.next_id += 1;
        state.current_usage += data.len() as u64;
        state.index.insert(id, data.len() as u64);

        tracing::trace!("Spooled message {id} ({} bytes)", data.len());
        Ok(RecordId(id))
    }

    fn take_last(&self, count: usize) -> Result<Vec<StorageRecord>, StorageError> {
        let state = self.state.lock();
        let mut records = Vec::with_capacity(count.min(state.index.len()));

        for &id in state.index.keys().take(count) {
            let data = fs::read(self.message_path(id))?;
            match Self::parse_message(id, data) {
                Ok(message) => records.push(StorageRecord::new(id, message.item)),
                Err(e) => {
                    tracing::warn!("Spool message {id} is unreadable: {e}");
                    records.push(StorageRecord::unreadable(id, e.to_string()));
                }
            }
        }

        Ok(records)
    }

    fn delete(&self, ids: &[RecordId]) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let mut all_found = true;

        for id in ids {
            let Some(size) = state.index.remove(&id.0) else {
                all_found = false;
                continue;
            };
            match fs::remove_file(self.message_path(id.0)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => all_found = false,
                Err(e) => {
                    state.index.insert(id.0, size);
                    return Err(e.into());
                }
            }
            state.current_usage = state.current_usage.saturating_sub(size);
        }

        Ok(all_found)
    }

    fn total_items(&self) -> Result<usize, StorageError> {
        Ok(self.state.lock().index.len())
    }
}

impl std::fmt::Debug for SpoolStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SpoolStorage")
            .field("config", &self.config)
            .field("items", &state.index.len())
            .field("current_usage", &state.current_usage)
            .finish()
    }
}

fn unix_now() -> Result<u64, StorageError> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| StorageError::SystemTimeError(format!("Invalid system time: {e}")))?
        .as_secs())
}
