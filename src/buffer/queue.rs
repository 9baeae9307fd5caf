use super::codec::{CodecError, PayloadCodec};
use crate::domain::{Payload, RecordId};
use crate::storage::{Storage, StorageError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Record {id} could not be decoded: {source}")]
    Decode {
        id: RecordId,
        #[source]
        source: CodecError,
    },
}

/// Blocking queue of payloads backed by a [`Storage`] implementation.
///
/// Consumers `peek` a batch, deliver it, then `remove` what was delivered and
/// `release` what was not. Between peek and remove/release the returned ids are
/// leased and invisible to other consumers, so concurrent consumers never see
/// the same record twice.
pub struct PersistentBlockingQueue {
    storage: Box<dyn Storage>,
    codec: PayloadCodec,
    state: Mutex<QueueState>,
    available: Notify,
}

#[derive(Default)]
struct QueueState {
    leased: HashSet<RecordId>,
}

impl PersistentBlockingQueue {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage,
            codec: PayloadCodec::new(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Stores every payload and wakes waiting consumers.
    ///
    /// Payloads are encoded up front, so a codec failure stores nothing. A
    /// storage failure part way through leaves the earlier items stored.
    pub fn enqueue(&self, items: Vec<Payload>) -> Result<Vec<RecordId>, QueueError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let encoded = items
            .iter()
            .map(|payload| self.codec.encode(payload))
            .collect::<Result<Vec<_>, _>>()?;

        let ids = {
            let _state = self.state.lock();
            let mut ids = Vec::with_capacity(encoded.len());
            for item in &encoded {
                ids.push(self.storage.put(item)?);
            }
            ids
        };

        tracing::trace!("Enqueued {} payloads", ids.len());
        self.available.notify_waiters();
        Ok(ids)
    }

    /// Returns up to `count` of the oldest visible payloads, leasing them.
    ///
    /// Waits up to `max_wait` for an enqueue when nothing is visible. A timeout
    /// yields an empty batch, not an error.
    pub async fn peek(
        &self,
        count: usize,
        max_wait: Duration,
    ) -> Result<Vec<(RecordId, Payload)>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + max_wait;
        loop {
            // Register interest before looking so an enqueue in between is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_peek(count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Non-waiting variant of [`peek`](Self::peek).
    ///
    /// A record that fails to decode, or that storage could not read back, is
    /// reported as [`QueueError::Decode`] when it is the first visible record;
    /// its id stays leased so the caller can remove or release it. Otherwise
    /// the batch ends just before it.
    pub fn try_peek(&self, count: usize) -> Result<Vec<(RecordId, Payload)>, QueueError> {
        let mut state = self.state.lock();

        let window = count.saturating_add(state.leased.len());
        let records = self.storage.take_last(window)?;

        let mut batch = Vec::with_capacity(count.min(records.len()));
        for record in records {
            if batch.len() == count {
                break;
            }
            if state.leased.contains(&record.id) {
                continue;
            }
            let decoded = match record.unreadable {
                Some(reason) => Err(CodecError::Unreadable(reason)),
                None => self.codec.decode(&record.item),
            };
            match decoded {
                Ok(payload) => batch.push((record.id, payload)),
                Err(source) if batch.is_empty() => {
                    state.leased.insert(record.id);
                    return Err(QueueError::Decode {
                        id: record.id,
                        source,
                    });
                }
                Err(_) => break,
            }
        }

        state.leased.extend(batch.iter().map(|(id, _)| *id));
        Ok(batch)
    }

    /// Deletes records from storage and drops their leases.
    ///
    /// Returns true iff every id was found and deleted.
    pub fn remove(&self, ids: &[RecordId]) -> Result<bool, QueueError> {
        if ids.is_empty() {
            return Ok(true);
        }

        let mut state = self.state.lock();
        let removed = self.storage.delete(ids)?;
        for id in ids {
            state.leased.remove(id);
        }
        Ok(removed)
    }

    /// Makes leased records visible again so the next peek redelivers them.
    pub fn release(&self, ids: &[RecordId]) {
        let released = {
            let mut state = self.state.lock();
            ids.iter().filter(|id| state.leased.remove(id)).count()
        };

        if released > 0 {
            tracing::trace!("Released {released} leased records");
            self.available.notify_waiters();
        }
    }

    /// Number of stored records, leased ones included.
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.storage.total_items()?)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    pub fn leased_len(&self) -> usize {
        self.state.lock().leased.len()
    }
}

impl std::fmt::Debug for PersistentBlockingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBlockingQueue")
            .field("leased", &self.leased_len())
            .finish_non_exhaustive()
    }
}
