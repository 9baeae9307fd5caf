//! Persistent multi-producer/multi-consumer event queue.

pub mod codec;
pub mod queue;

pub use codec::{CodecError, PayloadCodec};
pub use queue::{PersistentBlockingQueue, QueueError};
