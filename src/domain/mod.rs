//! Domain layer for snowplow-emitter.
//!
//! Contains the canonical types shared across all modules:
//! - `Payload`: a flattened event, the unit the queue stores and the wire carries
//! - `RecordId` / `StorageRecord`: backend-issued handles for stored items
//! - `TrackerError`: Top-level error type

pub mod error;
pub mod payload;
pub mod record;

pub use error::TrackerError;
pub use payload::Payload;
pub use record::{RecordId, StorageRecord};
