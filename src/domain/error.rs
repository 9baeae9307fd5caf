use crate::app::config::ConfigError;
use crate::buffer::QueueError;
use crate::emitter::EmitterError;
use crate::sender::EndpointError;
use crate::session::SessionError;
use crate::storage::StorageError;
use thiserror::Error;

/// Top-level error type for the tracker handle and the binary.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Emitter error: {0}")]
    Emitter(#[from] EmitterError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}
