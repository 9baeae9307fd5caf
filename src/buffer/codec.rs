use crate::domain::Payload;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Stored item is unreadable: {0}")]
    Unreadable(String),
}

/// Converts payloads to and from the JSON strings kept in storage.
///
/// The stored form is a flat JSON object of strings, e.g. `{"e":"pv","tv":"rust-0.1.0"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, payload: &Payload) -> Result<String, CodecError> {
        serde_json::to_string(payload).map_err(CodecError::Encode)
    }

    pub fn decode(&self, item: &str) -> Result<Payload, CodecError> {
        serde_json::from_str(item).map_err(CodecError::Malformed)
    }
}
