//! Collector wire protocol: URL building, request planning and delivery.

pub mod client;
pub mod endpoint;
pub mod serialization;

pub use client::{
    ClientStats, CollectorUrl, ConnectionStats, EndpointConfig, EndpointError, HttpMethod, Scheme,
    normalize_host,
};
pub use endpoint::{Endpoint, RequestResult, SendResult};
pub use serialization::{PAYLOAD_DATA_SCHEMA, PlannedRequest};
