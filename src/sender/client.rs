use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const GET_PATH: &str = "/i";
const POST_PATH: &str = "/com.snowplowanalytics.snowplow/tp2";

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid collector host: {0}")]
    InvalidHost(String),
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    /// One request per event, payload in the query string
    Get,
    /// Events packed into self-describing JSON batches
    #[default]
    Post,
}

/// Reduces a host argument to the bare host.
///
/// Accepts `collector.example.com`, `collector.example.com:8080/path?x=1` or a
/// full URI such as `https://collector.example.com/i`. Scheme and port are
/// always taken from explicit configuration, never from the host string.
pub fn normalize_host(host: &str) -> Result<String, EndpointError> {
    let trimmed = host.trim();

    let bare = if trimmed.contains("://") {
        let url = Url::parse(trimmed)
            .map_err(|e| EndpointError::InvalidHost(format!("{trimmed}: {e}")))?;
        url.host_str()
            .ok_or_else(|| EndpointError::InvalidHost(trimmed.to_string()))?
            .to_string()
    } else {
        let end = trimmed.find(['/', '?', '#']).unwrap_or(trimmed.len());
        strip_port(&trimmed[..end]).to_string()
    };

    if bare.is_empty() {
        return Err(EndpointError::InvalidHost(host.to_string()));
    }
    Ok(bare)
}

fn strip_port(authority: &str) -> &str {
    // Bracketed IPv6 literal, e.g. [::1]:9090
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Resolved collector endpoints for both HTTP methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorUrl {
    get_url: Url,
    post_url: Url,
}

impl CollectorUrl {
    pub fn new(host: &str, scheme: Scheme, port: Option<u16>) -> Result<Self, EndpointError> {
        let host = normalize_host(host)?;
        let mut base: Url = format!("{scheme}://{host}")
            .parse()
            .map_err(|e| EndpointError::InvalidHost(format!("{host}: {e}")))?;
        base.set_port(port)
            .map_err(|_| EndpointError::InvalidHost(format!("{host} cannot carry a port")))?;

        let mut get_url = base.clone();
        get_url.set_path(GET_PATH);
        let mut post_url = base;
        post_url.set_path(POST_PATH);

        Ok(Self { get_url, post_url })
    }

    pub fn get_url(&self) -> &Url {
        &self.get_url
    }

    pub fn post_url(&self) -> &Url {
        &self.post_url
    }

    pub fn for_method(&self, method: HttpMethod) -> &Url {
        match method {
            HttpMethod::Get => &self.get_url,
            HttpMethod::Post => &self.post_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub scheme: Scheme,
    pub port: Option<u16>,
    pub method: HttpMethod,
    /// Ceiling for a full GET request URL, in bytes
    pub byte_limit_get: usize,
    /// Ceiling for a POST body, in bytes
    pub byte_limit_post: usize,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub user_agent: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            scheme: Scheme::default(),
            port: None,
            method: HttpMethod::default(),
            byte_limit_get: 40_000,
            byte_limit_post: 40_000,
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_concurrent_requests: 8,
            user_agent: format!("snowplow-emitter/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.byte_limit_get == 0 || self.byte_limit_post == 0 {
            return Err(EndpointError::InvalidConfiguration(
                "byte limits must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(EndpointError::InvalidConfiguration(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(EndpointError::InvalidConfiguration(
                "timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub max_concurrent_requests: usize,
    pub active_requests: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub oversize_events: u64,
    pub bytes_sent: u64,
    pub average_response_time: Duration,
}

#[derive(Debug, Default)]
pub struct ClientStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    oversize_events: AtomicU64,
    bytes_sent: AtomicU64,
    active_requests: AtomicUsize,
    total_response_time: AtomicU64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, success: bool, bytes: usize, response_time: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_response_time
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);

        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_oversize(&self, events: usize) {
        self.oversize_events.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub(crate) fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, max_concurrent_requests: usize) -> ConnectionStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_response_time = self.total_response_time.load(Ordering::Relaxed);

        let average_response_time = if total_requests > 0 {
            Duration::from_millis(total_response_time / total_requests)
        } else {
            Duration::ZERO
        };

        ConnectionStats {
            max_concurrent_requests,
            active_requests: self.active_requests.load(Ordering::Relaxed),
            total_requests,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            oversize_events: self.oversize_events.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            average_response_time,
        }
    }
}
