use super::serde_helpers::{
    load_env_enum, load_env_path, load_env_path_opt, load_env_string, load_env_var,
    load_env_var_opt,
};
use super::{ConfigError, LogFormat, LogLevel};
use crate::emitter::{EmitterConfig, OversizePolicy};
use crate::reliability::{BackoffConfig, BackoffStrategy};
use crate::sender::{EndpointConfig, HttpMethod, Scheme};
use crate::session::SessionConfig;
use crate::storage::{StorageBackend, StorageConfig};
use crate::tracker::TrackerSettings;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Inline TOML configuration, takes precedence over individual variables
pub const CONFIG_ENV_VAR: &str = "SNOWPLOW_EMITTER_CONFIG";

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Collector host; a full URI is reduced to its host
    #[arg(long, env = "SNOWPLOW_COLLECTOR_HOST", default_value = "localhost")]
    pub collector_host: String,

    /// Collector scheme
    #[arg(long, env = "SNOWPLOW_SCHEME", default_value = "https")]
    pub scheme: Scheme,

    /// Collector port (scheme default when absent)
    #[arg(long, env = "SNOWPLOW_PORT")]
    pub port: Option<u16>,

    /// HTTP method used to ship events
    #[arg(long, env = "SNOWPLOW_METHOD", default_value = "post")]
    pub method: HttpMethod,

    /// Maximum events per batch
    #[arg(long, env = "SNOWPLOW_SEND_LIMIT", default_value = "150")]
    pub send_limit: usize,

    /// Queue poll interval in milliseconds
    #[arg(long, env = "SNOWPLOW_POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Lower bound of the backoff wait in milliseconds
    #[arg(long, env = "SNOWPLOW_BACKOFF_MIN_MS", default_value = "5000")]
    pub backoff_min_ms: u64,

    /// Upper bound of the backoff wait in milliseconds
    #[arg(long, env = "SNOWPLOW_BACKOFF_MAX_MS", default_value = "30000")]
    pub backoff_max_ms: u64,

    /// Backoff strategy
    #[arg(long, env = "SNOWPLOW_BACKOFF_STRATEGY", default_value = "uniform")]
    pub backoff_strategy: BackoffStrategy,

    /// Maximum GET request URL size in bytes
    #[arg(long, env = "SNOWPLOW_BYTE_LIMIT_GET", default_value = "40000")]
    pub byte_limit_get: usize,

    /// Maximum POST body size in bytes
    #[arg(long, env = "SNOWPLOW_BYTE_LIMIT_POST", default_value = "40000")]
    pub byte_limit_post: usize,

    /// Request timeout in seconds
    #[arg(long, env = "SNOWPLOW_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent collector requests
    #[arg(long, env = "SNOWPLOW_MAX_CONCURRENT_REQUESTS", default_value = "8")]
    pub max_concurrent_requests: usize,

    /// What to do with events too large to send
    #[arg(long, env = "SNOWPLOW_OVERSIZE_POLICY", default_value = "drop")]
    pub oversize_policy: OversizePolicy,

    /// Event storage backend
    #[arg(long, env = "SNOWPLOW_STORAGE_BACKEND", default_value = "sled")]
    pub storage_backend: StorageBackend,

    /// Event storage location (database file or spool directory)
    #[arg(
        long,
        env = "SNOWPLOW_STORAGE_PATH",
        default_value = "/tmp/snowplow-emitter/queue"
    )]
    pub storage_path: PathBuf,

    /// Spool disk ceiling in MB
    #[arg(long, env = "SNOWPLOW_MAX_DISK_USAGE_MB", default_value = "1000")]
    pub max_disk_usage_mb: u64,

    /// Gzip spool messages
    #[arg(long, env = "SNOWPLOW_STORAGE_COMPRESSION")]
    pub storage_compression: bool,

    /// Delete spool messages older than this many hours at startup (0 keeps everything)
    #[arg(long, env = "SNOWPLOW_STORAGE_RETENTION_HOURS", default_value = "0")]
    pub storage_retention_hours: u64,

    /// Attach a client session context to events carrying an event id
    #[arg(long, env = "SNOWPLOW_ENABLE_SESSION")]
    pub enable_session: bool,

    /// Session state file
    #[arg(
        long,
        env = "SNOWPLOW_SESSION_PATH",
        default_value = "/tmp/snowplow-emitter/session.json"
    )]
    pub session_path: PathBuf,

    /// Foreground inactivity timeout in seconds
    #[arg(long, env = "SNOWPLOW_FOREGROUND_TIMEOUT_SECS", default_value = "1800")]
    pub foreground_timeout_secs: u64,

    /// Background inactivity timeout in seconds
    #[arg(long, env = "SNOWPLOW_BACKGROUND_TIMEOUT_SECS", default_value = "1800")]
    pub background_timeout_secs: u64,

    /// Session checker interval in seconds
    #[arg(long, env = "SNOWPLOW_SESSION_CHECK_INTERVAL_SECS", default_value = "15")]
    pub session_check_interval_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Configuration file path (optional)
    #[arg(long, env = "SNOWPLOW_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Newline-delimited JSON payloads to enqueue (stdin when absent)
    #[arg(long, env = "SNOWPLOW_INPUT")]
    pub input: Option<PathBuf>,

    /// Keep the emitter running after the input is consumed, until Ctrl-C/SIGTERM
    #[arg(long, env = "SNOWPLOW_KEEP_RUNNING")]
    pub keep_running: bool,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub endpoint: EndpointConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub emitter: EmitterConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub storage: StorageConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub session: Option<SessionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector_host: "localhost".to_string(),
            scheme: Scheme::Https,
            port: None,
            method: HttpMethod::Post,
            send_limit: 150,
            poll_interval_ms: 1000,
            backoff_min_ms: 5000,
            backoff_max_ms: 30000,
            backoff_strategy: BackoffStrategy::Uniform,
            byte_limit_get: 40_000,
            byte_limit_post: 40_000,
            request_timeout_secs: 30,
            max_concurrent_requests: 8,
            oversize_policy: OversizePolicy::Drop,
            storage_backend: StorageBackend::Sled,
            storage_path: PathBuf::from("/tmp/snowplow-emitter/queue"),
            max_disk_usage_mb: 1000,
            storage_compression: false,
            storage_retention_hours: 0,
            enable_session: false,
            session_path: PathBuf::from("/tmp/snowplow-emitter/session.json"),
            foreground_timeout_secs: 1800,
            background_timeout_secs: 1800,
            session_check_interval_secs: 15,
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            config_file: None,
            input: None,
            keep_running: false,
            endpoint: EndpointConfig::default(),
            emitter: EmitterConfig::default(),
            storage: StorageConfig::default(),
            session: None,
        }
    }
}

/// Keeps the CLI value unless it is the default and the base configuration set something else.
fn prefer_base<T: PartialEq>(cli: &mut T, base: T, default: &T) {
    if *cli == *default && base != *default {
        *cli = base;
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // Inline TOML wins over individual variables
        if let Ok(inline) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_toml_str(&inline);
        }

        let mut config = Config::default();

        load_env_string("SNOWPLOW_COLLECTOR_HOST", &mut config.collector_host);
        load_env_enum("SNOWPLOW_SCHEME", &mut config.scheme)?;
        load_env_var_opt("SNOWPLOW_PORT", &mut config.port)?;
        load_env_enum("SNOWPLOW_METHOD", &mut config.method)?;
        load_env_var("SNOWPLOW_SEND_LIMIT", &mut config.send_limit)?;
        load_env_var("SNOWPLOW_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        load_env_var("SNOWPLOW_BACKOFF_MIN_MS", &mut config.backoff_min_ms)?;
        load_env_var("SNOWPLOW_BACKOFF_MAX_MS", &mut config.backoff_max_ms)?;
        load_env_enum("SNOWPLOW_BACKOFF_STRATEGY", &mut config.backoff_strategy)?;
        load_env_var("SNOWPLOW_BYTE_LIMIT_GET", &mut config.byte_limit_get)?;
        load_env_var("SNOWPLOW_BYTE_LIMIT_POST", &mut config.byte_limit_post)?;
        load_env_var("SNOWPLOW_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;
        load_env_var("SNOWPLOW_MAX_CONCURRENT_REQUESTS", &mut config.max_concurrent_requests)?;
        load_env_enum("SNOWPLOW_OVERSIZE_POLICY", &mut config.oversize_policy)?;
        load_env_enum("SNOWPLOW_STORAGE_BACKEND", &mut config.storage_backend)?;
        load_env_path("SNOWPLOW_STORAGE_PATH", &mut config.storage_path);
        load_env_var("SNOWPLOW_MAX_DISK_USAGE_MB", &mut config.max_disk_usage_mb)?;
        load_env_var("SNOWPLOW_STORAGE_COMPRESSION", &mut config.storage_compression)?;
        load_env_var(
            "SNOWPLOW_STORAGE_RETENTION_HOURS",
            &mut config.storage_retention_hours,
        )?;
        load_env_var("SNOWPLOW_ENABLE_SESSION", &mut config.enable_session)?;
        load_env_path("SNOWPLOW_SESSION_PATH", &mut config.session_path);
        load_env_var("SNOWPLOW_FOREGROUND_TIMEOUT_SECS", &mut config.foreground_timeout_secs)?;
        load_env_var("SNOWPLOW_BACKGROUND_TIMEOUT_SECS", &mut config.background_timeout_secs)?;
        load_env_var(
            "SNOWPLOW_SESSION_CHECK_INTERVAL_SECS",
            &mut config.session_check_interval_secs,
        )?;
        load_env_enum("LOG_LEVEL", &mut config.log_level)?;
        load_env_enum("LOG_FORMAT", &mut config.log_format)?;
        load_env_path_opt("SNOWPLOW_CONFIG_FILE", &mut config.config_file);
        load_env_path_opt("SNOWPLOW_INPUT", &mut config.input);
        load_env_var("SNOWPLOW_KEEP_RUNNING", &mut config.keep_running)?;

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// CLI arguments (with their env fallbacks) layered over inline TOML or a config file.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);

        let base = if let Ok(inline) = std::env::var(CONFIG_ENV_VAR) {
            Some(Self::parse_toml(&inline)?)
        } else if let Some(path) = &config.config_file {
            Some(Self::parse_toml(&std::fs::read_to_string(path)?)?)
        } else {
            None
        };

        if let Some(base) = base {
            config.merge_from(base);
        }

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_toml(content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn merge_from(&mut self, base: Config) {
        let default = Config::default();

        prefer_base(&mut self.collector_host, base.collector_host, &default.collector_host);
        prefer_base(&mut self.scheme, base.scheme, &default.scheme);
        prefer_base(&mut self.port, base.port, &default.port);
        prefer_base(&mut self.method, base.method, &default.method);
        prefer_base(&mut self.send_limit, base.send_limit, &default.send_limit);
        prefer_base(&mut self.poll_interval_ms, base.poll_interval_ms, &default.poll_interval_ms);
        prefer_base(&mut self.backoff_min_ms, base.backoff_min_ms, &default.backoff_min_ms);
        prefer_base(&mut self.backoff_max_ms, base.backoff_max_ms, &default.backoff_max_ms);
        prefer_base(&mut self.backoff_strategy, base.backoff_strategy, &default.backoff_strategy);
        prefer_base(&mut self.byte_limit_get, base.byte_limit_get, &default.byte_limit_get);
        prefer_base(&mut self.byte_limit_post, base.byte_limit_post, &default.byte_limit_post);
        prefer_base(
            &mut self.request_timeout_secs,
            base.request_timeout_secs,
            &default.request_timeout_secs,
        );
        prefer_base(
            &mut self.max_concurrent_requests,
            base.max_concurrent_requests,
            &default.max_concurrent_requests,
        );
        prefer_base(&mut self.oversize_policy, base.oversize_policy, &default.oversize_policy);
        prefer_base(&mut self.storage_backend, base.storage_backend, &default.storage_backend);
        prefer_base(&mut self.storage_path, base.storage_path, &default.storage_path);
        prefer_base(&mut self.max_disk_usage_mb, base.max_disk_usage_mb, &default.max_disk_usage_mb);
        prefer_base(
            &mut self.storage_compression,
            base.storage_compression,
            &default.storage_compression,
        );
        prefer_base(
            &mut self.storage_retention_hours,
            base.storage_retention_hours,
            &default.storage_retention_hours,
        );
        prefer_base(&mut self.enable_session, base.enable_session, &default.enable_session);
        prefer_base(&mut self.session_path, base.session_path, &default.session_path);
        prefer_base(
            &mut self.foreground_timeout_secs,
            base.foreground_timeout_secs,
            &default.foreground_timeout_secs,
        );
        prefer_base(
            &mut self.background_timeout_secs,
            base.background_timeout_secs,
            &default.background_timeout_secs,
        );
        prefer_base(
            &mut self.session_check_interval_secs,
            base.session_check_interval_secs,
            &default.session_check_interval_secs,
        );
        prefer_base(&mut self.log_level, base.log_level, &default.log_level);
        prefer_base(&mut self.log_format, base.log_format, &default.log_format);
        prefer_base(&mut self.input, base.input, &default.input);
        prefer_base(&mut self.keep_running, base.keep_running, &default.keep_running);
    }

    /// Builds the nested library configurations from the flat fields.
    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.endpoint = EndpointConfig {
            host: self.collector_host.clone(),
            scheme: self.scheme,
            port: self.port,
            method: self.method,
            byte_limit_get: self.byte_limit_get,
            byte_limit_post: self.byte_limit_post,
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_concurrent_requests: self.max_concurrent_requests,
            ..EndpointConfig::default()
        };

        self.emitter = EmitterConfig {
            send_limit: self.send_limit,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff: BackoffConfig {
                min_delay: Duration::from_millis(self.backoff_min_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
                strategy: self.backoff_strategy,
            },
            oversize_policy: self.oversize_policy,
        };

        self.storage = StorageConfig {
            backend: self.storage_backend,
            path: self.storage_path.clone(),
            max_disk_usage: self.max_disk_usage_mb.saturating_mul(1024 * 1024),
            compression: self.storage_compression,
            retention: (self.storage_retention_hours > 0)
                .then(|| Duration::from_secs(self.storage_retention_hours.saturating_mul(3600))),
        };

        self.session = self.enable_session.then(|| SessionConfig {
            path: self.session_path.clone(),
            foreground_timeout: Duration::from_secs(self.foreground_timeout_secs),
            background_timeout: Duration::from_secs(self.background_timeout_secs),
            check_interval: Duration::from_secs(self.session_check_interval_secs),
        });

        Ok(())
    }

    pub fn to_tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            storage: self.storage.clone(),
            endpoint: self.endpoint.clone(),
            emitter: self.emitter.clone(),
            session: self.session.clone(),
            ..TrackerSettings::default()
        }
    }
}
