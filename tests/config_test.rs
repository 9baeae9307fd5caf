use serial_test::serial;
use snowplow_emitter::app::{CONFIG_ENV_VAR, Config, ConfigError, LogFormat, LogLevel};
use snowplow_emitter::emitter::OversizePolicy;
use snowplow_emitter::reliability::BackoffStrategy;
use snowplow_emitter::sender::{HttpMethod, Scheme};
use snowplow_emitter::storage::StorageBackend;
use std::{env, time::Duration};
use tempfile::TempDir;

const ENV_VARS: &[&str] = &[
    CONFIG_ENV_VAR,
    "SNOWPLOW_COLLECTOR_HOST",
    "SNOWPLOW_SCHEME",
    "SNOWPLOW_PORT",
    "SNOWPLOW_METHOD",
    "SNOWPLOW_SEND_LIMIT",
    "SNOWPLOW_POLL_INTERVAL_MS",
    "SNOWPLOW_BACKOFF_MIN_MS",
    "SNOWPLOW_BACKOFF_MAX_MS",
    "SNOWPLOW_BACKOFF_STRATEGY",
    "SNOWPLOW_BYTE_LIMIT_GET",
    "SNOWPLOW_BYTE_LIMIT_POST",
    "SNOWPLOW_REQUEST_TIMEOUT_SECS",
    "SNOWPLOW_MAX_CONCURRENT_REQUESTS",
    "SNOWPLOW_OVERSIZE_POLICY",
    "SNOWPLOW_STORAGE_BACKEND",
    "SNOWPLOW_STORAGE_PATH",
    "SNOWPLOW_MAX_DISK_USAGE_MB",
    "SNOWPLOW_STORAGE_COMPRESSION",
    "SNOWPLOW_STORAGE_RETENTION_HOURS",
    "SNOWPLOW_ENABLE_SESSION",
    "SNOWPLOW_SESSION_PATH",
    "SNOWPLOW_FOREGROUND_TIMEOUT_SECS",
    "SNOWPLOW_BACKGROUND_TIMEOUT_SECS",
    "SNOWPLOW_SESSION_CHECK_INTERVAL_SECS",
    "LOG_LEVEL",
    "LOG_FORMAT",
    "SNOWPLOW_CONFIG_FILE",
    "SNOWPLOW_INPUT",
    "SNOWPLOW_KEEP_RUNNING",
];

// Clean all environment variables before and after tests
fn clean_all_env_vars() {
    unsafe {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }
}

fn set_env(name: &str, value: &str) {
    unsafe {
        env::set_var(name, value);
    }
}

#[test]
#[serial]
fn test_defaults() {
    clean_all_env_vars();

    let config = Config::from_args(["snowplow-emitter"]).unwrap();
    assert_eq!(config.collector_host, "localhost");
    assert_eq!(config.scheme, Scheme::Https);
    assert_eq!(config.method, HttpMethod::Post);
    assert_eq!(config.storage_backend, StorageBackend::Sled);

    assert_eq!(config.endpoint.byte_limit_get, 40_000);
    assert_eq!(config.endpoint.byte_limit_post, 40_000);
    assert_eq!(config.endpoint.timeout, Duration::from_secs(30));
    assert_eq!(config.emitter.send_limit, 150);
    assert_eq!(config.emitter.poll_interval, Duration::from_secs(1));
    assert_eq!(config.emitter.backoff.min_delay, Duration::from_secs(5));
    assert_eq!(config.emitter.backoff.max_delay, Duration::from_secs(30));
    assert_eq!(config.emitter.oversize_policy, OversizePolicy::Drop);
    assert_eq!(config.storage.max_disk_usage, 1000 * 1024 * 1024);
    assert_eq!(config.storage.retention, None);
    assert!(config.session.is_none());
}

#[test]
#[serial]
fn test_config_from_args() {
    clean_all_env_vars();
    let temp_dir = TempDir::new().unwrap();
    let storage_path = temp_dir.path().join("spool");
    let session_path = temp_dir.path().join("session.json");

    let config = Config::from_args([
        "snowplow-emitter",
        "--collector-host",
        "https://collector.example.com/i",
        "--scheme",
        "http",
        "--port",
        "8080",
        "--method",
        "get",
        "--send-limit",
        "20",
        "--backoff-strategy",
        "exponential",
        "--oversize-policy",
        "retain",
        "--storage-backend",
        "spool",
        "--storage-path",
        storage_path.to_str().unwrap(),
        "--storage-compression",
        "--storage-retention-hours",
        "48",
        "--enable-session",
        "--session-path",
        session_path.to_str().unwrap(),
        "--background-timeout-secs",
        "300",
        "--log-level",
        "debug",
        "--log-format",
        "json",
    ])
    .unwrap();

    assert_eq!(config.endpoint.host, "https://collector.example.com/i");
    assert_eq!(config.endpoint.scheme, Scheme::Http);
    assert_eq!(config.endpoint.port, Some(8080));
    assert_eq!(config.endpoint.method, HttpMethod::Get);
    assert_eq!(config.emitter.send_limit, 20);
    assert_eq!(config.emitter.backoff.strategy, BackoffStrategy::Exponential);
    assert_eq!(config.emitter.oversize_policy, OversizePolicy::Retain);
    assert_eq!(config.storage.backend, StorageBackend::Spool);
    assert_eq!(config.storage.path, storage_path);
    assert!(config.storage.compression);
    assert_eq!(config.storage.retention, Some(Duration::from_secs(48 * 3600)));
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.log_format, LogFormat::Json);

    let session = config.session.as_ref().unwrap();
    assert_eq!(session.path, session_path);
    assert_eq!(session.background_timeout, Duration::from_secs(300));
    assert_eq!(session.foreground_timeout, Duration::from_secs(1800));

    let settings = config.to_tracker_settings();
    assert!(!settings.start_emitter);
    assert_eq!(settings.emitter.send_limit, 20);
}

#[test]
#[serial]
fn test_config_from_env() {
    clean_all_env_vars();
    set_env("SNOWPLOW_COLLECTOR_HOST", "collector.internal");
    set_env("SNOWPLOW_METHOD", "GET");
    set_env("SNOWPLOW_SEND_LIMIT", "75");
    set_env("SNOWPLOW_BACKOFF_MIN_MS", "100");
    set_env("SNOWPLOW_BACKOFF_MAX_MS", "200");
    set_env("SNOWPLOW_STORAGE_BACKEND", "memory");
    set_env("SNOWPLOW_STORAGE_RETENTION_HOURS", "24");
    set_env("SNOWPLOW_ENABLE_SESSION", "true");
    set_env("LOG_LEVEL", "warn");

    let config = Config::from_env().unwrap();
    assert_eq!(config.collector_host, "collector.internal");
    assert_eq!(config.method, HttpMethod::Get);
    assert_eq!(config.emitter.send_limit, 75);
    assert_eq!(config.emitter.backoff.min_delay, Duration::from_millis(100));
    assert_eq!(config.emitter.backoff.max_delay, Duration::from_millis(200));
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.storage.retention, Some(Duration::from_secs(24 * 3600)));
    assert!(config.session.is_some());
    assert_eq!(config.log_level, LogLevel::Warn);

    clean_all_env_vars();
}

#[test]
#[serial]
fn test_invalid_env_values_are_rejected() {
    clean_all_env_vars();

    set_env("SNOWPLOW_METHOD", "put");
    assert!(matches!(Config::from_env(), Err(ConfigError::EnvError(_))));

    clean_all_env_vars();
    set_env("SNOWPLOW_SEND_LIMIT", "lots");
    assert!(matches!(Config::from_env(), Err(ConfigError::EnvError(_))));

    clean_all_env_vars();
}

#[test]
#[serial]
fn test_inline_toml_env_var() {
    clean_all_env_vars();
    set_env(
        CONFIG_ENV_VAR,
        r#"
            collector_host = "inline.example.com"
            method = "get"
            storage_backend = "memory"
            request_timeout_secs = 5
        "#,
    );

    let config = Config::from_env().unwrap();
    assert_eq!(config.collector_host, "inline.example.com");
    assert_eq!(config.method, HttpMethod::Get);
    assert_eq!(config.endpoint.timeout, Duration::from_secs(5));
    // Unset keys keep their defaults
    assert_eq!(config.send_limit, 150);

    clean_all_env_vars();
}

#[test]
#[serial]
fn test_config_file_merges_under_cli() {
    clean_all_env_vars();
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("emitter.toml");
    std::fs::write(
        &config_path,
        r#"
            collector_host = "file.example.com"
            send_limit = 42
            log_level = "debug"
            storage_backend = "memory"
        "#,
    )
    .unwrap();

    let config = Config::from_args_and_env([
        "snowplow-emitter",
        "--config-file",
        config_path.to_str().unwrap(),
        "--send-limit",
        "7",
    ])
    .unwrap();

    // Explicit CLI values win, file fills in the rest
    assert_eq!(config.send_limit, 7);
    assert_eq!(config.collector_host, "file.example.com");
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
}

#[test]
#[serial]
fn test_config_from_file() {
    clean_all_env_vars();
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("emitter.toml");
    std::fs::write(&config_path, "poll_interval_ms = 250\nbyte_limit_post = 1000\n").unwrap();

    let config = Config::from_file(&config_path).unwrap();
    assert_eq!(config.emitter.poll_interval, Duration::from_millis(250));
    assert_eq!(config.endpoint.byte_limit_post, 1000);

    assert!(matches!(
        Config::from_file(temp_dir.path().join("missing.toml")),
        Err(ConfigError::FileError(_))
    ));
    assert!(matches!(
        Config::from_toml_str("send_limit = \"many\""),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
#[serial]
fn test_validation() {
    clean_all_env_vars();

    let invalid = [
        "send_limit = 0",
        "byte_limit_get = 0",
        "max_concurrent_requests = 0",
        "request_timeout_secs = 0",
        "backoff_min_ms = 5000\nbackoff_max_ms = 10",
        "collector_host = \"\"",
        "enable_session = true\nsession_check_interval_secs = 0",
    ];
    for toml in invalid {
        assert!(Config::from_toml_str(toml).is_err(), "accepted: {toml}");
    }
}

#[test]
#[serial]
fn test_storage_path_must_not_be_a_file() {
    clean_all_env_vars();
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("occupied");
    std::fs::write(&file, b"x").unwrap();

    let result = Config::from_args([
        "snowplow-emitter",
        "--storage-path",
        file.to_str().unwrap(),
    ]);
    assert!(result.is_err());
}
