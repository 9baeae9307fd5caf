pub mod config;
pub mod logging_system;
pub mod shutdown;

pub use config::{CONFIG_ENV_VAR, Config, ConfigError, LogFormat, LogLevel};
pub use logging_system::{LoggingError, LoggingSystem, setup_logging_safe};
pub use shutdown::{shutdown_token, wait_for_signal};

use crate::domain::Payload;
use crate::tracker::Tracker;
use anyhow::Context;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Tally printed when the process exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tracked: usize,
    pub skipped: usize,
    pub attempted: usize,
    pub failed: usize,
    pub pending: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tracked={} skipped={} sent={} failed={} pending={}",
            self.tracked,
            self.skipped,
            self.attempted.saturating_sub(self.failed),
            self.failed,
            self.pending
        )
    }
}

pub struct App {
    config: Config,
}

impl App {
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args_and_env(args).context("Failed to load configuration")?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        if let Err(e) = setup_logging_safe(config.log_level, config.log_format) {
            eprintln!("Continuing without structured logging: {e}");
        }
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enqueues the input, then either drains once or keeps emitting until a shutdown signal.
    pub async fn run(self) -> anyhow::Result<RunSummary> {
        info!("Starting snowplow-emitter v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "Configuration: collector={}, method={:?}, send_limit={}, storage={:?}",
            self.config.collector_host,
            self.config.method,
            self.config.send_limit,
            self.config.storage_backend
        );

        let mut settings = self.config.to_tracker_settings();
        settings.start_emitter = self.config.keep_running;
        let tracker = Tracker::new(settings).context("Failed to build tracker")?;

        let (tracked, skipped) = match &self.config.input {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open input {}", path.display()))?;
                track_lines(&tracker, BufReader::new(file)).await?
            }
            None => track_lines(&tracker, BufReader::new(tokio::io::stdin())).await?,
        };
        info!("Enqueued {} events ({} skipped)", tracked, skipped);

        if self.config.keep_running {
            info!("snowplow-emitter is running. Press Ctrl+C to stop.");
            shutdown_token().cancelled().await;
        }

        let outcome = tracker.flush(true).await.context("Final flush failed")?;
        let pending = tracker.queue_len()?;
        tracker.close().await;

        Ok(RunSummary {
            tracked,
            skipped,
            attempted: outcome.attempted,
            failed: outcome.failed,
            pending,
        })
    }
}

async fn track_lines<R>(tracker: &Tracker, reader: R) -> anyhow::Result<(usize, usize)>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut tracked = 0;
    let mut skipped = 0;
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_payload_line(&line) {
            Ok(payload) => {
                tracker.track(payload)?;
                tracked += 1;
            }
            Err(e) => {
                warn!("Skipping input line {}: {}", line_number, e);
                skipped += 1;
            }
        }
    }

    Ok((tracked, skipped))
}

/// Parses one JSON object into a payload; non-string values keep their JSON text.
pub fn parse_payload_line(line: &str) -> Result<Payload, serde_json::Error> {
    let object: Map<String, Value> = serde_json::from_str(line)?;
    Ok(object
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_line_stringifies_values() {
        let payload =
            parse_payload_line(r#"{"e":"pv","tv":"rust-0.1","dtm":1700000000000,"x":true}"#)
                .unwrap();
        assert_eq!(payload.get("e"), Some("pv"));
        assert_eq!(payload.get("dtm"), Some("1700000000000"));
        assert_eq!(payload.get("x"), Some("true"));
    }

    #[test]
    fn test_parse_payload_line_rejects_non_objects() {
        assert!(parse_payload_line("[1,2]").is_err());
        assert!(parse_payload_line("{broken").is_err());
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            tracked: 3,
            skipped: 1,
            attempted: 3,
            failed: 1,
            pending: 1,
        };
        assert_eq!(
            summary.to_string(),
            "tracked=3 skipped=1 sent=2 failed=1 pending=1"
        );
        assert!(!summary.is_success());
    }
}
