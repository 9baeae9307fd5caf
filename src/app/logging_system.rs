use super::config::{LogFormat, LogLevel};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log directive '{directive}': {reason}")]
    InvalidDirective { directive: String, reason: String },
    #[error("Failed to build log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to install global subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("Logging already failed to initialize")]
    AlreadyFailed,
}

/// `target=level` pair appended to the default level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, LoggingError> {
        let invalid = |reason: &str| LoggingError::InvalidDirective {
            directive: raw.to_string(),
            reason: reason.to_string(),
        };

        let (target, level) = raw
            .split_once('=')
            .ok_or_else(|| invalid("expected target=level"))?;
        let target = target.trim();
        if target.is_empty() {
            return Err(invalid("empty target"));
        }
        let level = <LogLevel as clap::ValueEnum>::from_str(level.trim(), true)
            .map_err(|_| invalid("unknown level"))?;

        Ok(Self::new(target, level))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, level_name(self.level))
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

pub struct LoggingSystem {
    directives: Arc<RwLock<Vec<LogDirective>>>,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Invalid directives are skipped with a warning on stderr.
    pub fn add_directive(&self, directive_str: &str) {
        match LogDirective::parse(directive_str) {
            Ok(directive) => self.directives.write().push(directive),
            Err(e) => eprintln!("Warning: {e}, skipping directive"),
        }
    }

    /// Quiets chatty dependencies.
    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls", "sled"] {
            directives.push(LogDirective::new(target, LogLevel::Warn));
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();

        let mut filter_parts = Vec::with_capacity(directives.len() + 1);
        filter_parts.push(level_name(default_level).to_string());
        filter_parts.extend(directives.iter().map(LogDirective::to_filter_string));

        filter_parts.join(",")
    }

    /// `RUST_LOG` overrides the computed filter when set.
    pub fn build_filter(&self, default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
        let filter_string = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(from_env) if !from_env.trim().is_empty() => from_env,
            _ => self.build_filter_string(default_level),
        };

        EnvFilter::try_new(&filter_string).map_err(|source| LoggingError::Filter {
            filter: filter_string,
            source,
        })
    }

    pub fn initialize_tracing(
        &self,
        default_level: LogLevel,
        format: LogFormat,
    ) -> Result<(), LoggingError> {
        let env_filter = self.build_filter(default_level)?;

        let (compact, json) = match format {
            LogFormat::Compact => (
                Some(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr)
                        .compact(),
                ),
                None,
            ),
            LogFormat::Json => (
                None,
                Some(
                    fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_writer(std::io::stderr),
                ),
            ),
        };

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(compact)
            .with(json);

        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }

    pub fn clear_directives(&self) {
        self.directives.write().clear();
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global subscriber once per process; later calls report the first outcome.
pub fn setup_logging_safe(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    use std::sync::Once;
    use std::sync::atomic::{AtomicBool, Ordering};

    static INIT: Once = Once::new();
    static INIT_SUCCESS: AtomicBool = AtomicBool::new(false);

    INIT.call_once(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();

        match logging_system.initialize_tracing(level, format) {
            Ok(()) => INIT_SUCCESS.store(true, Ordering::SeqCst),
            Err(e) => eprintln!("Failed to initialize logging: {e}"),
        }
    });

    if INIT_SUCCESS.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(LoggingError::AlreadyFailed)
    }
}
