//! Client session tracking with inactivity-based rotation.

pub mod state;
pub mod store;

pub use state::{CLIENT_SESSION_SCHEMA, PersistedSession, SessionContext, SessionState};
pub use store::SessionStore;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No tokio runtime available to run the session checker")]
    NoRuntime,
    #[error("Session file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize session: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub path: PathBuf,
    pub foreground_timeout: Duration,
    pub background_timeout: Duration,
    pub check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/snowplow-emitter/session.json"),
            foreground_timeout: Duration::from_secs(30 * 60),
            background_timeout: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(15),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.check_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "check_interval must be greater than 0".to_string(),
            ));
        }
        if self.foreground_timeout.is_zero() || self.background_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "session timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Active,
    Rotated,
    /// Rotated while in background; the checker pauses until foregrounded
    Paused,
}

struct SessionInner {
    config: SessionConfig,
    store: SessionStore,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn check(&self) -> Result<CheckOutcome, SessionError> {
        let mut state = self.state.lock();
        let timeout = if state.background {
            self.config.background_timeout
        } else {
            self.config.foreground_timeout
        };

        if state.last_accessed.elapsed() <= timeout {
            return Ok(CheckOutcome::Active);
        }

        state.rotate();
        self.store.save(&state.persisted())?;
        info!(
            "Session rotated to {} (index {})",
            state.session_id, state.session_index
        );

        if state.background {
            Ok(CheckOutcome::Paused)
        } else {
            Ok(CheckOutcome::Rotated)
        }
    }
}

struct Checker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Rotating client session backed by a JSON file.
///
/// Opening always starts a new session: a persisted one is rotated so the
/// index keeps growing across restarts and `previous_session_id` points at the
/// session the last process ended with.
pub struct ClientSession {
    inner: Arc<SessionInner>,
    checker: Mutex<Option<Checker>>,
}

impl ClientSession {
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let store = SessionStore::new(&config.path);

        let state = match store.load() {
            Ok(Some(persisted)) => SessionState::resumed(persisted),
            Ok(None) => SessionState::fresh(),
            Err(SessionError::Corrupt { path, source }) => {
                warn!("Discarding corrupt session file {}: {}", path.display(), source);
                SessionState::fresh()
            }
            Err(e) => return Err(e),
        };
        store.save(&state.persisted())?;

        debug!(
            "Session {} opened for user {} (index {})",
            state.session_id, state.user_id, state.session_index
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                store,
                state: Mutex::new(state),
            }),
            checker: Mutex::new(None),
        })
    }

    /// Context for an outgoing event. The first event of each session is recorded.
    pub fn get_session_context(&self, event_id: &str) -> Result<SessionContext, SessionError> {
        self.ensure_checker()?;

        let mut state = self.inner.state.lock();
        state.touch();
        if state.first_event_id.is_none() {
            state.first_event_id = Some(event_id.to_string());
        }
        Ok(state.context())
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    pub fn is_background(&self) -> bool {
        self.inner.state.lock().background
    }

    /// Switches between foreground and background timeouts.
    ///
    /// Coming back to the foreground restarts a checker that paused itself.
    pub fn set_background(&self, background: bool) -> Result<(), SessionError> {
        let was_background = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.background, background)
        };

        if was_background && !background {
            self.ensure_checker()?;
        }
        Ok(())
    }

    pub fn is_checker_running(&self) -> bool {
        self.checker
            .lock()
            .as_ref()
            .is_some_and(|checker| !checker.handle.is_finished())
    }

    fn ensure_checker(&self) -> Result<(), SessionError> {
        let mut checker = self.checker.lock();
        if checker.as_ref().is_some_and(|c| !c.handle.is_finished()) {
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_checker(Arc::clone(&self.inner), cancel.clone()));
        *checker = Some(Checker { cancel, handle });
        debug!("Session checker started");
        Ok(())
    }

    /// Cancels the checker and waits for it to exit.
    pub async fn stop(&self) {
        let Some(checker) = self.checker.lock().take() else {
            return;
        };
        checker.cancel.cancel();
        if let Err(e) = checker.handle.await {
            error!("Session checker ended abnormally: {}", e);
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(checker) = self.checker.get_mut().take() {
            checker.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

async fn run_checker(inner: Arc<SessionInner>, cancel: CancellationToken) {
    let period = inner.config.check_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match inner.check() {
            Ok(CheckOutcome::Active | CheckOutcome::Rotated) => {}
            Ok(CheckOutcome::Paused) => {
                debug!("Session expired in background; checker paused");
                break;
            }
            Err(e) => error!("Session check failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, timeout_ms: u64) -> SessionConfig {
        SessionConfig {
            path: dir.path().join("session.json"),
            foreground_timeout: Duration::from_millis(timeout_ms),
            background_timeout: Duration::from_millis(timeout_ms),
            check_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_open_persists_fresh_session() {
        let temp_dir = TempDir::new().unwrap();
        let session = ClientSession::open(config(&temp_dir, 1_000)).unwrap();
        let state = session.state();

        let persisted = SessionStore::new(temp_dir.path().join("session.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(persisted, state.persisted());
        assert_eq!(persisted.session_index, 1);
    }

    #[test]
    fn test_context_requires_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let session = ClientSession::open(config(&temp_dir, 1_000)).unwrap();
        assert!(matches!(
            session.get_session_context("e1"),
            Err(SessionError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_first_event_id_is_stamped_once() {
        let temp_dir = TempDir::new().unwrap();
        let session = ClientSession::open(config(&temp_dir, 60_000)).unwrap();

        let first = session.get_session_context("e1").unwrap();
        let second = session.get_session_context("e2").unwrap();
        assert_eq!(first.first_event_id.as_deref(), Some("e1"));
        assert_eq!(second.first_event_id.as_deref(), Some("e1"));
        assert!(session.is_checker_running());
        session.stop().await;
        assert!(!session.is_checker_running());
    }

    #[tokio::test]
    async fn test_background_expiry_pauses_checker() {
        let temp_dir = TempDir::new().unwrap();
        let session = ClientSession::open(config(&temp_dir, 30)).unwrap();
        session.get_session_context("e1").unwrap();
        session.set_background(true).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!session.is_checker_running());
        let rotated = session.state().session_index;
        assert_eq!(rotated, 2);

        // Back to foreground restarts the checker
        session.set_background(false).unwrap();
        assert!(session.is_checker_running());
        session.stop().await;
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("session.json"), b"garbage").unwrap();
        let session = ClientSession::open(config(&temp_dir, 1_000)).unwrap();
        assert_eq!(session.state().session_index, 1);
    }

    #[test]
    fn test_zero_check_interval_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = SessionConfig {
            check_interval: Duration::ZERO,
            ..config(&temp_dir, 1_000)
        };
        assert!(matches!(
            ClientSession::open(config),
            Err(SessionError::InvalidConfig(_))
        ));
    }
}
