use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

pub const CLIENT_SESSION_SCHEMA: &str =
    "iglu:com.snowplowanalytics.snowplow/client_session/jsonschema/1-0-1";
pub const STORAGE_MECHANISM: &str = "LOCAL_STORAGE";

/// Session fields that survive a restart, exactly as written to the session file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub user_id: String,
    pub session_id: String,
    pub previous_session_id: Option<String>,
    pub session_index: u32,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub user_id: String,
    pub session_id: String,
    pub previous_session_id: Option<String>,
    pub session_index: u32,
    pub first_event_id: Option<String>,
    pub background: bool,
    pub(crate) last_accessed: Instant,
}

impl SessionState {
    /// First session of a brand new user.
    pub fn fresh() -> Self {
        Self {
            user_id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().to_string(),
            previous_session_id: None,
            session_index: 1,
            first_event_id: None,
            background: false,
            last_accessed: Instant::now(),
        }
    }

    /// The session that follows a persisted one after a restart.
    pub fn resumed(persisted: PersistedSession) -> Self {
        let mut state = Self {
            user_id: persisted.user_id,
            session_id: persisted.session_id,
            previous_session_id: persisted.previous_session_id,
            session_index: persisted.session_index,
            first_event_id: None,
            background: false,
            last_accessed: Instant::now(),
        };
        state.rotate();
        state
    }

    /// Starts a new session: fresh id, previous takes the current id, index grows by one.
    pub fn rotate(&mut self) {
        let next = Uuid::new_v4().to_string();
        self.previous_session_id = Some(std::mem::replace(&mut self.session_id, next));
        self.session_index = self.session_index.saturating_add(1);
        self.first_event_id = None;
        self.last_accessed = Instant::now();
    }

    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    pub fn persisted(&self) -> PersistedSession {
        PersistedSession {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            previous_session_id: self.previous_session_id.clone(),
            session_index: self.session_index,
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            previous_session_id: self.previous_session_id.clone(),
            session_index: self.session_index,
            first_event_id: self.first_event_id.clone(),
            storage_mechanism: STORAGE_MECHANISM.to_string(),
        }
    }
}

/// Snapshot of the session attached to an outgoing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub user_id: String,
    pub session_id: String,
    pub previous_session_id: Option<String>,
    pub session_index: u32,
    pub first_event_id: Option<String>,
    pub storage_mechanism: String,
}

impl SessionContext {
    pub fn to_self_describing(&self) -> serde_json::Value {
        json!({
            "schema": CLIENT_SESSION_SCHEMA,
            "data": self,
        })
    }
}
