//! Handle tying storage, queue, endpoint, emitter and session together.

use crate::buffer::PersistentBlockingQueue;
use crate::domain::{Payload, RecordId, TrackerError};
use crate::emitter::{
    Emitter, EmitterConfig, EmitterStats, FlushOutcome, OnlinePredicate, SendCallback,
};
use crate::session::{ClientSession, SessionConfig, SessionContext};
use crate::sender::{Endpoint, EndpointConfig};
use crate::storage::{self, StorageConfig};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

pub const CONTEXTS_SCHEMA: &str = "iglu:com.snowplowanalytics.snowplow/contexts/jsonschema/1-0-1";
/// Payload key holding the JSON contexts envelope
pub const CONTEXTS_KEY: &str = "co";
/// Payload key holding the event id
pub const EVENT_ID_KEY: &str = "eid";

#[derive(Clone, Default)]
pub struct TrackerSettings {
    pub storage: StorageConfig,
    pub endpoint: EndpointConfig,
    pub emitter: EmitterConfig,
    pub session: Option<SessionConfig>,
    pub on_send: Option<SendCallback>,
    pub is_online: Option<OnlinePredicate>,
    /// Start the background emitter on construction
    pub start_emitter: bool,
}

impl std::fmt::Debug for TrackerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerSettings")
            .field("storage", &self.storage)
            .field("endpoint", &self.endpoint)
            .field("emitter", &self.emitter)
            .field("session", &self.session)
            .field("on_send", &self.on_send.is_some())
            .field("is_online", &self.is_online.is_some())
            .field("start_emitter", &self.start_emitter)
            .finish()
    }
}

/// One independent tracking pipeline. Create as many as needed; none is global.
#[derive(Debug)]
pub struct Tracker {
    queue: Arc<PersistentBlockingQueue>,
    emitter: Emitter,
    session: Option<ClientSession>,
}

impl Tracker {
    pub fn new(settings: TrackerSettings) -> Result<Self, TrackerError> {
        let storage = storage::open(&settings.storage)?;
        let queue = Arc::new(PersistentBlockingQueue::new(storage));
        let endpoint = Endpoint::new(settings.endpoint)?;

        let emitter = Emitter::new(Arc::clone(&queue), endpoint, settings.emitter)?;
        emitter.set_send_callback(settings.on_send);
        emitter.set_online_check(settings.is_online);

        let session = settings.session.map(ClientSession::open).transpose()?;

        if settings.start_emitter {
            emitter.start()?;
        }

        info!(
            "Tracker ready ({} events pending, session {})",
            queue.len()?,
            if session.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            queue,
            emitter,
            session,
        })
    }

    /// Queues one event, attaching the client session context when the event has an id.
    pub fn track(&self, payload: Payload) -> Result<RecordId, TrackerError> {
        let payload = self.with_session_context(payload)?;
        let ids = self.queue.enqueue(vec![payload])?;
        // One payload in, one id out
        Ok(ids[0])
    }

    pub fn track_all(&self, payloads: Vec<Payload>) -> Result<Vec<RecordId>, TrackerError> {
        let payloads = payloads
            .into_iter()
            .map(|payload| self.with_session_context(payload))
            .collect::<Result<Vec<_>, _>>()?;
        let ids = self.queue.enqueue(payloads)?;
        debug!("Tracked {} events", ids.len());
        Ok(ids)
    }

    fn with_session_context(&self, mut payload: Payload) -> Result<Payload, TrackerError> {
        let Some(session) = &self.session else {
            return Ok(payload);
        };
        let Some(event_id) = payload.get(EVENT_ID_KEY).map(str::to_string) else {
            return Ok(payload);
        };

        let context = session.get_session_context(&event_id)?;
        let contexts = append_context(payload.get(CONTEXTS_KEY), &context);
        payload.insert(CONTEXTS_KEY, contexts);
        Ok(payload)
    }

    pub fn set_background(&self, background: bool) -> Result<(), TrackerError> {
        if let Some(session) = &self.session {
            session.set_background(background)?;
        }
        Ok(())
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub async fn flush(&self, disable_restart: bool) -> Result<FlushOutcome, TrackerError> {
        Ok(self.emitter.flush(disable_restart).await?)
    }

    pub fn stats(&self) -> EmitterStats {
        self.emitter.stats()
    }

    pub fn queue_len(&self) -> Result<usize, TrackerError> {
        Ok(self.queue.len()?)
    }

    pub async fn close(&self) {
        self.emitter.close().await;
        if let Some(session) = &self.session {
            session.stop().await;
        }
        info!("Tracker closed");
    }
}

/// Adds the session context to an existing contexts envelope, or starts a new one.
fn append_context(existing: Option<&str>, context: &SessionContext) -> String {
    let session = context.to_self_describing();

    let mut envelope = existing
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .filter(|value| value["data"].is_array())
        .unwrap_or_else(|| json!({ "schema": CONTEXTS_SCHEMA, "data": [] }));

    if let Some(data) = envelope["data"].as_array_mut() {
        data.push(session);
    }
    envelope.to_string()
}
