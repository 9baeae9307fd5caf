use serde_json::Value;
use snowplow_emitter::domain::Payload;
use snowplow_emitter::sender::{EndpointConfig, HttpMethod, Scheme};
use snowplow_emitter::session::{CLIENT_SESSION_SCHEMA, SessionConfig};
use snowplow_emitter::storage::{StorageBackend, StorageConfig};
use snowplow_emitter::tracker::{CONTEXTS_SCHEMA, Tracker, TrackerSettings};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method};

fn settings(server: &MockServer, dir: &TempDir) -> TrackerSettings {
    TrackerSettings {
        storage: StorageConfig {
            backend: StorageBackend::Spool,
            path: dir.path().join("queue"),
            ..Default::default()
        },
        endpoint: EndpointConfig {
            host: "127.0.0.1".to_string(),
            scheme: Scheme::Http,
            port: Some(server.address().port()),
            method: HttpMethod::Post,
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
        session: Some(SessionConfig {
            path: dir.path().join("session.json"),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn collector(status: u16) -> MockServer {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&mock_server)
        .await;
    mock_server
}

#[tokio::test]
async fn test_tracked_events_carry_session_context() {
    let mock_server = collector(200).await;
    let temp_dir = TempDir::new().unwrap();
    let tracker = Tracker::new(settings(&mock_server, &temp_dir)).unwrap();

    tracker
        .track(Payload::new().with("e", "pv").with("eid", "event-1"))
        .unwrap();
    // Without an event id no session context is attached
    tracker.track(Payload::new().with("e", "pv")).unwrap();

    let outcome = tracker.flush(true).await.unwrap();
    assert_eq!(outcome.attempted, 2);
    assert_eq!(outcome.failed, 0);
    assert_eq!(tracker.queue_len().unwrap(), 0);

    let requests = mock_server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let data = body["data"].as_array().unwrap();

    let contexts: Value = serde_json::from_str(data[0]["co"].as_str().unwrap()).unwrap();
    assert_eq!(contexts["schema"], CONTEXTS_SCHEMA);
    assert_eq!(contexts["data"][0]["schema"], CLIENT_SESSION_SCHEMA);
    assert_eq!(contexts["data"][0]["data"]["firstEventId"], "event-1");
    assert!(data[1].get("co").is_none());

    tracker.close().await;
}

#[tokio::test]
async fn test_failed_events_survive_tracker_restart() {
    let temp_dir = TempDir::new().unwrap();

    {
        let failing = collector(500).await;
        let tracker = Tracker::new(settings(&failing, &temp_dir)).unwrap();
        tracker
            .track_all(vec![
                Payload::new().with("e", "pv").with("eid", "a"),
                Payload::new().with("e", "pv").with("eid", "b"),
            ])
            .unwrap();
        let outcome = tracker.flush(true).await.unwrap();
        assert_eq!(outcome.failed, 2);
        tracker.close().await;
    }

    let healthy = collector(200).await;
    let sent = Arc::new(AtomicUsize::new(0));
    let tracker = {
        let sent = Arc::clone(&sent);
        let mut settings = settings(&healthy, &temp_dir);
        settings.on_send = Some(Arc::new(move |ok: usize, _failed: usize| {
            sent.fetch_add(ok, Ordering::SeqCst);
        }));
        Tracker::new(settings).unwrap()
    };

    assert_eq!(tracker.queue_len().unwrap(), 2);
    let outcome = tracker.flush(true).await.unwrap();
    assert_eq!(outcome.succeeded(), 2);
    assert_eq!(sent.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.queue_len().unwrap(), 0);
    tracker.close().await;
}

#[tokio::test]
async fn test_started_tracker_sends_in_background() {
    let mock_server = collector(200).await;
    let temp_dir = TempDir::new().unwrap();
    let tracker = Tracker::new(TrackerSettings {
        start_emitter: true,
        session: None,
        ..settings(&mock_server, &temp_dir)
    })
    .unwrap();
    assert!(tracker.emitter().is_running());
    assert!(tracker.session().is_none());

    tracker.track(Payload::new().with("e", "pv")).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tracker.stats().events_sent == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tracker.queue_len().unwrap(), 0);
    assert_eq!(tracker.stats().events_sent, 1);
    tracker.close().await;
}
