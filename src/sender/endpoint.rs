use super::client::{ClientStats, CollectorUrl, ConnectionStats, EndpointConfig, EndpointError, HttpMethod};
use super::serialization::{PlannedRequest, plan_get_requests, plan_post_requests};
use crate::domain::{Payload, RecordId};
use futures::stream::{self, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of one physical request (or of an oversize event that was never sent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResult {
    pub item_ids: Vec<RecordId>,
    pub oversize: bool,
    /// `None` when nothing came back: oversize, network failure or timeout
    pub status: Option<u16>,
}

impl RequestResult {
    pub fn is_success(&self) -> bool {
        !self.oversize && self.status == Some(StatusCode::OK.as_u16())
    }
}

/// Per-batch outcome, partitioned by storage id.
///
/// `success_ids` and `failure_ids` together hold every submitted id exactly
/// once. `oversize_ids` is the subset of `failure_ids` that can never succeed
/// as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResult {
    pub success_ids: Vec<RecordId>,
    pub failure_ids: Vec<RecordId>,
    pub oversize_ids: Vec<RecordId>,
}

impl SendResult {
    pub fn from_requests(results: impl IntoIterator<Item = RequestResult>) -> Self {
        let mut send_result = Self::default();
        for result in results {
            if result.is_success() {
                send_result.success_ids.extend(result.item_ids);
            } else {
                if result.oversize {
                    send_result.oversize_ids.extend(result.item_ids.iter().copied());
                }
                send_result.failure_ids.extend(result.item_ids);
            }
        }
        send_result.success_ids.sort_unstable();
        send_result.failure_ids.sort_unstable();
        send_result.oversize_ids.sort_unstable();
        send_result
    }

    pub fn success_count(&self) -> usize {
        self.success_ids.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failure_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.success_ids.is_empty() && self.failure_ids.is_empty()
    }
}

/// Turns batches of payloads into collector requests.
#[derive(Debug, Clone)]
pub struct Endpoint {
    client: Client,
    config: EndpointConfig,
    urls: CollectorUrl,
    stats: Arc<ClientStats>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        config.validate()?;
        let urls = CollectorUrl::new(&config.host, config.scheme, config.port)?;

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .user_agent(&config.user_agent)
            .build()?;

        debug!(
            "Collector endpoint ready: {} ({:?})",
            urls.for_method(config.method),
            config.method
        );

        Ok(Self {
            client,
            config,
            urls,
            stats: Arc::new(ClientStats::new()),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn urls(&self) -> &CollectorUrl {
        &self.urls
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.stats.snapshot(self.config.max_concurrent_requests)
    }

    /// Sends every event, at most `max_concurrent_requests` requests at a time.
    ///
    /// Never fails as a whole: network errors, timeouts, non-200 responses and
    /// oversize events all land in `failure_ids`.
    pub async fn send(&self, events: &[(RecordId, Payload)]) -> SendResult {
        if events.is_empty() {
            return SendResult::default();
        }

        let sent_at = chrono::Utc::now().timestamp_millis().to_string();
        let plans = match self.plan(events, &sent_at) {
            Ok(plans) => plans,
            Err(e) => {
                warn!("Failed to serialize batch of {} events: {}", events.len(), e);
                let mut failure_ids: Vec<RecordId> = events.iter().map(|(id, _)| *id).collect();
                failure_ids.sort_unstable();
                return SendResult {
                    failure_ids,
                    ..Default::default()
                };
            }
        };

        let results: Vec<RequestResult> = stream::iter(plans)
            .map(|plan| self.execute(plan))
            .buffer_unordered(self.config.max_concurrent_requests)
            .collect()
            .await;

        let send_result = SendResult::from_requests(results);
        debug!(
            "Sent {} events: {} succeeded, {} failed ({} oversize)",
            events.len(),
            send_result.success_count(),
            send_result.failure_count(),
            send_result.oversize_ids.len()
        );
        send_result
    }

    fn plan(
        &self,
        events: &[(RecordId, Payload)],
        sent_at: &str,
    ) -> Result<Vec<PlannedRequest>, serde_json::Error> {
        match self.config.method {
            HttpMethod::Get => Ok(plan_get_requests(
                self.urls.get_url(),
                events,
                self.config.byte_limit_get,
                sent_at,
            )),
            HttpMethod::Post => plan_post_requests(events, self.config.byte_limit_post, sent_at),
        }
    }

    async fn execute(&self, plan: PlannedRequest) -> RequestResult {
        let (ids, request, bytes) = match plan {
            PlannedRequest::Oversize { ids, size } => {
                warn!(
                    "Event {:?} is {} bytes, over the {:?} limit; not sending",
                    ids, size, self.config.method
                );
                self.stats.record_oversize(ids.len());
                return RequestResult {
                    item_ids: ids,
                    oversize: true,
                    status: None,
                };
            }
            PlannedRequest::Get { ids, url } => {
                let bytes = url.as_str().len();
                (ids, self.client.get(url), bytes)
            }
            PlannedRequest::Post { ids, body } => {
                let bytes = body.len();
                let request = self
                    .client
                    .post(self.urls.post_url().clone())
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .body(body);
                (ids, request, bytes)
            }
        };

        self.stats.request_started();
        let start = Instant::now();
        let status = match request.send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                warn!("Request for {} events failed: {}", ids.len(), e);
                None
            }
        };
        let latency = start.elapsed();
        self.stats.request_finished();

        let result = RequestResult {
            item_ids: ids,
            oversize: false,
            status,
        };
        self.stats.record_request(result.is_success(), bytes, latency);

        if let Some(code) = status.filter(|_| !result.is_success()) {
            warn!(
                "Collector answered HTTP {} for {} events",
                code,
                result.item_ids.len()
            );
        }
        result
    }
}
