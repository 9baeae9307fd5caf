use crate::domain::{Payload, RecordId};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use url::Url;

pub const PAYLOAD_DATA_SCHEMA: &str =
    "iglu:com.snowplowanalytics.snowplow/payload_data/jsonschema/1-0-0";

/// Field carrying the send timestamp, set on every event right before it goes out.
pub const SENT_TIMESTAMP_KEY: &str = "stm";

const ENVELOPE_SUFFIX: &[u8] = b"]}";

/// Everything but RFC 3986 unreserved characters is escaped; a space becomes `%20`.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// A physical request decided on before anything hits the network.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedRequest {
    Get { ids: Vec<RecordId>, url: Url },
    Post { ids: Vec<RecordId>, body: Vec<u8> },
    /// A single event too large for the transport; never sent
    Oversize { ids: Vec<RecordId>, size: usize },
}

impl PlannedRequest {
    pub fn ids(&self) -> &[RecordId] {
        match self {
            PlannedRequest::Get { ids, .. }
            | PlannedRequest::Post { ids, .. }
            | PlannedRequest::Oversize { ids, .. } => ids,
        }
    }
}

fn stamped(payload: &Payload, sent_at: &str) -> Payload {
    let mut payload = payload.clone();
    payload.insert(SENT_TIMESTAMP_KEY, sent_at);
    payload
}

/// Appends the payload to the GET endpoint as percent-encoded query pairs.
pub fn get_request_url(base: &Url, payload: &Payload) -> Url {
    let query = payload
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, QUERY_COMPONENT),
                utf8_percent_encode(value, QUERY_COMPONENT)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    let mut url = base.clone();
    url.set_query((!query.is_empty()).then_some(query.as_str()));
    url
}

/// One request per event. An event whose full URL exceeds `byte_limit` is oversize.
pub fn plan_get_requests(
    base: &Url,
    events: &[(RecordId, Payload)],
    byte_limit: usize,
    sent_at: &str,
) -> Vec<PlannedRequest> {
    events
        .iter()
        .map(|(id, payload)| {
            let url = get_request_url(base, &stamped(payload, sent_at));
            let size = url.as_str().len();
            if size > byte_limit {
                PlannedRequest::Oversize { ids: vec![*id], size }
            } else {
                PlannedRequest::Get { ids: vec![*id], url }
            }
        })
        .collect()
}

fn envelope_prefix() -> Vec<u8> {
    format!(r#"{{"schema":"{PAYLOAD_DATA_SCHEMA}","data":["#).into_bytes()
}

/// Serialized size of an envelope holding `data_len` bytes of comma-joined events.
fn envelope_size(prefix_len: usize, data_len: usize) -> usize {
    prefix_len + data_len + ENVELOPE_SUFFIX.len()
}

struct PostBatch {
    ids: Vec<RecordId>,
    data: Vec<u8>,
}

impl PostBatch {
    fn new() -> Self {
        Self {
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    fn size_with(&self, prefix_len: usize, event_len: usize) -> usize {
        let separator = usize::from(!self.ids.is_empty());
        envelope_size(prefix_len, self.data.len() + separator + event_len)
    }

    fn push(&mut self, id: RecordId, event: &[u8]) {
        if !self.ids.is_empty() {
            self.data.push(b',');
        }
        self.data.extend_from_slice(event);
        self.ids.push(id);
    }

    fn into_request(self, prefix: &[u8]) -> PlannedRequest {
        let mut body = Vec::with_capacity(envelope_size(prefix.len(), self.data.len()));
        body.extend_from_slice(prefix);
        body.extend_from_slice(&self.data);
        body.extend_from_slice(ENVELOPE_SUFFIX);
        PlannedRequest::Post {
            ids: self.ids,
            body,
        }
    }
}

/// Greedily packs events, in order, into self-describing `payload_data` bodies
/// no larger than `byte_limit`. An event that cannot fit even alone is oversize.
pub fn plan_post_requests(
    events: &[(RecordId, Payload)],
    byte_limit: usize,
    sent_at: &str,
) -> Result<Vec<PlannedRequest>, serde_json::Error> {
    let prefix = envelope_prefix();
    let mut requests = Vec::new();
    let mut current = PostBatch::new();

    for (id, payload) in events {
        let event = serde_json::to_vec(&stamped(payload, sent_at))?;

        let alone = envelope_size(prefix.len(), event.len());
        if alone > byte_limit {
            requests.push(PlannedRequest::Oversize {
                ids: vec![*id],
                size: alone,
            });
            continue;
        }

        if current.size_with(prefix.len(), event.len()) > byte_limit {
            let full = std::mem::replace(&mut current, PostBatch::new());
            requests.push(full.into_request(&prefix));
        }
        current.push(*id, &event);
    }

    if !current.ids.is_empty() {
        requests.push(current.into_request(&prefix));
    }

    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(count: u64, value_len: usize) -> Vec<(RecordId, Payload)> {
        (1..=count)
            .map(|n| {
                (
                    RecordId(n),
                    Payload::new().with("e", "se").with("se_la", "x".repeat(value_len)),
                )
            })
            .collect()
    }

    #[test]
    fn test_get_url_encodes_query() {
        let base: Url = "https://collector.example.com/i".parse().unwrap();
        let payload = Payload::new().with("e", "pv").with("url", "https://a.b/?q=1&r=2");
        let url = get_request_url(&base, &payload);
        assert_eq!(
            url.as_str(),
            "https://collector.example.com/i?e=pv&url=https%3A%2F%2Fa.b%2F%3Fq%3D1%26r%3D2"
        );
    }

    #[test]
    fn test_get_url_uses_percent_encoding_for_spaces() {
        let base: Url = "https://collector.example.com/i".parse().unwrap();
        let payload = Payload::new()
            .with("page", "Hello World+More")
            .with("se_la", "caf\u{e9}~ok");
        let url = get_request_url(&base, &payload);
        assert_eq!(
            url.query(),
            Some("page=Hello%20World%2BMore&se_la=caf%C3%A9~ok")
        );

        let decoded: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(decoded[0], ("page".to_string(), "Hello World+More".to_string()));
    }

    #[test]
    fn test_get_plan_marks_oversize_events() {
        let base: Url = "https://collector.example.com/i".parse().unwrap();
        let mut batch = events(2, 10);
        batch.push((RecordId(3), Payload::new().with("e", "se").with("se_la", "y".repeat(500))));

        let plans = plan_get_requests(&base, &batch, 200, "1700000000000");
        assert_eq!(plans.len(), 3);
        assert!(matches!(plans[0], PlannedRequest::Get { .. }));
        assert!(matches!(plans[1], PlannedRequest::Get { .. }));
        assert!(matches!(&plans[2], PlannedRequest::Oversize { ids, .. } if ids == &vec![RecordId(3)]));

        if let PlannedRequest::Get { url, .. } = &plans[0] {
            assert!(url.query().unwrap().contains("stm=1700000000000"));
        }
    }

    #[test]
    fn test_post_body_is_self_describing_envelope() {
        let plans = plan_post_requests(&events(2, 3), 40_000, "1700000000000").unwrap();
        assert_eq!(plans.len(), 1);

        let PlannedRequest::Post { ids, body } = &plans[0] else {
            panic!("expected a POST request");
        };
        assert_eq!(ids, &vec![RecordId(1), RecordId(2)]);

        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["schema"], PAYLOAD_DATA_SCHEMA);
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
        assert_eq!(json["data"][0]["stm"], "1700000000000");
        assert_eq!(json["data"][1]["se_la"], "xxx");
    }

    #[test]
    fn test_post_packs_within_byte_limit() {
        let batch = events(10, 100);
        let limit = 500;
        let plans = plan_post_requests(&batch, limit, "1700000000000").unwrap();

        assert!(plans.len() > 1);
        let mut seen = Vec::new();
        for plan in &plans {
            let PlannedRequest::Post { ids, body } = plan else {
                panic!("no event should be oversize");
            };
            assert!(body.len() <= limit, "body of {} bytes", body.len());
            seen.extend_from_slice(ids);
        }
        // Every event lands in exactly one request, order preserved
        assert_eq!(seen, batch.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_isolates_oversize_event() {
        let mut batch = events(2, 10);
        batch.insert(1, (RecordId(99), Payload::new().with("e", "se").with("se_la", "z".repeat(1000))));

        let plans = plan_post_requests(&batch, 300, "1700000000000").unwrap();
        let oversize: Vec<&PlannedRequest> = plans
            .iter()
            .filter(|p| matches!(p, PlannedRequest::Oversize { .. }))
            .collect();
        assert_eq!(oversize.len(), 1);
        assert_eq!(oversize[0].ids(), &[RecordId(99)]);

        let sent: Vec<RecordId> = plans
            .iter()
            .filter(|p| matches!(p, PlannedRequest::Post { .. }))
            .flat_map(|p| p.ids().to_vec())
            .collect();
        assert_eq!(sent, vec![RecordId(1), RecordId(2)]);
    }
}
