// src/api/ingestion.rs
//! Sample ingestion endpoints: validate, augment, envelope, hand to the
//! bus. Nothing invalid is forwarded.

use super::SharedState;
use crate::ingest;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use log::{debug, warn};
use serde_json::Value;

/// `POST /v2.0/metrics`
pub async fn post_metrics(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    ingest_body(&state, &headers, &body, "metric", ingest::is_valid_metric).await
}

/// `POST /v2.0/meters` (compatibility ingestion path)
pub async fn post_meters(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    ingest_body(&state, &headers, &body, "meter", ingest::is_valid_meter).await
}

async fn ingest_body(
    state: &SharedState,
    headers: &HeaderMap,
    body: &[u8],
    kind: &str,
    check: fn(&Value) -> bool,
) -> StatusCode {
    let mut parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            debug!("rejecting unparseable {} post: {}", kind, e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if !ingest::validate_body(&parsed, check) {
        debug!("rejecting invalid {} post", kind);
        return StatusCode::BAD_REQUEST;
    }

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    ingest::augment(&mut parsed, &header_pairs);

    let tenant_id = headers
        .get("x-project-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let enveloped = ingest::envelope_body(kind, parsed, tenant_id.as_deref());

    let payload = match serde_json::to_vec(&enveloped) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("cannot serialize {} envelope: {}", kind, e);
            return StatusCode::BAD_REQUEST;
        }
    };
    match state.producer.send(&payload).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            warn!("bus send failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiState;
    use crate::bus::BusProducer;
    use crate::config::{BusConfig, StoreConfig};
    use crate::store::StoreClient;
    use crate::strategy::FixedStrategy;
    use std::sync::Arc;

    fn state() -> SharedState {
        let bus = BusConfig {
            drop_data: true,
            ..Default::default()
        };
        let store_cfg = StoreConfig {
            uri: "http://localhost:9200/".to_string(),
            drop_data: true,
        };
        let strategy = Arc::new(FixedStrategy::new("t"));
        let client = |doc_type: &str| {
            StoreClient::new(&store_cfg, "data_", doc_type, strategy.clone()).unwrap()
        };
        Arc::new(ApiState {
            producer: BusProducer::new(&bus, "metrics").unwrap(),
            metrics_store: client("metrics"),
            definitions_store: client("alarmdefinitions"),
            alarms_store: client("alarms"),
            methods_store: client("notificationmethods"),
            size: 100,
        })
    }

    #[tokio::test]
    async fn missing_required_fields_get_400() {
        let status = post_metrics(
            State(state()),
            HeaderMap::new(),
            Bytes::from(r#"{"name":"x","value":1}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_gets_400() {
        let status =
            post_metrics(State(state()), HeaderMap::new(), Bytes::from("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn valid_sample_returns_204() {
        let body = r#"{"name":"cpu","dimensions":{"host":"h1"},"timestamp":1405630174,"value":1.0}"#;
        let status = post_metrics(State(state()), HeaderMap::new(), Bytes::from(body)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn list_bodies_are_accepted_and_checked_per_sample() {
        let good = r#"[{"name":"a","dimensions":{},"timestamp":1,"value":1},
                       {"name":"b","dimensions":{},"timestamp":2,"value":2}]"#;
        let status = post_metrics(State(state()), HeaderMap::new(), Bytes::from(good)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let mixed = r#"[{"name":"a","dimensions":{},"timestamp":1,"value":1},
                        {"name":"broken"}]"#;
        let status = post_metrics(State(state()), HeaderMap::new(), Bytes::from(mixed)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn meter_contract() {
        let meter = r#"{
            "counter_name": "instance",
            "counter_volume": 1.0,
            "message_id": "m-1",
            "project_id": "p-1",
            "source": "openstack",
            "timestamp": "2016-04-21T00:07:20",
            "user_id": "u-1"
        }"#;
        let status = post_meters(State(state()), HeaderMap::new(), Bytes::from(meter)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let status =
            post_meters(State(state()), HeaderMap::new(), Bytes::from(r#"{"counter_name":"x"}"#))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
