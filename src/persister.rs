// src/persister.rs
//! Bus-to-store sink.
//!
//! Two persister instances run in a typical deployment: one drains the
//! metrics topic (filling in missing timestamps and attaching the
//! `dimensions_hash` grouping digest), one drains the alarms topic and
//! passes events through unchanged. Documents are bulk-written into the
//! index the strategy resolves at write time.

use crate::bus::BusConsumer;
use crate::error::Result;
use crate::ingest::unwrap_envelope;
use crate::store::StoreClient;
use crate::types::now_secs;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;

pub struct Persister {
    bus: BusConsumer,
    store: StoreClient,
    /// Apply the metrics transform (timestamp fill, dimension hash).
    fix_metrics: bool,
}

impl Persister {
    pub fn new(bus: BusConsumer, store: StoreClient, fix_metrics: bool) -> Self {
        Self {
            bus,
            store,
            fix_metrics,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("persister started (fix_metrics={})", self.fix_metrics);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.bus.recv() => match received {
                    Ok(payload) => {
                        if let Some(lines) = prepare(&payload, self.fix_metrics) {
                            match self.store.bulk(lines).await {
                                Ok(status) if status.is_success() => {
                                    debug!("persisted record with status {}", status)
                                }
                                Ok(status) => warn!("store rejected record: {}", status),
                                Err(e) => error!("store write failed: {}", e),
                            }
                        }
                        if let Err(e) = self.bus.commit().await {
                            warn!("offset commit failed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("persister receive failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        self.bus.close().await;
        info!("persister stopped");
    }
}

/// Decode one bus record into bulk action/document lines. Returns `None`
/// for records that cannot be parsed; the loop skips them.
fn prepare(payload: &[u8], fix_metrics: bool) -> Option<String> {
    let record: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("skipping malformed record: {}", e);
            return None;
        }
    };
    // a compact-mode producer may deliver a whole list in one record
    let records = match record {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut lines = String::new();
    for record in records {
        let mut doc = unwrap_envelope(record);
        if fix_metrics {
            fix_metric(&mut doc);
        }
        lines.push_str("{\"index\":{}}\n");
        lines.push_str(&doc.to_string());
        lines.push('\n');
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines)
    }
}

/// Fill a missing `timestamp` and attach `dimensions_hash` so stored
/// samples can be grouped by dimension set.
fn fix_metric(doc: &mut Value) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    let needs_timestamp = obj
        .get("timestamp")
        .map(|t| t.is_null())
        .unwrap_or(true);
    if needs_timestamp {
        if let Some(now) = serde_json::Number::from_f64(now_secs()) {
            obj.insert("timestamp".to_string(), Value::Number(now));
        }
    }

    let has_hash = obj
        .get("dimensions_hash")
        .map(|h| !h.is_null())
        .unwrap_or(false);
    if !has_hash {
        if let Some(dimensions) = obj.get("dimensions").filter(|d| d.is_object()) {
            // serde_json serializes object keys sorted, which makes this a
            // canonical digest of the dimension set
            let canonical = dimensions.to_string();
            let digest = format!("{:x}", md5::compute(canonical.as_bytes()));
            obj.insert("dimensions_hash".to_string(), Value::String(digest));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::dimensions_hash;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn fix_fills_missing_timestamp() {
        let mut doc = json!({"name": "cpu", "dimensions": {"h": "1"}, "value": 1.0});
        fix_metric(&mut doc);
        assert!(doc["timestamp"].is_number());
    }

    #[test]
    fn fix_keeps_existing_timestamp() {
        let mut doc = json!({"name": "cpu", "timestamp": 1405630174.0, "value": 1.0});
        fix_metric(&mut doc);
        assert_eq!(doc["timestamp"], 1405630174.0);
    }

    #[test]
    fn fix_attaches_canonical_dimension_hash() {
        let mut doc = json!({
            "name": "cpu",
            "timestamp": 1.0,
            "value": 1.0,
            "dimensions": {"key2": "value2", "key1": "value1"}
        });
        fix_metric(&mut doc);
        let mut dims = HashMap::new();
        dims.insert("key1".to_string(), "value1".to_string());
        dims.insert("key2".to_string(), "value2".to_string());
        assert_eq!(doc["dimensions_hash"], dimensions_hash(&dims));
    }

    #[test]
    fn fix_without_dimensions_adds_no_hash() {
        let mut doc = json!({"name": "cpu", "timestamp": 1.0, "value": 1.0});
        fix_metric(&mut doc);
        assert!(doc.get("dimensions_hash").is_none());
    }

    #[test]
    fn prepare_unwraps_the_bus_envelope() {
        let record = json!({
            "metric": {"name": "cpu", "dimensions": {}, "timestamp": 5.0, "value": 1.0},
            "meta": {"tenantId": "t", "region": null},
            "creation_time": 6.0
        });
        let lines = prepare(&serde_json::to_vec(&record).unwrap(), true).unwrap();
        let parsed: Value = serde_json::from_str(lines.lines().nth(1).unwrap()).unwrap();
        assert_eq!(parsed["name"], "cpu");
        assert!(parsed.get("meta").is_none());
    }

    #[test]
    fn prepare_passes_alarms_through() {
        let event = json!({"id": "e1", "state": "ALARM"});
        let lines = prepare(&serde_json::to_vec(&event).unwrap(), false).unwrap();
        assert_eq!(lines.lines().next().unwrap(), "{\"index\":{}}");
        let parsed: Value = serde_json::from_str(lines.lines().nth(1).unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn prepare_fans_a_list_record_into_multiple_bulk_lines() {
        let record = json!([
            {"metric": {"name": "a", "dimensions": {}, "timestamp": 1.0, "value": 1.0}},
            {"metric": {"name": "b", "dimensions": {}, "timestamp": 2.0, "value": 2.0}}
        ]);
        let lines = prepare(&serde_json::to_vec(&record).unwrap(), true).unwrap();
        assert_eq!(lines.lines().count(), 4);
    }

    #[test]
    fn prepare_skips_garbage() {
        assert!(prepare(b"not json", true).is_none());
    }
}
