// src/ingest.rs
//! Validation and normalization of inbound metric and meter payloads.
//!
//! A POST body is either a single sample object or a list of them. Bodies
//! that fail validation are rejected with 400 before anything reaches the
//! bus. Valid samples are optionally augmented with identity fields taken
//! from request headers, then wrapped in the internal envelope the
//! downstream consumers expect.

use crate::types::now_secs;
use serde_json::{json, Value};

/// Identity headers copied onto each posted sample when present.
pub const IDENTITY_HEADERS: [(&str, &str); 6] = [
    ("x-tenant", "tenant"),
    ("x-tenant-id", "tenant_id"),
    ("x-user", "user"),
    ("user-agent", "user_agent"),
    ("x-project-id", "project_id"),
    ("x-user-id", "user_id"),
];

/// Check one metric sample: non-empty string `name`, object `dimensions`,
/// numeric `timestamp` and numeric `value` are all required.
pub fn is_valid_metric(sample: &Value) -> bool {
    let Some(obj) = sample.as_object() else {
        return false;
    };
    obj.get("name").and_then(Value::as_str).map(|n| !n.is_empty()) == Some(true)
        && obj.get("dimensions").map(Value::is_object) == Some(true)
        && obj.get("timestamp").map(Value::is_number) == Some(true)
        && obj.get("value").map(Value::is_number) == Some(true)
}

/// Check one meter sample in the compatibility format. Required fields
/// must be present and truthy, so a zero `counter_volume` or an empty
/// string is rejected.
pub fn is_valid_meter(sample: &Value) -> bool {
    let Some(obj) = sample.as_object() else {
        return false;
    };
    const REQUIRED: [&str; 7] = [
        "counter_name",
        "counter_volume",
        "message_id",
        "project_id",
        "source",
        "timestamp",
        "user_id",
    ];
    REQUIRED
        .iter()
        .all(|f| obj.get(*f).map(is_truthy).unwrap_or(false))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Validate a whole body (single object or list) with the given per-sample
/// check.
pub fn validate_body(body: &Value, check: fn(&Value) -> bool) -> bool {
    match body {
        Value::Array(samples) => !samples.is_empty() && samples.iter().all(check),
        other => check(other),
    }
}

/// Copy identity values onto every sample of the body. `headers` yields
/// lower-cased header names with their values.
pub fn augment(body: &mut Value, headers: &[(String, String)]) {
    let inject = |sample: &mut Value| {
        if let Some(obj) = sample.as_object_mut() {
            for (header, field) in IDENTITY_HEADERS {
                if let Some((_, value)) = headers.iter().find(|(h, _)| h == header) {
                    obj.insert(field.to_string(), Value::String(value.clone()));
                }
            }
        }
    };
    match body {
        Value::Array(samples) => samples.iter_mut().for_each(inject),
        other => inject(other),
    }
}

/// Wrap one validated sample in the internal bus envelope.
pub fn envelope(kind: &str, sample: Value, tenant_id: Option<&str>) -> Value {
    json!({
        kind: sample,
        "meta": {
            "tenantId": tenant_id,
            "region": Value::Null,
        },
        "creation_time": now_secs(),
    })
}

/// Envelope every sample of a body, preserving single-vs-list shape.
pub fn envelope_body(kind: &str, body: Value, tenant_id: Option<&str>) -> Value {
    match body {
        Value::Array(samples) => Value::Array(
            samples
                .into_iter()
                .map(|s| envelope(kind, s, tenant_id))
                .collect(),
        ),
        other => envelope(kind, other, tenant_id),
    }
}

/// Unwrap the bus envelope back to the raw sample. Records that were never
/// enveloped pass through unchanged.
pub fn unwrap_envelope(mut record: Value) -> Value {
    if let Some(obj) = record.as_object_mut() {
        if let Some(inner) = obj.remove("metric").or_else(|| obj.remove("meter")) {
            return inner;
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_metric() {
        let m = json!({
            "name": "cpu.load",
            "dimensions": {"host": "h1"},
            "timestamp": 1405630174,
            "value": 1.0
        });
        assert!(is_valid_metric(&m));
    }

    #[test]
    fn metric_missing_fields_is_invalid() {
        assert!(!is_valid_metric(&json!({"name": "x", "value": 1})));
        assert!(!is_valid_metric(&json!({
            "name": "", "dimensions": {}, "timestamp": 1, "value": 1
        })));
        assert!(!is_valid_metric(&json!({
            "name": "x", "dimensions": [], "timestamp": 1, "value": 1
        })));
        assert!(!is_valid_metric(&json!({
            "name": "x", "dimensions": {}, "timestamp": "then", "value": 1
        })));
        assert!(!is_valid_metric(&json!("not an object")));
    }

    #[test]
    fn empty_dimensions_are_allowed() {
        let m = json!({
            "name": "cpu", "dimensions": {}, "timestamp": 1.5, "value": 0
        });
        assert!(is_valid_metric(&m));
    }

    #[test]
    fn body_validation_covers_lists() {
        let good = json!({
            "name": "cpu", "dimensions": {}, "timestamp": 1, "value": 1
        });
        let bad = json!({"name": "cpu"});
        assert!(validate_body(&json!([good.clone(), good.clone()]), is_valid_metric));
        assert!(!validate_body(&json!([good, bad]), is_valid_metric));
        assert!(!validate_body(&json!([]), is_valid_metric));
    }

    #[test]
    fn valid_meter() {
        let m = json!({
            "counter_name": "instance",
            "counter_volume": 1.0,
            "message_id": "5460acce",
            "project_id": "35b17138",
            "source": "openstack",
            "timestamp": "2016-04-21T00:07:20",
            "user_id": "efd87807"
        });
        assert!(is_valid_meter(&m));
        let mut missing = m.clone();
        missing.as_object_mut().unwrap().remove("source");
        assert!(!is_valid_meter(&missing));
    }

    #[test]
    fn falsy_meter_fields_are_rejected() {
        let mut m = json!({
            "counter_name": "instance",
            "counter_volume": 0,
            "message_id": "m-1",
            "project_id": "p-1",
            "source": "openstack",
            "timestamp": "2016-04-21T00:07:20",
            "user_id": "u-1"
        });
        assert!(!is_valid_meter(&m));
        m["counter_volume"] = json!(0.5);
        assert!(is_valid_meter(&m));
        m["source"] = json!("");
        assert!(!is_valid_meter(&m));
    }

    #[test]
    fn augment_injects_identity_headers() {
        let mut body = json!([{"name": "cpu"}, {"name": "mem"}]);
        let headers = vec![
            ("x-tenant".to_string(), "acme".to_string()),
            ("x-user-id".to_string(), "u-1".to_string()),
        ];
        augment(&mut body, &headers);
        for sample in body.as_array().unwrap() {
            assert_eq!(sample["tenant"], "acme");
            assert_eq!(sample["user_id"], "u-1");
            assert!(sample.get("project_id").is_none());
        }
    }

    #[test]
    fn envelope_shape() {
        let e = envelope("metric", json!({"name": "cpu"}), Some("t-1"));
        assert_eq!(e["metric"]["name"], "cpu");
        assert_eq!(e["meta"]["tenantId"], "t-1");
        assert!(e["meta"]["region"].is_null());
        assert!(e["creation_time"].is_number());
    }

    #[test]
    fn envelope_round_trip() {
        let e = envelope("metric", json!({"name": "cpu", "value": 1}), None);
        let back = unwrap_envelope(e);
        assert_eq!(back, json!({"name": "cpu", "value": 1}));
        // non-enveloped records pass through
        let raw = json!({"name": "cpu"});
        assert_eq!(unwrap_envelope(raw.clone()), raw);
    }
}
