// src/api/metrics.rs
//! Read views over stored samples: unique metric listing, raw
//! measurements, and time-bucketed statistics. Each view is one
//! aggregation query against the store plus a shape transformation of the
//! aggregation buckets.

use super::{status_for, SharedState};
use crate::store;
use crate::types::iso8601_from_secs;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Common filter clauses: metric name, time window (default the last 30
/// days), and dimension key:value pairs.
fn common_clauses(params: &HashMap<String, String>) -> Result<Vec<Value>, ()> {
    let mut clauses = Vec::new();

    if let Some(name) = params.get("name").map(|n| n.trim()).filter(|n| !n.is_empty()) {
        clauses.push(json!({"match": {"name": name}}));
    }

    let start = match params.get("start_time") {
        Some(raw) => parse_time(raw).ok_or(())?,
        None => Utc::now() - Duration::days(30),
    };
    let end = match params.get("end_time") {
        Some(raw) => parse_time(raw).ok_or(())?,
        None => Utc::now(),
    };
    clauses.push(json!({
        "range": {"timestamp": {"gte": start.timestamp(), "lt": end.timestamp()}}
    }));

    if let Some(dimensions) = params.get("dimensions") {
        for pair in dimensions.split(',') {
            let mut kv = pair.splitn(2, ':');
            let (Some(key), Some(value)) = (kv.next(), kv.next()) else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            let field = format!("dimensions.{}", key);
            // numeric dimension values are matched as numbers
            match value.parse::<f64>() {
                Ok(number) => clauses.push(json!({"match": {field: number}})),
                Err(_) => clauses.push(json!({"match": {field: value}})),
            }
        }
    }

    Ok(clauses)
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn period_param(params: &HashMap<String, String>) -> String {
    params
        .get("period")
        .and_then(|p| p.parse::<u64>().ok())
        .map(|p| format!("{}s", p))
        .unwrap_or_else(|| "300s".to_string())
}

fn stats_param(params: &HashMap<String, String>) -> Vec<String> {
    const ALL: [&str; 5] = ["avg", "count", "max", "min", "sum"];
    let requested: Vec<String> = params
        .get("statistics")
        .map(|s| {
            s.to_lowercase()
                .split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| ALL.contains(&x.as_str()))
                .collect()
        })
        .unwrap_or_default();
    if requested.is_empty() {
        ALL.iter().map(|s| s.to_string()).collect()
    } else {
        requested
    }
}

fn query_body(clauses: Vec<Value>, size: u64, aggs: Value) -> Value {
    json!({
        "query": {"bool": {"must": clauses}},
        "size": size,
        "aggs": aggs,
    })
}

/// `GET /v2.0/metrics` — unique (name, dimensions) pairs.
pub async fn get_metrics(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let Ok(clauses) = common_clauses(&params) else {
        return (StatusCode::BAD_REQUEST, Json(Value::Null));
    };
    let size = state.size;
    let aggs = json!({
        "by_name": {
            "terms": {"field": "name", "size": size},
            "aggs": {
                "by_dim": {
                    "terms": {"field": "dimensions_hash", "size": size},
                    "aggs": {
                        "metrics": {
                            "top_hits": {
                                "_source": {
                                    "exclude": ["dimensions_hash", "timestamp", "value"]
                                },
                                "size": 1
                            }
                        }
                    }
                }
            }
        }
    });

    let body = query_body(clauses, size, aggs);
    let response = match state.metrics_store.search(&body, "search_type=count").await {
        Ok((status, value)) if status.is_success() => value,
        Ok((status, _)) => return (status_from(status), Json(Value::Null)),
        Err(e) => {
            warn!("metrics query failed: {}", e);
            return (status_for(&e), Json(Value::Null));
        }
    };

    let mut elements = Vec::new();
    for dim_bucket in name_dim_buckets(&response) {
        if let Some(source) = dim_bucket
            .pointer("/metrics/hits/hits/0/_source")
            .cloned()
        {
            elements.push(source);
        }
    }
    (StatusCode::OK, Json(Value::Array(elements)))
}

/// `GET /v2.0/metrics/measurements` — raw samples grouped by metric.
pub async fn get_measurements(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let Ok(clauses) = common_clauses(&params) else {
        return (StatusCode::BAD_REQUEST, Json(Value::Null));
    };
    let size = state.size;
    let aggs = json!({
        "by_name": {
            "terms": {"field": "name", "size": size},
            "aggs": {
                "by_dim": {
                    "terms": {"field": "dimensions_hash", "size": size},
                    "aggs": {
                        "dimension": {
                            "top_hits": {
                                "_source": {
                                    "exclude": ["dimensions_hash", "timestamp", "value"]
                                },
                                "size": 1
                            }
                        },
                        "measures": {
                            "top_hits": {
                                "_source": {"include": ["timestamp", "value"]},
                                "sort": [{"timestamp": "asc"}],
                                "size": size
                            }
                        }
                    }
                }
            }
        }
    });

    let body = query_body(clauses, size, aggs);
    let response = match state.metrics_store.search(&body, "search_type=count").await {
        Ok((status, value)) if status.is_success() => value,
        Ok((status, _)) => return (status_from(status), Json(Value::Null)),
        Err(e) => {
            warn!("measurements query failed: {}", e);
            return (status_for(&e), Json(Value::Null));
        }
    };

    let mut elements = Vec::new();
    for dim_bucket in name_dim_buckets(&response) {
        let Some(source) = dim_bucket.pointer("/dimension/hits/hits/0/_source") else {
            continue;
        };
        let measurements: Vec<Value> = dim_bucket
            .pointer("/measures/hits/hits")
            .and_then(Value::as_array)
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let id = hit.get("_id")?.clone();
                        let ts = hit.pointer("/_source/timestamp")?.as_f64()?;
                        let value = hit.pointer("/_source/value")?.clone();
                        Some(json!([id, iso8601_from_secs(ts), value]))
                    })
                    .collect()
            })
            .unwrap_or_default();
        elements.push(json!({
            "name": source.get("name"),
            "dimensions": source.get("dimensions"),
            "columns": ["id", "timestamp", "value"],
            "measurements": measurements,
        }));
    }
    (StatusCode::OK, Json(Value::Array(elements)))
}

/// `GET /v2.0/metrics/statistics` — time-bucketed aggregates per metric.
pub async fn get_statistics(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let Ok(clauses) = common_clauses(&params) else {
        return (StatusCode::BAD_REQUEST, Json(Value::Null));
    };
    let period = period_param(&params);
    let stats = stats_param(&params);
    let size = state.size;
    let aggs = json!({
        "by_name": {
            "terms": {"field": "name", "size": size},
            "aggs": {
                "by_dim": {
                    "terms": {"field": "dimensions_hash", "size": size},
                    "aggs": {
                        "dimension": {
                            "top_hits": {
                                "_source": {
                                    "exclude": ["dimensions_hash", "timestamp", "value"]
                                },
                                "size": 1
                            }
                        },
                        "periods": {
                            "date_histogram": {"field": "timestamp", "interval": period},
                            "aggs": {"statistics": {"stats": {"field": "value"}}}
                        }
                    }
                }
            }
        }
    });

    let body = query_body(clauses, size, aggs);
    let response = match state.metrics_store.search(&body, "search_type=count").await {
        Ok((status, value)) if status.is_success() => value,
        Ok((status, _)) => return (status_from(status), Json(Value::Null)),
        Err(e) => {
            warn!("statistics query failed: {}", e);
            return (status_for(&e), Json(Value::Null));
        }
    };

    let mut columns = vec![Value::String("timestamp".to_string())];
    columns.extend(stats.iter().map(|s| Value::String(s.clone())));

    let mut elements = Vec::new();
    for dim_bucket in name_dim_buckets(&response) {
        let Some(source) = dim_bucket.pointer("/dimension/hits/hits/0/_source") else {
            continue;
        };
        let rows: Vec<Value> = dim_bucket
            .pointer("/periods/buckets")
            .and_then(Value::as_array)
            .map(|buckets| {
                buckets
                    .iter()
                    .filter_map(|bucket| {
                        let key = bucket.get("key")?.as_f64()?;
                        let mut row = vec![Value::String(iso8601_from_secs(key))];
                        for stat in &stats {
                            row.push(
                                bucket
                                    .pointer(&format!("/statistics/{}", stat))
                                    .cloned()
                                    .unwrap_or(Value::Null),
                            );
                        }
                        Some(Value::Array(row))
                    })
                    .collect()
            })
            .unwrap_or_default();
        elements.push(json!({
            "name": source.get("name"),
            "dimensions": source.get("dimensions"),
            "columns": columns.clone(),
            "statistics": rows,
        }));
    }
    (StatusCode::OK, Json(Value::Array(elements)))
}

/// Flatten the two-level by_name/by_dim aggregation into dimension
/// buckets.
fn name_dim_buckets(response: &Value) -> Vec<&Value> {
    let mut out = Vec::new();
    let Some(names) = store::aggregations(response)
        .and_then(|a| a.pointer("/by_name/buckets"))
        .and_then(Value::as_array)
    else {
        return out;
    };
    for name_bucket in names {
        if let Some(dims) = name_bucket.pointer("/by_dim/buckets").and_then(Value::as_array) {
            out.extend(dims.iter());
        }
    }
    out
}

fn status_from(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST)
}
