// src/api/alarm_definitions.rs
//! CRUD over alarm definitions. POST assigns the id and derives
//! `expression_data` from the parsed expression; PUT additionally enforces
//! the structural update rule so live processors can carry their windows
//! over.

use super::{status_for, SharedState};
use crate::expr::{parser, validator};
use crate::store;
use crate::types::AlarmDefinition;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

const SEVERITIES: [&str; 4] = ["LOW", "MEDIUM", "HIGH", "CRITICAL"];

/// Replace an out-of-range severity with LOW, leaving the field absent if
/// the caller never sent one.
fn normalize_severity(doc: &mut Value) {
    if let Some(severity) = doc.get_mut("severity") {
        let valid = severity
            .as_str()
            .map(|s| SEVERITIES.contains(&s))
            .unwrap_or(false);
        if !valid {
            *severity = Value::String("LOW".to_string());
        }
    }
}

/// Attach the parsed sub-expression descriptors. Fails when the expression
/// does not parse.
fn attach_expression_data(doc: &mut Value) -> Result<(), ()> {
    let expression = doc
        .get("expression")
        .and_then(Value::as_str)
        .ok_or(())?
        .to_string();
    let tree = parser::parse(&expression).map_err(|_| ())?;
    let descriptors: Vec<Value> = tree
        .leaves()
        .iter()
        .filter_map(|leaf| serde_json::to_value(leaf.descriptor()).ok())
        .collect();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("expression_data".to_string(), Value::Array(descriptors));
        Ok(())
    } else {
        Err(())
    }
}

fn decode(doc: &Value) -> Option<AlarmDefinition> {
    serde_json::from_value(doc.clone()).ok()
}

fn definition_view(id: &str, source: &Value, href: &str) -> Value {
    json!({
        "id": id,
        "links": [{"rel": "self", "href": href}],
        "name": source.get("name"),
        "description": source.get("description"),
        "expression": source.get("expression"),
        "expression_data": source.get("expression_data"),
        "severity": source.get("severity"),
        "match_by": source.get("match_by"),
        "alarm_actions": source.get("alarm_actions"),
        "ok_actions": source.get("ok_actions"),
        "undetermined_actions": source.get("undetermined_actions"),
    })
}

/// `POST /v2.0/alarm-definitions`
pub async fn create(State(state): State<SharedState>, body: Bytes) -> StatusCode {
    let mut doc: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return StatusCode::BAD_REQUEST,
    };

    let id = Uuid::new_v4().to_string();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.clone()));
    }
    normalize_severity(&mut doc);
    if attach_expression_data(&mut doc).is_err() {
        debug!("alarm definition expression rejected");
        return StatusCode::BAD_REQUEST;
    }
    let Some(definition) = decode(&doc) else {
        return StatusCode::BAD_REQUEST;
    };
    if !validator::is_valid_definition(&definition) {
        return StatusCode::BAD_REQUEST;
    }

    match state.definitions_store.post_doc(&id, &doc).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("alarm definition create failed: {}", e);
            status_for(&e)
        }
    }
}

/// `GET /v2.0/alarm-definitions/{id}`
pub async fn get_by_id(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.definitions_store.get_by_id(&id).await {
        Ok((status, body)) if status.is_success() => match store::first_source(&body) {
            Some(source) => {
                let href = format!("/v2.0/alarm-definitions/{}", id);
                (StatusCode::OK, Json(definition_view(&id, source, &href)))
            }
            None => (StatusCode::NOT_FOUND, Json(Value::Null)),
        },
        Ok((status, _)) => (
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
            Json(Value::Null),
        ),
        Err(e) => (status_for(&e), Json(Value::Null)),
    }
}

/// `PUT /v2.0/alarm-definitions/{id}`
pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let original = match state.definitions_store.get_by_id(&id).await {
        Ok((status, body)) if status.is_success() => match store::first_source(&body) {
            Some(source) => match decode(source) {
                Some(def) => def,
                None => return StatusCode::BAD_REQUEST,
            },
            None => return StatusCode::NOT_FOUND,
        },
        Ok(status_and_body) => {
            return StatusCode::from_u16(status_and_body.0.as_u16())
                .unwrap_or(StatusCode::BAD_REQUEST)
        }
        Err(e) => return status_for(&e),
    };

    let mut doc: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return StatusCode::BAD_REQUEST,
    };
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.clone()));
    }
    normalize_severity(&mut doc);
    if attach_expression_data(&mut doc).is_err() {
        return StatusCode::BAD_REQUEST;
    }
    let Some(updated) = decode(&doc) else {
        return StatusCode::BAD_REQUEST;
    };
    if !validator::is_valid_update(&original, &updated) {
        debug!("alarm definition update for {} violates the update rule", id);
        return StatusCode::BAD_REQUEST;
    }

    match state.definitions_store.put_doc(&id, &doc).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("alarm definition update failed: {}", e);
            status_for(&e)
        }
    }
}

/// `DELETE /v2.0/alarm-definitions/{id}`
pub async fn delete(State(state): State<SharedState>, Path(id): Path<String>) -> StatusCode {
    match state.definitions_store.delete_doc(&id).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("alarm definition delete failed: {}", e);
            status_for(&e)
        }
    }
}

/// `GET /v2.0/alarm-definitions` with optional name/dimension filters.
pub async fn list(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let query = build_list_query(&params);
    let response = match state.definitions_store.search(&query, "").await {
        Ok((status, value)) if status.is_success() => value,
        Ok((status, _)) => {
            return (
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
                Json(Value::Null),
            )
        }
        Err(e) => return (status_for(&e), Json(Value::Null)),
    };

    let href = "/v2.0/alarm-definitions";
    let elements: Vec<Value> = store::hits(&response)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let source = hit.get("_source")?;
                    let id = source.get("id")?.as_str()?;
                    Some(definition_view(id, source, href))
                })
                .collect()
        })
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "links": [{"rel": "self", "href": href}],
            "elements": elements,
        })),
    )
}

fn build_list_query(params: &HashMap<String, String>) -> Value {
    let mut clauses = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "dimensions" => {
                for pair in value.split(',') {
                    if let Some((dk, dv)) = pair.split_once(':') {
                        clauses.push(json!({
                            "query_string": {
                                "default_field": format!(
                                    "alarmdefinitions.expression_data.dimensions.{}",
                                    dk
                                ),
                                "query": dv,
                            }
                        }));
                    }
                }
            }
            "limit" | "offset" => {}
            other => clauses.push(json!({
                "query_string": {"default_field": other, "query": value}
            })),
        }
    }
    if clauses.is_empty() {
        json!({})
    } else {
        json!({"query": {"bool": {"must": clauses}}})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_normalization() {
        let mut doc = json!({"severity": "SEVERE"});
        normalize_severity(&mut doc);
        assert_eq!(doc["severity"], "LOW");

        let mut doc = json!({"severity": "CRITICAL"});
        normalize_severity(&mut doc);
        assert_eq!(doc["severity"], "CRITICAL");

        let mut doc = json!({"name": "x"});
        normalize_severity(&mut doc);
        assert!(doc.get("severity").is_none());
    }

    #[test]
    fn expression_data_derivation() {
        let mut doc = json!({
            "name": "n",
            "expression": "max(cpu{host=h1},120)>10 times 2 and min(mem)<5"
        });
        attach_expression_data(&mut doc).unwrap();
        let data = doc["expression_data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["function"], "MAX");
        assert_eq!(data[0]["metric_name"], "cpu");
        assert_eq!(data[0]["period"], 120);
        assert_eq!(data[0]["periods"], 2);
        assert_eq!(data[1]["operator"], "LT");
    }

    #[test]
    fn bad_expression_is_rejected() {
        let mut doc = json!({"expression": "max(("});
        assert!(attach_expression_data(&mut doc).is_err());
        let mut doc = json!({"name": "no expression"});
        assert!(attach_expression_data(&mut doc).is_err());
    }

    #[test]
    fn list_query_shape() {
        let mut params = HashMap::new();
        params.insert("name".to_string(), "cpu".to_string());
        params.insert("dimensions".to_string(), "host:h1".to_string());
        params.insert("limit".to_string(), "10".to_string());
        let query = build_list_query(&params);
        let clauses = query["query"]["bool"]["must"].as_array().unwrap();
        // limit is ignored, name and one dimension remain
        assert_eq!(clauses.len(), 2);

        assert_eq!(build_list_query(&HashMap::new()), json!({}));
    }
}
