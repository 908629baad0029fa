// src/api/notification_methods.rs
//! CRUD over notification methods. Type must be one of EMAIL, PAGEDUTY or
//! WEBHOOK; EMAIL addresses must look like email addresses before they are
//! accepted.

use super::{status_for, SharedState};
use crate::store;
use crate::types::NotificationType;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.+@(\[?)[a-zA-Z0-9\-\.]+\.([a-zA-Z]{2,3}|[0-9]{1,3})(\]?)$")
        .expect("email regex is valid")
});

pub(crate) fn is_valid_email(address: &str) -> bool {
    address.len() > 7 && EMAIL_SHAPE.is_match(address)
}

/// Validate the type/address pair of a method document.
fn validate_method(doc: &Value) -> bool {
    let Some(kind) = doc.get("type").and_then(Value::as_str) else {
        return false;
    };
    let Some(address) = doc
        .get("address")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
    else {
        return false;
    };
    match NotificationType::parse(kind) {
        Some(NotificationType::Email) => is_valid_email(address),
        Some(_) => true,
        None => false,
    }
}

fn method_view(id: &str, source: &Value) -> Value {
    json!({
        "id": id,
        "links": [{"rel": "self", "href": format!("/v2.0/notification-methods/{}", id)}],
        "name": source.get("name"),
        "type": source.get("type"),
        "address": source.get("address"),
    })
}

/// `POST /v2.0/notification-methods`
pub async fn create(State(state): State<SharedState>, body: Bytes) -> StatusCode {
    let mut doc: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return StatusCode::BAD_REQUEST,
    };
    if !validate_method(&doc) {
        return StatusCode::BAD_REQUEST;
    }
    let id = Uuid::new_v4().to_string();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.clone()));
    }
    match state.methods_store.post_doc(&id, &doc).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("notification method create failed: {}", e);
            status_for(&e)
        }
    }
}

/// `PUT /v2.0/notification-methods/{id}`
pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let mut doc: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return StatusCode::BAD_REQUEST,
    };
    if !validate_method(&doc) {
        return StatusCode::BAD_REQUEST;
    }
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.clone()));
    }
    match state.methods_store.put_doc(&id, &doc).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("notification method update failed: {}", e);
            status_for(&e)
        }
    }
}

/// `DELETE /v2.0/notification-methods/{id}`
pub async fn delete(State(state): State<SharedState>, Path(id): Path<String>) -> StatusCode {
    match state.methods_store.delete_doc(&id).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("notification method delete failed: {}", e);
            status_for(&e)
        }
    }
}

/// `GET /v2.0/notification-methods/{id}`
pub async fn get_by_id(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.methods_store.get_by_id(&id).await {
        Ok((status, body)) if status.is_success() => match store::first_source(&body) {
            Some(source) => (StatusCode::OK, Json(method_view(&id, source))),
            None => (StatusCode::NOT_FOUND, Json(Value::Null)),
        },
        Ok((status, _)) => (
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
            Json(Value::Null),
        ),
        Err(e) => (status_for(&e), Json(Value::Null)),
    }
}

/// `GET /v2.0/notification-methods`
pub async fn list(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    let query = json!({"query": {"match_all": {}}, "size": state.size});
    let response = match state.methods_store.search(&query, "").await {
        Ok((status, value)) if status.is_success() => value,
        Ok((status, _)) => {
            return (
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
                Json(Value::Null),
            )
        }
        Err(e) => return (status_for(&e), Json(Value::Null)),
    };

    let elements: Vec<Value> = store::hits(&response)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let source = hit.get("_source")?;
                    let id = source.get("id")?.as_str()?;
                    Some(method_view(id, source))
                })
                .collect()
        })
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "links": [{"rel": "self", "href": "/v2.0/notification-methods"}],
            "elements": elements,
        })),
    )
}
