// src/api/alarms.rs
//! Read views over alarm events. The list endpoint serves the latest alarm
//! per alarm definition: a terms aggregation on the definition name with a
//! single top hit sorted by `updated_timestamp desc`.

use super::{status_for, SharedState};
use crate::store;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use log::warn;
use serde_json::{json, Value};

fn latest_state_query() -> Value {
    json!({
        "aggs": {
            "latest_state": {
                "terms": {"field": "alarm_definition.name", "size": 0},
                "aggs": {
                    "top_state_hits": {
                        "top_hits": {
                            "sort": [{"updated_timestamp": {"order": "desc"}}],
                            "_source": {
                                "include": [
                                    "state", "created_timestamp", "updated_timestamp",
                                    "metrics", "sub_alarms", "state_updated_timestamp",
                                    "id", "alarm_definition"
                                ]
                            },
                            "size": 1
                        }
                    }
                }
            }
        }
    })
}

/// `GET /v2.0/alarms`
pub async fn list(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    let response = match state
        .alarms_store
        .search(&latest_state_query(), "search_type=count")
        .await
    {
        Ok((status, value)) if status.is_success() => value,
        Ok((status, _)) => {
            return (
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
                Json(Value::Null),
            )
        }
        Err(e) => {
            warn!("alarms query failed: {}", e);
            return (status_for(&e), Json(Value::Null));
        }
    };

    let href = "/v2.0/alarms";
    let elements: Vec<Value> = store::aggregations(&response)
        .and_then(|aggs| aggs.pointer("/latest_state/buckets"))
        .and_then(Value::as_array)
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|bucket| {
                    let alarm = bucket.pointer("/top_state_hits/hits/hits/0/_source")?;
                    Some(json!({
                        "id": alarm.get("id"),
                        "links": [{"rel": "self", "href": href}],
                        "alarm_definition": alarm.get("alarm_definition"),
                        "metrics": alarm.get("metrics"),
                        "state": alarm.get("state"),
                        "sub_alarms": alarm.get("sub_alarms"),
                        "state_updated_timestamp": alarm.get("state_updated_timestamp"),
                        "updated_timestamp": alarm.get("updated_timestamp"),
                        "created_timestamp": alarm.get("created_timestamp"),
                    }))
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

/// `GET /v2.0/alarms/{id}`
pub async fn get_by_id(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.alarms_store.get_by_id(&id).await {
        Ok((status, body)) if status.is_success() => match store::first_source(&body) {
            Some(source) => (
                StatusCode::OK,
                Json(json!({
                    "id": id,
                    "links": [{"rel": "self", "href": format!("/v2.0/alarms/{}", id)}],
                    "metrics": source.get("metrics"),
                    "state": source.get("state"),
                    "sub_alarms": source.get("sub_alarms"),
                    "state_updated_timestamp": source.get("state_updated_timestamp"),
                    "updated_timestamp": source.get("updated_timestamp"),
                    "created_timestamp": source.get("created_timestamp"),
                })),
            ),
            None => (StatusCode::NOT_FOUND, Json(Value::Null)),
        },
        Ok((status, _)) => (
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
            Json(Value::Null),
        ),
        Err(e) => (status_for(&e), Json(Value::Null)),
    }
}

/// `PUT /v2.0/alarms/{id}` — replace the stored alarm document.
pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let doc: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return StatusCode::BAD_REQUEST,
    };
    match state.alarms_store.put_doc(&id, &doc).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("alarm update failed: {}", e);
            status_for(&e)
        }
    }
}

/// `DELETE /v2.0/alarms/{id}`
pub async fn delete(State(state): State<SharedState>, Path(id): Path<String>) -> StatusCode {
    match state.alarms_store.delete_doc(&id).await {
        Ok(status) => StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("alarm delete failed: {}", e);
            status_for(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_state_query_shape() {
        let q = latest_state_query();
        assert_eq!(
            q["aggs"]["latest_state"]["terms"]["field"],
            "alarm_definition.name"
        );
        let top = &q["aggs"]["latest_state"]["aggs"]["top_state_hits"]["top_hits"];
        assert_eq!(top["size"], 1);
        assert_eq!(top["sort"][0]["updated_timestamp"]["order"], "desc");
    }
}
