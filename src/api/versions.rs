// src/api/versions.rs
//! Version discovery endpoints.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

const UPDATED: &str = "2014-01-01 00:00:00";

fn version_entry() -> Value {
    json!({
        "id": "v2.0",
        "links": [{"rel": "self", "href": "/v2.0"}],
        "status": "CURRENT",
        "updated": UPDATED,
    })
}

pub async fn list_versions() -> Json<Value> {
    Json(json!([version_entry()]))
}

pub async fn get_version(Path(version_id): Path<String>) -> (StatusCode, Json<Value>) {
    if matches!(version_id.as_str(), "v2.0" | "2.0" | "2") {
        (StatusCode::OK, Json(version_entry()))
    } else {
        (StatusCode::NOT_IMPLEMENTED, Json(Value::Null))
    }
}
