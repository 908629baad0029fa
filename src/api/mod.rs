// src/api/mod.rs
//! The HTTP surface: sample ingestion plus read/CRUD views over the store.
//!
//! Handlers are thin translators. Every error is flattened to a status
//! code here and nowhere else: 4xx for anything the caller can fix, 404 on
//! id misses, 503 only when the bus or the store is unreachable, and store
//! status codes passed through verbatim for mutations.

mod alarm_definitions;
mod alarms;
mod ingestion;
mod metrics;
mod notification_methods;
mod versions;

use crate::bus::BusProducer;
use crate::config::Config;
use crate::error::{Result, VigilError};
use crate::store::StoreClient;
use crate::strategy;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

pub struct ApiState {
    pub producer: BusProducer,
    pub metrics_store: StoreClient,
    pub definitions_store: StoreClient,
    pub alarms_store: StoreClient,
    pub methods_store: StoreClient,
    pub size: u64,
}

pub type SharedState = Arc<ApiState>;

/// Status code for an error crossing the HTTP boundary.
pub(crate) fn status_for(err: &VigilError) -> StatusCode {
    match err {
        VigilError::Expression(_) | VigilError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        VigilError::NotFound(_) => StatusCode::NOT_FOUND,
        VigilError::Bus(_) | VigilError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(versions::list_versions))
        .route("/:version_id", get(versions::get_version))
        .route(
            "/v2.0/metrics",
            post(ingestion::post_metrics).get(metrics::get_metrics),
        )
        .route("/v2.0/meters", post(ingestion::post_meters))
        .route("/v2.0/metrics/measurements", get(metrics::get_measurements))
        .route("/v2.0/metrics/statistics", get(metrics::get_statistics))
        .route(
            "/v2.0/alarm-definitions",
            post(alarm_definitions::create).get(alarm_definitions::list),
        )
        .route(
            "/v2.0/alarm-definitions/:id",
            get(alarm_definitions::get_by_id)
                .put(alarm_definitions::update)
                .delete(alarm_definitions::delete),
        )
        .route("/v2.0/alarms", get(alarms::list))
        .route(
            "/v2.0/alarms/:id",
            get(alarms::get_by_id).put(alarms::update).delete(alarms::delete),
        )
        .route(
            "/v2.0/notification-methods",
            post(notification_methods::create).get(notification_methods::list),
        )
        .route(
            "/v2.0/notification-methods/:id",
            get(notification_methods::get_by_id)
                .put(notification_methods::update)
                .delete(notification_methods::delete),
        )
        .with_state(state)
}

/// Build the API state from configuration.
pub fn build_state(config: &Config) -> Result<ApiState> {
    let strategy = strategy::create(&config.index)?;
    Ok(ApiState {
        producer: BusProducer::new(&config.bus, &config.topics.metrics)?,
        metrics_store: StoreClient::new(
            &config.store,
            &config.index.prefix,
            &config.topics.metrics,
            strategy.clone(),
        )?,
        definitions_store: StoreClient::new(
            &config.store,
            &config.index.prefix,
            &config.topics.alarm_definitions_doc_type,
            strategy.clone(),
        )?,
        alarms_store: StoreClient::new(
            &config.store,
            &config.index.prefix,
            &config.topics.alarms,
            strategy.clone(),
        )?,
        methods_store: StoreClient::new(
            &config.store,
            &config.index.prefix,
            &config.topics.notification_methods_doc_type,
            strategy,
        )?,
        size: config.http.size,
    })
}

/// Serve the API until the shutdown signal flips. Installs the metrics
/// index template first; a failure there aborts startup.
pub async fn run(config: &Config, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let state = Arc::new(build_state(config)?);

    let template = std::fs::read_to_string(&config.http.index_template).map_err(|e| {
        VigilError::Fatal(format!(
            "cannot read index template {}: {}",
            config.http.index_template, e
        ))
    })?;
    state
        .metrics_store
        .install_template("metrics", template)
        .await?;
    info!("index template installed");

    let listener = tokio::net::TcpListener::bind(&config.http.bind)
        .await
        .map_err(|e| VigilError::Fatal(format!("cannot bind {}: {}", config.http.bind, e)))?;
    info!("api listening on {}", config.http.bind);

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| {
            error!("api server failed: {}", e);
            VigilError::Fatal(format!("api server failed: {}", e))
        })
}
