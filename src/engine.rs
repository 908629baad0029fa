// src/engine.rs
//! The threshold engine: the concurrency skeleton that binds the metrics
//! consumer, the alarm publisher and the definition refresher to one shared
//! catalog of threshold processors.
//!
//! A single process-wide mutex serializes catalog access: the consumer and
//! publisher traverse every processor under it, the refresher mutates the
//! map under it. No task suspends while holding the lock; events are
//! published and store queries are made outside the critical section.

use crate::bus::{BusConsumer, BusProducer};
use crate::config::{Config, EngineConfig};
use crate::error::Result;
use crate::ingest::unwrap_envelope;
use crate::store::{self, StoreClient};
use crate::strategy;
use crate::threshold::ThresholdProcessor;
use crate::types::{AlarmDefinition, AlarmEvent, Sample};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct CatalogEntry {
    processor: ThresholdProcessor,
    /// Serialized store document, compared to detect definition changes.
    serialized: String,
    /// Epoch flag; entries left on the previous epoch after a refresh are
    /// stale and get dropped.
    epoch: bool,
}

/// The shared map of live threshold processors, keyed by definition id.
#[derive(Default)]
pub struct ProcessorCatalog {
    entries: Mutex<HashMap<String, CatalogEntry>>,
}

pub type SharedCatalog = Arc<ProcessorCatalog>;

impl ProcessorCatalog {
    pub fn new() -> SharedCatalog {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed one sample to every live processor.
    pub fn ingest_all(&self, sample: &Sample) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            entry.processor.ingest(sample);
        }
    }

    /// Evaluate every processor and collect the produced events.
    pub fn collect_events(&self) -> Vec<AlarmEvent> {
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .flat_map(|entry| entry.processor.evaluate())
            .collect()
    }

    /// Reconcile the catalog against a full definition listing: create
    /// processors for new definitions, update changed ones, and drop every
    /// entry the listing no longer contains.
    pub fn reconcile(&self, definitions: Vec<(AlarmDefinition, String)>, epoch: bool) {
        let mut entries = self.entries.lock();
        for (definition, serialized) in definitions {
            let id = definition.id.clone();
            match entries.get_mut(&id) {
                Some(entry) => {
                    if entry.serialized != serialized {
                        match entry.processor.update(definition) {
                            Ok(()) => {
                                debug!("updated alarm definition {}", id);
                                entry.serialized = serialized;
                            }
                            Err(e) => warn!("cannot update alarm definition {}: {}", id, e),
                        }
                    }
                    entry.epoch = epoch;
                }
                None => match ThresholdProcessor::new(definition) {
                    Ok(processor) => {
                        debug!("new alarm definition {}", id);
                        entries.insert(
                            id,
                            CatalogEntry {
                                processor,
                                serialized,
                                epoch,
                            },
                        );
                    }
                    Err(e) => warn!("skipping alarm definition {}: {}", id, e),
                },
            }
        }
        entries.retain(|id, entry| {
            if entry.epoch != epoch {
                debug!("dropping expired alarm definition {}", id);
            }
            entry.epoch == epoch
        });
    }
}

/// Periodically queries the store for alarm definitions and reconciles the
/// live processor set. A failed query leaves the catalog untouched.
pub struct DefinitionRefresher {
    store: StoreClient,
    catalog: SharedCatalog,
    interval: Duration,
    epoch: bool,
    query: Value,
}

impl DefinitionRefresher {
    pub fn new(store: StoreClient, catalog: SharedCatalog, cfg: &EngineConfig) -> Self {
        Self {
            store,
            catalog,
            interval: Duration::from_secs(cfg.check_alarm_def_interval),
            epoch: false,
            query: build_definitions_query(&cfg.name, &cfg.dimensions, cfg.size),
        }
    }

    async fn refresh_once(&mut self) {
        let response = match self.store.search(&self.query, "").await {
            Ok((status, body)) if status.is_success() => body,
            Ok((status, _)) => {
                warn!("alarm definition query returned status {}", status);
                return;
            }
            Err(e) => {
                warn!("alarm definition query failed: {}", e);
                return;
            }
        };
        let Some(hits) = store::hits(&response) else {
            warn!("alarm definition query returned no hit list");
            return;
        };

        let mut definitions = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(source) = hit.get("_source") else {
                continue;
            };
            match serde_json::from_value::<AlarmDefinition>(source.clone()) {
                Ok(def) if !def.id.is_empty() => {
                    // serde_json objects serialize with sorted keys, so the
                    // serialized form is a stable change detector
                    let serialized = source.to_string();
                    definitions.push((def, serialized));
                }
                Ok(_) => warn!("alarm definition without id ignored"),
                Err(e) => warn!("undecodable alarm definition ignored: {}", e),
            }
        }

        self.epoch = !self.epoch;
        self.catalog.reconcile(definitions, self.epoch);
        debug!("catalog now holds {} processors", self.catalog.len());
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("definition refresher started ({:?} interval)", self.interval);
        loop {
            self.refresh_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("definition refresher stopped");
    }
}

fn build_definitions_query(name: &str, dimensions: &str, size: u64) -> Value {
    let mut clauses = Vec::new();
    if !dimensions.is_empty() {
        for pair in dimensions.split(',') {
            if let Some((key, value)) = pair.split_once(':') {
                clauses.push(json!({
                    "query_string": {
                        "default_field":
                            format!("alarmdefinitions.expression_data.dimensions.{}", key),
                        "query": value,
                    }
                }));
            }
        }
    }
    if !name.is_empty() {
        clauses.push(json!({
            "query_string": {"default_field": "name", "query": name}
        }));
    }
    json!({
        "query": {"bool": {"must": clauses}},
        "size": size,
    })
}

/// Drains the metrics topic and feeds every record to every processor.
pub struct MetricsConsumer {
    bus: BusConsumer,
    catalog: SharedCatalog,
}

impl MetricsConsumer {
    pub fn new(bus: BusConsumer, catalog: SharedCatalog) -> Self {
        Self { bus, catalog }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("metrics consumer started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.bus.recv() => match received {
                    Ok(payload) => {
                        self.dispatch(&payload);
                        if let Err(e) = self.bus.commit().await {
                            warn!("offset commit failed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("metrics receive failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        self.bus.close().await;
        info!("metrics consumer stopped");
    }

    fn dispatch(&self, payload: &[u8]) {
        let record: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("skipping malformed metrics record: {}", e);
                return;
            }
        };
        // compact-mode producers send whole bodies, fan-out producers send
        // one sample per record; accept both
        let records = match record {
            Value::Array(items) => items,
            other => vec![other],
        };
        for record in records {
            match serde_json::from_value::<Sample>(unwrap_envelope(record)) {
                Ok(sample) => self.catalog.ingest_all(&sample),
                Err(e) => warn!("skipping undecodable sample: {}", e),
            }
        }
    }
}

/// Periodically evaluates every processor and publishes the produced alarm
/// events to the alarms topic.
pub struct AlarmPublisher {
    bus: BusProducer,
    catalog: SharedCatalog,
    interval: Duration,
}

impl AlarmPublisher {
    pub fn new(bus: BusProducer, catalog: SharedCatalog, cfg: &EngineConfig) -> Self {
        Self {
            bus,
            catalog,
            interval: Duration::from_secs(cfg.check_alarm_interval),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("alarm publisher started ({:?} interval)", self.interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
            // collected under the catalog lock, sent after it is released
            let events = self.catalog.collect_events();
            if !events.is_empty() {
                info!("publishing {} alarm events", events.len());
            }
            for event in events {
                match serde_json::to_vec(&event) {
                    Ok(payload) => {
                        if let Err(e) = self.bus.send(&payload).await {
                            error!("alarm publish failed: {}", e);
                        }
                    }
                    Err(e) => error!("cannot serialize alarm event: {}", e),
                }
            }
        }
        self.bus.close().await;
        info!("alarm publisher stopped");
    }
}

/// Wires the three engine tasks to one catalog and owns their lifecycle.
pub struct ThresholdEngine {
    catalog: SharedCatalog,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl ThresholdEngine {
    pub fn start(config: &Config) -> Result<Self> {
        let catalog = ProcessorCatalog::new();
        let (shutdown, rx) = watch::channel(false);

        let strategy = strategy::create(&config.index)?;
        let defs_store = StoreClient::new(
            &config.store,
            &config.index.prefix,
            &config.topics.alarm_definitions_doc_type,
            strategy,
        )?;
        let metrics_bus = BusConsumer::new(&config.bus, &config.topics.metrics)?;
        let alarms_bus = BusProducer::new(&config.bus, &config.topics.alarms)?;

        let refresher = DefinitionRefresher::new(defs_store, catalog.clone(), &config.engine);
        let consumer = MetricsConsumer::new(metrics_bus, catalog.clone());
        let publisher = AlarmPublisher::new(alarms_bus, catalog.clone(), &config.engine);

        let handles = vec![
            tokio::spawn(refresher.run(rx.clone())),
            tokio::spawn(consumer.run(rx.clone())),
            tokio::spawn(publisher.run(rx)),
        ];
        info!("threshold engine started");
        Ok(Self {
            catalog,
            handles,
            shutdown,
        })
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    /// Signal every task to stop and wait for them to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("threshold engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn definition(id: &str, expression: &str) -> (AlarmDefinition, String) {
        let def = AlarmDefinition {
            id: id.to_string(),
            name: format!("alarm {}", id),
            description: String::new(),
            expression: expression.to_string(),
            match_by: vec![],
            severity: Severity::Low,
            alarm_actions: vec![],
            ok_actions: vec![],
            undetermined_actions: vec![],
            expression_data: vec![],
        };
        let serialized = serde_json::to_string(&def).unwrap();
        (def, serialized)
    }

    fn sample(name: &str, value: f64) -> Sample {
        Sample {
            name: name.to_string(),
            dimensions: HashMap::new(),
            timestamp: None,
            value,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn reconcile_creates_updates_and_deletes() {
        let catalog = ProcessorCatalog::new();

        catalog.reconcile(vec![definition("a", "max(x)>1"), definition("b", "max(y)>1")], true);
        assert_eq!(catalog.len(), 2);

        // identical listing on the next epoch: idempotent
        catalog.reconcile(vec![definition("a", "max(x)>1"), definition("b", "max(y)>1")], false);
        assert_eq!(catalog.len(), 2);

        // changed definition is updated, missing one is dropped
        catalog.reconcile(vec![definition("a", "max(x)>5")], true);
        assert_eq!(catalog.len(), 1);
        let entries = catalog.entries.lock();
        assert_eq!(
            entries.get("a").unwrap().processor.definition().expression,
            "max(x)>5"
        );
    }

    #[test]
    fn reconcile_skips_bad_definitions() {
        let catalog = ProcessorCatalog::new();
        catalog.reconcile(
            vec![definition("good", "max(x)>1"), definition("bad", "max(((")],
            true,
        );
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn identical_update_is_a_noop_for_processor_state() {
        let catalog = ProcessorCatalog::new();
        catalog.reconcile(vec![definition("a", "max(x)>1")], true);
        catalog.ingest_all(&sample("x", 5.0));
        {
            let entries = catalog.entries.lock();
            assert_eq!(entries.get("a").unwrap().processor.sample_count(), 1);
        }
        // same serialized form: reconcile must not reset the window
        catalog.reconcile(vec![definition("a", "max(x)>1")], false);
        let entries = catalog.entries.lock();
        assert_eq!(entries.get("a").unwrap().processor.sample_count(), 1);
    }

    #[test]
    fn ingest_and_collect_under_the_lock() {
        let catalog = ProcessorCatalog::new();
        catalog.reconcile(vec![definition("a", "max(x)>1")], true);
        catalog.ingest_all(&sample("x", 5.0));
        let events = catalog.collect_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, crate::types::AlarmState::Alarm);
        // no change on the second sweep
        assert!(catalog.collect_events().is_empty());
    }

    #[test]
    fn definitions_query_shape() {
        let q = build_definitions_query("cpu high", "host:web-1,os:linux", 1000);
        let clauses = q["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(clauses.len(), 3);
        assert_eq!(
            clauses[0]["query_string"]["default_field"],
            "alarmdefinitions.expression_data.dimensions.host"
        );
        assert_eq!(clauses[2]["query_string"]["query"], "cpu high");
        assert_eq!(q["size"], 1000);

        let empty = build_definitions_query("", "", 10);
        assert_eq!(empty["query"]["bool"]["must"].as_array().unwrap().len(), 0);
    }
}
