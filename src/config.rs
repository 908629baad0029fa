// src/config.rs
//! Service configuration.
//!
//! One YAML file configures every service the binary can host. Components
//! receive the records they need through their constructors; nothing reads
//! configuration from a global registry.

use crate::error::{Result, VigilError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VigilError::Config(format!("cannot read config file: {}", e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| VigilError::Config(format!("bad config: {}", e)))
    }
}

/// HTTP API listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path to the index template installed at API startup. Installation
    /// failure is fatal.
    #[serde(default = "default_index_template")]
    pub index_template: String,
    /// Query result limit. Result sets beyond it are discarded.
    #[serde(default = "default_api_size")]
    pub size: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            index_template: default_index_template(),
            size: default_api_size(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_index_template() -> String {
    "/etc/vigil/metrics.template".to_string()
}

fn default_api_size() -> u64 {
    10000
}

/// Message bus client settings, shared by consumers and producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Broker address, e.g. `192.168.1.191:1883`.
    #[serde(default = "default_bus_uri")]
    pub uri: String,
    /// Consumer group this service belongs to.
    #[serde(default = "default_group")]
    pub group: String,
    /// Back-off in seconds between reconnect attempts.
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
    /// Send ack timeout in seconds.
    #[serde(default = "default_ack_time")]
    pub ack_time: u64,
    /// Connection retries before an error is surfaced.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Acknowledge deliveries automatically as they are received.
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Fire-and-forget sends instead of awaiting broker acks.
    #[serde(default = "default_true", rename = "async")]
    pub async_send: bool,
    /// Send bodies verbatim. When false, bodies are JSON-parsed and list
    /// entries are fanned out as individual records.
    #[serde(default = "default_true")]
    pub compact: bool,
    /// Partitions this client consumes from / produces to.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<u32>,
    /// Drop sends on the floor. Test mode only.
    #[serde(default)]
    pub drop_data: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: default_bus_uri(),
            group: default_group(),
            wait_time: default_wait_time(),
            ack_time: default_ack_time(),
            max_retry: default_max_retry(),
            auto_commit: true,
            async_send: true,
            compact: true,
            partitions: default_partitions(),
            drop_data: false,
        }
    }
}

fn default_bus_uri() -> String {
    "127.0.0.1:1883".to_string()
}

fn default_group() -> String {
    "api".to_string()
}

fn default_wait_time() -> u64 {
    1
}

fn default_ack_time() -> u64 {
    20
}

fn default_max_retry() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> Vec<u32> {
    vec![0]
}

/// Document store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store address, e.g. `http://192.168.1.191:9200/`.
    #[serde(default = "default_store_uri")]
    pub uri: String,
    /// Drop writes on the floor. Test mode only.
    #[serde(default)]
    pub drop_data: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_store_uri(),
            drop_data: false,
        }
    }
}

fn default_store_uri() -> String {
    "http://127.0.0.1:9200/".to_string()
}

/// How documents are routed to time-sharded indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Strategy name: `fixed` or `timed`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_index_prefix")]
    pub prefix: String,
    /// Static index name used by the `fixed` strategy.
    #[serde(default)]
    pub fixed_name: String,
    /// Bucket width for the `timed` strategy: `h`, `d`, `w`, `m` or `y`.
    #[serde(default = "default_time_unit")]
    pub time_unit: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            prefix: default_index_prefix(),
            fixed_name: String::new(),
            time_unit: default_time_unit(),
        }
    }
}

fn default_strategy() -> String {
    "fixed".to_string()
}

fn default_index_prefix() -> String {
    "data_".to_string()
}

fn default_time_unit() -> String {
    "m".to_string()
}

/// Topic and doc-type names for the two logical streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_metrics_topic")]
    pub metrics: String,
    #[serde(default = "default_alarms_topic")]
    pub alarms: String,
    #[serde(default = "default_defs_doc_type")]
    pub alarm_definitions_doc_type: String,
    #[serde(default = "default_methods_doc_type")]
    pub notification_methods_doc_type: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics_topic(),
            alarms: default_alarms_topic(),
            alarm_definitions_doc_type: default_defs_doc_type(),
            notification_methods_doc_type: default_methods_doc_type(),
        }
    }
}

fn default_metrics_topic() -> String {
    "metrics".to_string()
}

fn default_alarms_topic() -> String {
    "alarms".to_string()
}

fn default_defs_doc_type() -> String {
    "alarmdefinitions".to_string()
}

fn default_methods_doc_type() -> String {
    "notificationmethods".to_string()
}

/// Threshold engine cadence and definition query filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between alarm evaluation sweeps.
    #[serde(default = "default_check_alarm_interval")]
    pub check_alarm_interval: u64,
    /// Seconds between alarm definition refreshes.
    #[serde(default = "default_check_alarm_def_interval")]
    pub check_alarm_def_interval: u64,
    /// Name filter for the definition query; empty matches all.
    #[serde(default)]
    pub name: String,
    /// Dimension filter (`k1:v1,k2:v2`) for the definition query.
    #[serde(default)]
    pub dimensions: String,
    /// Definition query result limit.
    #[serde(default = "default_defs_size")]
    pub size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_alarm_interval: default_check_alarm_interval(),
            check_alarm_def_interval: default_check_alarm_def_interval(),
            name: String::new(),
            dimensions: String::new(),
            size: default_defs_size(),
        }
    }
}

fn default_check_alarm_interval() -> u64 {
    60
}

fn default_check_alarm_def_interval() -> u64 {
    120
}

fn default_defs_size() -> u64 {
    1000
}

/// SMTP account used for EMAIL notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_username")]
    pub username: String,
    #[serde(default = "default_smtp_password")]
    pub password: String,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            username: default_smtp_username(),
            password: default_smtp_password(),
            smtp_host: default_smtp_host(),
            port: default_smtp_port(),
            use_tls: true,
        }
    }
}

fn default_smtp_username() -> String {
    "vigil.notification@example.com".to_string()
}

fn default_smtp_password() -> String {
    "password".to_string()
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert_eq!(cfg.bus.wait_time, 1);
        assert_eq!(cfg.bus.max_retry, 3);
        assert!(cfg.bus.auto_commit);
        assert_eq!(cfg.bus.partitions, vec![0]);
        assert_eq!(cfg.engine.check_alarm_interval, 60);
        assert_eq!(cfg.engine.check_alarm_def_interval, 120);
        assert_eq!(cfg.index.prefix, "data_");
        assert_eq!(cfg.topics.metrics, "metrics");
        assert_eq!(cfg.topics.alarms, "alarms");
    }

    #[test]
    fn partial_override() {
        let cfg = Config::from_yaml(
            r#"
bus:
  uri: "10.0.0.5:1883"
  auto_commit: false
  partitions: [0, 1, 2]
index:
  strategy: timed
  time_unit: d
engine:
  check_alarm_interval: 5
"#,
        )
        .unwrap();
        assert_eq!(cfg.bus.uri, "10.0.0.5:1883");
        assert!(!cfg.bus.auto_commit);
        assert_eq!(cfg.bus.partitions.len(), 3);
        assert_eq!(cfg.index.strategy, "timed");
        assert_eq!(cfg.index.time_unit, "d");
        assert_eq!(cfg.engine.check_alarm_interval, 5);
        // untouched sections keep defaults
        assert_eq!(cfg.smtp.port, 25);
    }

    #[test]
    fn bad_yaml_is_a_config_error() {
        assert!(Config::from_yaml("bus: [not, a, map]").is_err());
    }

    #[test]
    fn load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "engine:\n  name: \"cpu\"").unwrap();
        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.engine.name, "cpu");
        assert!(Config::from_file("/nonexistent/vigil.yaml").is_err());
    }
}
