// src/types.rs
//! Core data model: metric samples, alarm definitions, alarm state and
//! events, notification methods, and the time helpers used to render them.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Current wall clock as fractional seconds since the epoch.
pub fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Render epoch seconds as an ISO 8601 timestamp (UTC, second precision).
pub fn iso8601_from_secs(secs: f64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Canonical md5 digest of a dimension set: keys sorted, compact JSON.
/// Attached to stored samples so queries can group by dimension set.
pub fn dimensions_hash(dimensions: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = dimensions.iter().collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// One metric sample as carried on the bus and matched by the evaluator.
///
/// `timestamp` may be absent on ingest; the persister fills it before the
/// sample reaches the store. Provenance fields injected by the ingestion
/// middleware ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    pub value: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Alarm severity. Unknown values collapse to LOW, matching what the API
/// stores for definitions posted with a bad severity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE", from = "String")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        match s.to_uppercase().as_str() {
            "MEDIUM" => Severity::Medium,
            "HIGH" => Severity::High,
            "CRITICAL" => Severity::Critical,
            _ => Severity::Low,
        }
    }
}

/// Three-valued alarm state: OK is false, ALARM is true, UNDETERMINED is
/// unknown due to missing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmState {
    Ok,
    Alarm,
    #[default]
    Undetermined,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Ok => "OK",
            AlarmState::Alarm => "ALARM",
            AlarmState::Undetermined => "UNDETERMINED",
        }
    }
}

impl std::fmt::Display for AlarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aggregate-threshold clause of an alarm expression, in the
/// `expression_data` document shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAlarmDescriptor {
    pub function: String,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
    pub operator: String,
    pub threshold: f64,
    #[serde(default = "default_period")]
    pub period: u64,
    #[serde(default = "default_periods")]
    pub periods: u32,
}

fn default_period() -> u64 {
    60
}

fn default_periods() -> u32 {
    1
}

/// A user-defined alarm definition as stored in the document store and
/// observed by the definition refresher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub expression: String,
    #[serde(default)]
    pub match_by: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub alarm_actions: Vec<String>,
    #[serde(default)]
    pub ok_actions: Vec<String>,
    #[serde(default)]
    pub undetermined_actions: Vec<String>,
    #[serde(default)]
    pub expression_data: Vec<SubAlarmDescriptor>,
}

impl AlarmDefinition {
    /// Action ids for a given alarm state.
    pub fn actions_for(&self, state: AlarmState) -> &[String] {
        match state {
            AlarmState::Alarm => &self.alarm_actions,
            AlarmState::Ok => &self.ok_actions,
            AlarmState::Undetermined => &self.undetermined_actions,
        }
    }
}

/// A metric identity (name plus dimension set) referenced by an alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    pub dimensions: HashMap<String, String>,
}

/// Per-leaf evaluation detail embedded in an alarm event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAlarmStatus {
    pub sub_alarm_expression: SubAlarmDescriptor,
    pub sub_alarm_state: AlarmState,
    pub current_values: Vec<Option<f64>>,
}

/// An alarm state transition, published to the alarms topic and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: String,
    pub alarm_definition: AlarmDefinition,
    pub metrics: Vec<MetricDescriptor>,
    pub state: AlarmState,
    pub reason: String,
    pub reason_data: serde_json::Map<String, serde_json::Value>,
    pub sub_alarms: Vec<SubAlarmStatus>,
    pub created_timestamp: String,
    pub updated_timestamp: String,
    pub state_updated_timestamp: String,
}

/// Supported notification delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationType {
    Email,
    Pageduty,
    Webhook,
}

impl NotificationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "EMAIL" => Some(NotificationType::Email),
            "PAGEDUTY" => Some(NotificationType::Pageduty),
            "WEBHOOK" => Some(NotificationType::Webhook),
            _ => None,
        }
    }
}

/// A notification method document: where an alarm action is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMethod {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub method_type: NotificationType,
    pub address: String,
}
