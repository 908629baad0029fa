// src/threshold.rs
//! Per-alarm-definition streaming evaluator.
//!
//! One `ThresholdProcessor` holds one alarm definition. Matched samples are
//! appended to per-leaf sliding windows inside buckets; a bucket is one
//! evaluation instance of the definition, keyed by the `match_by` dimension
//! values of the samples that created it (or a single ungrouped bucket when
//! `match_by` is empty). `evaluate` recomputes every bucket's three-valued
//! state and emits an alarm event for each state change.
//!
//! Samples are windowed by the evaluator's wall clock at ingest time, not
//! by the timestamp they carry; late or reordered samples count as fresh.

use crate::error::{Result, VigilError};
use crate::expr::{calculator, parser, ExprNode, SubExpr};
use crate::types::{
    iso8601_from_secs, now_secs, AlarmDefinition, AlarmEvent, AlarmState, MetricDescriptor,
    Sample, SubAlarmStatus,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// Bucket key used when the definition has no `match_by` grouping. Real
/// keys are joins of dimension values with a trailing comma after each, so
/// the sentinel cannot collide with them.
const UNGROUPED_KEY: &str = "none";

fn reason_for(state: AlarmState) -> &'static str {
    match state {
        AlarmState::Alarm => "The alarm threshold(s) have been exceeded for the sub-alarms",
        AlarmState::Ok => "The alarm threshold(s) have not been exceeded for the sub-alarms",
        AlarmState::Undetermined => "Unable to determine the alarm state",
    }
}

/// Sliding-window state for one sub-expression inside one bucket.
struct SubState {
    state: AlarmState,
    /// `(value, ingest timestamp)` pairs, non-decreasing in timestamp.
    samples: VecDeque<(f64, f64)>,
    /// Per-period aggregates from the last evaluation, newest window first.
    values: Vec<Option<f64>>,
}

impl SubState {
    fn new() -> Self {
        Self {
            state: AlarmState::Undetermined,
            samples: VecDeque::new(),
            values: Vec::new(),
        }
    }
}

/// One evaluation instance of the alarm definition.
struct Bucket {
    state: AlarmState,
    created_ts: f64,
    updated_ts: f64,
    state_updated_ts: f64,
    /// `match_by` key/value pairs captured from the sample that created the
    /// bucket; substituted into the event's metric descriptors.
    match_dims: HashMap<String, String>,
    /// Keyed by leaf canonical string.
    subs: HashMap<String, SubState>,
}

impl Bucket {
    fn new(now: f64, match_dims: HashMap<String, String>, leaves: &[SubExpr]) -> Self {
        let mut subs = HashMap::new();
        for leaf in leaves {
            subs.insert(leaf.canonical.clone(), SubState::new());
        }
        Self {
            state: AlarmState::Undetermined,
            created_ts: now,
            updated_ts: now,
            state_updated_ts: now,
            match_dims,
            subs,
        }
    }
}

pub struct ThresholdProcessor {
    definition: AlarmDefinition,
    tree: ExprNode,
    leaves: Vec<SubExpr>,
    match_by: Vec<String>,
    buckets: BTreeMap<String, Bucket>,
}

impl ThresholdProcessor {
    /// Build a processor for one alarm definition. Fails when the
    /// definition's expression does not parse.
    pub fn new(definition: AlarmDefinition) -> Result<Self> {
        let tree = parser::parse(&definition.expression).map_err(|e| {
            VigilError::InvalidInput(format!(
                "alarm definition '{}' rejected: {}",
                definition.name, e
            ))
        })?;
        let leaves: Vec<SubExpr> = tree.leaves().into_iter().cloned().collect();
        let match_by = definition
            .match_by
            .iter()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        Ok(Self {
            definition,
            tree,
            leaves,
            match_by,
            buckets: BTreeMap::new(),
        })
    }

    pub fn definition(&self) -> &AlarmDefinition {
        &self.definition
    }

    /// Feed one sample. Best effort: samples that match no leaf, or lack a
    /// `match_by` dimension, are dropped silently.
    pub fn ingest(&mut self, sample: &Sample) {
        self.ingest_at(sample, now_secs());
    }

    pub fn ingest_at(&mut self, sample: &Sample, now: f64) {
        let name = sample.name.to_lowercase();
        for leaf in &self.leaves {
            if !leaf_matches(leaf, &name, sample) {
                continue;
            }
            let (key, match_dims) = if self.match_by.is_empty() {
                (UNGROUPED_KEY.to_string(), HashMap::new())
            } else {
                match bucket_key(&self.match_by, sample) {
                    Some(pair) => pair,
                    None => continue,
                }
            };
            let bucket = self
                .buckets
                .entry(key)
                .or_insert_with(|| Bucket::new(now, match_dims, &self.leaves));
            if let Some(sub) = bucket.subs.get_mut(&leaf.canonical) {
                sub.samples.push_back((sample.value, now));
            }
        }
    }

    /// Recompute every bucket and return an alarm event per state change.
    pub fn evaluate(&mut self) -> Vec<AlarmEvent> {
        self.evaluate_at(now_secs())
    }

    pub fn evaluate_at(&mut self, now: f64) -> Vec<AlarmEvent> {
        let mut events = Vec::new();
        for bucket in self.buckets.values_mut() {
            for leaf in &self.leaves {
                let Some(sub) = bucket.subs.get_mut(&leaf.canonical) else {
                    continue;
                };
                update_sub_state(leaf, sub, now);
            }
            let new_state = fold_state(&self.tree, &bucket.subs);
            if new_state != bucket.state {
                bucket.state = new_state;
                bucket.state_updated_ts = now;
                bucket.updated_ts = now;
                events.push(build_event(&self.definition, &self.leaves, bucket));
            }
        }
        events
    }

    /// Swap in an updated definition, carrying sample windows over by leaf
    /// position. Every sub-state and the bucket state reset to
    /// UNDETERMINED until the next evaluation; creation and last-transition
    /// timestamps survive.
    pub fn update(&mut self, new_definition: AlarmDefinition) -> Result<()> {
        let tree = parser::parse(&new_definition.expression).map_err(|e| {
            VigilError::InvalidInput(format!(
                "alarm definition '{}' rejected: {}",
                new_definition.name, e
            ))
        })?;
        let new_leaves: Vec<SubExpr> = tree.leaves().into_iter().cloned().collect();
        let now = now_secs();

        let old_buckets = std::mem::take(&mut self.buckets);
        for (key, mut old_bucket) in old_buckets {
            let mut subs = HashMap::new();
            for (i, leaf) in new_leaves.iter().enumerate() {
                let samples = self
                    .leaves
                    .get(i)
                    .and_then(|old_leaf| old_bucket.subs.remove(&old_leaf.canonical))
                    .map(|old_sub| old_sub.samples)
                    .unwrap_or_default();
                subs.insert(
                    leaf.canonical.clone(),
                    SubState {
                        state: AlarmState::Undetermined,
                        samples,
                        values: Vec::new(),
                    },
                );
            }
            self.buckets.insert(
                key,
                Bucket {
                    state: AlarmState::Undetermined,
                    created_ts: old_bucket.created_ts,
                    updated_ts: now,
                    state_updated_ts: old_bucket.state_updated_ts,
                    match_dims: old_bucket.match_dims,
                    subs,
                },
            );
        }

        self.match_by = new_definition
            .match_by
            .iter()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        self.tree = tree;
        self.leaves = new_leaves;
        self.definition = new_definition;
        Ok(())
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total samples currently held across all leaf windows.
    pub fn sample_count(&self) -> usize {
        self.buckets
            .values()
            .map(|b| b.subs.values().map(|s| s.samples.len()).sum::<usize>())
            .sum()
    }
}

fn leaf_matches(leaf: &SubExpr, sample_name_lower: &str, sample: &Sample) -> bool {
    if sample_name_lower != leaf.metric_name {
        return false;
    }
    leaf.dimensions.iter().all(|(key, value)| {
        sample
            .dimensions
            .get(key)
            .map(|v| v.eq_ignore_ascii_case(value))
            .unwrap_or(false)
    })
}

/// Join the sample's `match_by` dimension values into a bucket key, each
/// value followed by a comma. Returns `None` when a required dimension is
/// missing.
fn bucket_key(match_by: &[String], sample: &Sample) -> Option<(String, HashMap<String, String>)> {
    let mut key = String::new();
    let mut dims = HashMap::new();
    for name in match_by {
        let value = sample.dimensions.get(name)?;
        key.push_str(value);
        key.push(',');
        dims.insert(name.clone(), value.clone());
    }
    Some((key, dims))
}

/// Truncate the leaf's window to `period * periods`, partition it into
/// per-period windows anchored at `now` (newest first), and refresh the
/// leaf's aggregates and state.
fn update_sub_state(leaf: &SubExpr, sub: &mut SubState, now: f64) {
    let width = leaf.period as f64;
    let span = width * leaf.periods as f64;
    while sub
        .samples
        .front()
        .map(|&(_, ts)| ts < now - span)
        .unwrap_or(false)
    {
        sub.samples.pop_front();
    }

    let mut values = Vec::with_capacity(leaf.periods as usize);
    let mut newest_first = sub.samples.iter().rev().peekable();
    for i in 0..leaf.periods {
        let left = now - width * (i as f64 + 1.0);
        let mut window = Vec::new();
        while let Some(&&(value, ts)) = newest_first.peek() {
            if ts >= left {
                window.push(value);
                newest_first.next();
            } else {
                break;
            }
        }
        values.push(calculator::aggregate(leaf.func, &window));
    }

    sub.values = values;
    sub.state = calculator::compare_thresh(&sub.values, leaf.op, leaf.threshold);
}

fn fold_state(node: &ExprNode, subs: &HashMap<String, SubState>) -> AlarmState {
    match node {
        ExprNode::Leaf(leaf) => subs
            .get(&leaf.canonical)
            .map(|s| s.state)
            .unwrap_or(AlarmState::Undetermined),
        ExprNode::BinOp { op, operands, .. } => {
            let states: Vec<AlarmState> =
                operands.iter().map(|n| fold_state(n, subs)).collect();
            calculator::combine(*op, &states)
        }
    }
}

fn build_event(
    definition: &AlarmDefinition,
    leaves: &[SubExpr],
    bucket: &Bucket,
) -> AlarmEvent {
    let metrics = leaves
        .iter()
        .map(|leaf| {
            let mut dimensions = leaf.dimensions.clone();
            for (key, value) in &bucket.match_dims {
                dimensions.insert(key.clone(), value.clone());
            }
            MetricDescriptor {
                name: leaf.metric_name.clone(),
                dimensions,
            }
        })
        .collect();

    let sub_alarms = leaves
        .iter()
        .map(|leaf| {
            let (state, values) = bucket
                .subs
                .get(&leaf.canonical)
                .map(|s| (s.state, s.values.clone()))
                .unwrap_or((AlarmState::Undetermined, Vec::new()));
            SubAlarmStatus {
                sub_alarm_expression: leaf.descriptor(),
                sub_alarm_state: state,
                current_values: values,
            }
        })
        .collect();

    AlarmEvent {
        id: Uuid::new_v4().to_string(),
        alarm_definition: definition.clone(),
        metrics,
        state: bucket.state,
        reason: reason_for(bucket.state).to_string(),
        reason_data: serde_json::Map::new(),
        sub_alarms,
        created_timestamp: iso8601_from_secs(bucket.created_ts),
        updated_timestamp: iso8601_from_secs(bucket.updated_ts),
        state_updated_timestamp: iso8601_from_secs(bucket.state_updated_ts),
    }
}
