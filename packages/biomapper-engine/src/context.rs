//! Execution context threaded through the steps of one job

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One dataset row
pub type Record = serde_json::Map<String, Value>;

/// Ordered sequence of rows
pub type Dataset = Vec<Record>;

/// Append-only record of what a step did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl ProvenanceRecord {
    pub fn new(action: impl Into<String>, details: Value) -> Self {
        Self {
            action: action.into(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Mutable state owned by exactly one running job
///
/// Maps are ordered so that snapshots serialize deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub datasets: BTreeMap<String, Dataset>,
    #[serde(default)]
    pub statistics: BTreeMap<String, Value>,
    #[serde(default)]
    pub output_files: BTreeMap<String, String>,
    #[serde(default)]
    pub provenance: Vec<ProvenanceRecord>,
    /// Forward-compatible fields unknown to the engine
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    pub fn insert_dataset(&mut self, name: impl Into<String>, rows: Dataset) {
        self.datasets.insert(name.into(), rows);
    }

    pub fn set_statistic(&mut self, key: impl Into<String>, value: Value) {
        self.statistics.insert(key.into(), value);
    }

    pub fn record_provenance(&mut self, record: ProvenanceRecord) {
        self.provenance.push(record);
    }

    /// String values of `column` in row order (rows without a string value are skipped)
    pub fn column_values(&self, dataset: &str, column: &str) -> Option<Vec<String>> {
        self.datasets.get(dataset).map(|rows| column_values(rows, column))
    }

    /// Summary used in step records and progress payloads
    pub fn summary(&self) -> Value {
        let datasets: BTreeMap<&str, usize> = self
            .datasets
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.len()))
            .collect();
        serde_json::json!({
            "datasets": datasets,
            "statistics": self.statistics.len(),
            "provenance": self.provenance.len(),
        })
    }
}

pub fn column_values(rows: &[Record], column: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(value_as_key))
        .collect()
}

/// Key form of a scalar cell: strings as-is, numbers/bools stringified
pub fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
