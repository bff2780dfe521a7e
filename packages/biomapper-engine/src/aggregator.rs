//! Complete per-input results
//!
//! Every input identifier ends up with exactly one entry: matched, no mapping
//! found, or error. Successful matches survive a pipeline failure.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::{value_as_key, ExecutionContext, Record};
use crate::matching::{IdMatch, MatchType};

/// Columns of an error row: the failed identifier and why it failed
pub const ERROR_ID: &str = "id";
pub const ERROR_TYPE: &str = "error_type";
pub const ERROR_MESSAGE: &str = "error_message";

pub fn error_record(id: &str, error_type: &str, message: &str) -> Record {
    let mut row = Record::new();
    row.insert(ERROR_ID.into(), Value::String(id.to_string()));
    row.insert(ERROR_TYPE.into(), Value::String(error_type.to_string()));
    row.insert(ERROR_MESSAGE.into(), Value::String(message.to_string()));
    row
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Matched,
    NoMappingFound,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Matched => "matched",
            ResultStatus::NoMappingFound => "no_mapping_found",
            ResultStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedTarget {
    pub target_id: String,
    pub match_value: String,
    pub match_type: MatchType,
    pub confidence: f64,
    pub resolved_externally: bool,
}

/// Result entry for one input identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub input_id: String,
    pub status: ResultStatus,
    pub targets: Vec<MappedTarget>,
    /// Best target confidence; 0.0 when unmatched
    pub confidence: f64,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl ResultEntry {
    pub fn to_record(&self) -> Record {
        let mut row = Record::new();
        row.insert("input_id".into(), Value::String(self.input_id.clone()));
        row.insert("status".into(), Value::String(self.status.as_str().into()));
        row.insert(
            "target_ids".into(),
            Value::Array(
                self.targets
                    .iter()
                    .map(|t| Value::String(t.target_id.clone()))
                    .collect(),
            ),
        );
        row.insert("confidence".into(), serde_json::json!(self.confidence));
        row.insert(
            "error_type".into(),
            self.error_type.clone().map(Value::String).unwrap_or(Value::Null),
        );
        row.insert(
            "error_message".into(),
            self.error_message
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        row
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub entries: Vec<ResultEntry>,
    pub matched: usize,
    pub unmapped: usize,
    pub errored: usize,
}

impl AggregatedResult {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn to_records(&self) -> Vec<Record> {
        self.entries.iter().map(ResultEntry::to_record).collect()
    }

    /// Job result payload
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "total": self.total(),
            "matched": self.matched,
            "unmapped": self.unmapped,
            "errored": self.errored,
            "results": self.entries,
        })
    }
}

#[derive(Debug, Clone)]
struct ErrorInfo {
    error_type: String,
    message: String,
}

/// Collects matches and errors for a fixed input set
#[derive(Debug, Default)]
pub struct ResultAggregator {
    /// Deduplicated inputs in first-seen order
    inputs: Vec<String>,
    positions: AHashMap<String, usize>,
    matches: Vec<Vec<MappedTarget>>,
    errors: Vec<Option<ErrorInfo>>,
    ignored: usize,
}

impl ResultAggregator {
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut aggregator = Self::default();
        for input in inputs {
            let input = input.into();
            if aggregator.positions.contains_key(&input) {
                continue;
            }
            aggregator.positions.insert(input.clone(), aggregator.inputs.len());
            aggregator.inputs.push(input);
        }
        aggregator.matches = vec![Vec::new(); aggregator.inputs.len()];
        aggregator.errors = vec![None; aggregator.inputs.len()];
        aggregator
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Matches/errors that referred to identifiers outside the input set
    pub fn ignored_count(&self) -> usize {
        self.ignored
    }

    /// Attach a match to its source input; returns false for unknown sources
    pub fn record_match(&mut self, m: &IdMatch) -> bool {
        let Some(&pos) = self.positions.get(&m.source) else {
            warn!("Ignoring match for unknown input '{}'", m.source);
            self.ignored += 1;
            return false;
        };
        let targets = &mut self.matches[pos];
        if !targets.iter().any(|t| t.target_id == m.target && t.match_value == m.match_value) {
            targets.push(MappedTarget {
                target_id: m.target.clone(),
                match_value: m.match_value.clone(),
                match_type: m.match_type,
                confidence: m.confidence,
                resolved_externally: m.resolved_externally,
            });
        }
        true
    }

    pub fn record_matches<'a>(&mut self, matches: impl IntoIterator<Item = &'a IdMatch>) {
        for m in matches {
            self.record_match(m);
        }
    }

    /// Aggregator over the inputs of `input_dataset`, fed from match and error datasets
    ///
    /// Missing match/error datasets are skipped (the step producing them may
    /// have failed). Returns `None` when the input dataset itself is missing.
    pub fn from_context(
        context: &ExecutionContext,
        input_dataset: &str,
        input_column: &str,
        match_datasets: &[String],
        error_datasets: &[String],
    ) -> Option<Self> {
        let inputs = context.column_values(input_dataset, input_column)?;
        let mut aggregator = Self::new(inputs);

        for name in match_datasets {
            for row in context.dataset(name).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(m) = IdMatch::from_record(row) {
                    aggregator.record_match(&m);
                }
            }
        }
        for name in error_datasets {
            for row in context.dataset(name).map(Vec::as_slice).unwrap_or(&[]) {
                let Some(id) = row.get(ERROR_ID).and_then(value_as_key) else {
                    continue;
                };
                let error_type = row
                    .get(ERROR_TYPE)
                    .and_then(Value::as_str)
                    .unwrap_or("error");
                let message = row
                    .get(ERROR_MESSAGE)
                    .and_then(Value::as_str)
                    .unwrap_or("processing failed");
                aggregator.record_error(&id, error_type, message);
            }
        }
        Some(aggregator)
    }

    /// Mark an input as failed; the first error recorded for an input is kept
    pub fn record_error(
        &mut self,
        input_id: &str,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let Some(&pos) = self.positions.get(input_id) else {
            warn!("Ignoring error for unknown input '{}'", input_id);
            self.ignored += 1;
            return false;
        };
        if self.errors[pos].is_none() {
            self.errors[pos] = Some(ErrorInfo {
                error_type: error_type.into(),
                message: message.into(),
            });
        }
        true
    }

    /// Build one entry per input
    ///
    /// `pipeline_error` (type, message) marks every input without a match as
    /// errored instead of unmapped.
    pub fn finish(self, pipeline_error: Option<(&str, &str)>) -> AggregatedResult {
        let mut result = AggregatedResult::default();

        for ((input_id, targets), error) in self
            .inputs
            .into_iter()
            .zip(self.matches)
            .zip(self.errors)
        {
            let entry = if !targets.is_empty() {
                result.matched += 1;
                let confidence = targets.iter().map(|t| t.confidence).fold(0.0, f64::max);
                ResultEntry {
                    input_id,
                    status: ResultStatus::Matched,
                    targets,
                    confidence,
                    error_type: None,
                    error_message: None,
                }
            } else if let Some(err) = error.or_else(|| {
                pipeline_error.map(|(t, m)| ErrorInfo {
                    error_type: t.to_string(),
                    message: m.to_string(),
                })
            }) {
                result.errored += 1;
                ResultEntry {
                    input_id,
                    status: ResultStatus::Error,
                    targets,
                    confidence: 0.0,
                    error_type: Some(err.error_type),
                    error_message: Some(err.message),
                }
            } else {
                result.unmapped += 1;
                ResultEntry {
                    input_id,
                    status: ResultStatus::NoMappingFound,
                    targets,
                    confidence: 0.0,
                    error_type: None,
                    error_message: Some("no mapping found".to_string()),
                }
            };
            result.entries.push(entry);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(source: &str, target: &str, confidence: f64) -> IdMatch {
        IdMatch::new(source.into(), target.into(), target, MatchType::Exact)
            .with_confidence(confidence)
    }

    #[test]
    fn test_every_input_gets_an_entry() {
        let mut agg = ResultAggregator::new(["A", "B", "C", "A"]);
        assert_eq!(agg.input_count(), 3);

        agg.record_match(&m("A", "X", 0.8));
        agg.record_match(&m("A", "Y", 1.0));
        agg.record_error("C", "resolver", "timeout");
        assert!(!agg.record_match(&m("Z", "X", 1.0)));

        let result = agg.finish(None);
        assert_eq!(result.total(), 3);
        assert_eq!((result.matched, result.unmapped, result.errored), (1, 1, 1));

        let a = &result.entries[0];
        assert_eq!(a.status, ResultStatus::Matched);
        assert_eq!(a.targets.len(), 2);
        assert_eq!(a.confidence, 1.0);

        let b = &result.entries[1];
        assert_eq!(b.status, ResultStatus::NoMappingFound);
        assert_eq!(b.confidence, 0.0);

        let c = &result.entries[2];
        assert_eq!(c.status, ResultStatus::Error);
        assert_eq!(c.error_type.as_deref(), Some("resolver"));
    }

    #[test]
    fn test_pipeline_error_preserves_matches() {
        let mut agg = ResultAggregator::new(["A", "B"]);
        agg.record_match(&m("A", "X", 1.0));

        let result = agg.finish(Some(("step_execution", "step 3 failed")));
        assert_eq!(result.entries[0].status, ResultStatus::Matched);
        assert_eq!(result.entries[1].status, ResultStatus::Error);
        assert_eq!(
            result.entries[1].error_message.as_deref(),
            Some("step 3 failed")
        );
    }

    #[test]
    fn test_duplicate_matches_collapse() {
        let mut agg = ResultAggregator::new(["A"]);
        agg.record_match(&m("A", "X", 1.0));
        agg.record_match(&m("A", "X", 1.0));
        let result = agg.finish(None);
        assert_eq!(result.entries[0].targets.len(), 1);
    }

    #[test]
    fn test_records_and_value() {
        let mut agg = ResultAggregator::new(["A", "B"]);
        agg.record_match(&m("A", "X", 1.0));
        let result = agg.finish(None);

        let rows = result.to_records();
        assert_eq!(rows[0]["status"], "matched");
        assert_eq!(rows[0]["target_ids"][0], "X");
        assert_eq!(rows[1]["status"], "no_mapping_found");

        let value = result.to_value();
        assert_eq!(value["total"], 2);
        assert_eq!(value["results"][1]["status"], "no_mapping_found");
    }
}
