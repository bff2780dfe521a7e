use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Record;

/// How a match was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Equal join keys
    Exact,
    /// Equal full identifiers
    Direct,
    /// One atomic part of a composite identifier
    Composite,
    /// Resolved through a retired/secondary identifier
    Historical,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Direct => "direct",
            MatchType::Composite => "composite",
            MatchType::Historical => "historical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchType::Exact),
            "direct" => Some(MatchType::Direct),
            "composite" => Some(MatchType::Composite),
            "historical" => Some(MatchType::Historical),
            _ => None,
        }
    }
}

/// A single source/target pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord<S, T> {
    pub source: S,
    pub target: T,
    /// The key both sides agreed on
    pub match_value: String,
    pub match_type: MatchType,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Established by an external resolver rather than a local join
    pub resolved_externally: bool,
}

impl<S, T> MatchRecord<S, T> {
    pub fn new(source: S, target: T, match_value: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            source,
            target,
            match_value: match_value.into(),
            match_type,
            confidence: 1.0,
            resolved_externally: false,
        }
    }

    pub fn exact(source: S, target: T, match_value: impl Into<String>) -> Self {
        Self::new(source, target, match_value, MatchType::Exact)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn external(mut self) -> Self {
        self.resolved_externally = true;
        self
    }

    pub fn map<S2, T2>(self, fs: impl FnOnce(S) -> S2, ft: impl FnOnce(T) -> T2) -> MatchRecord<S2, T2> {
        MatchRecord {
            source: fs(self.source),
            target: ft(self.target),
            match_value: self.match_value,
            match_type: self.match_type,
            confidence: self.confidence,
            resolved_externally: self.resolved_externally,
        }
    }
}

/// Identifier-level match, the form stored in datasets
pub type IdMatch = MatchRecord<String, String>;

pub const SOURCE_ID: &str = "source_id";
pub const TARGET_ID: &str = "target_id";
pub const MATCH_VALUE: &str = "match_value";
pub const MATCH_TYPE: &str = "match_type";
pub const CONFIDENCE: &str = "confidence";
pub const RESOLVED_EXTERNALLY: &str = "resolved_externally";

impl IdMatch {
    pub fn to_record(&self) -> Record {
        let mut row = Record::new();
        row.insert(SOURCE_ID.into(), Value::String(self.source.clone()));
        row.insert(TARGET_ID.into(), Value::String(self.target.clone()));
        row.insert(MATCH_VALUE.into(), Value::String(self.match_value.clone()));
        row.insert(MATCH_TYPE.into(), Value::String(self.match_type.as_str().into()));
        row.insert(CONFIDENCE.into(), serde_json::json!(self.confidence));
        row.insert(RESOLVED_EXTERNALLY.into(), Value::Bool(self.resolved_externally));
        row
    }

    /// Parse a match row; `None` if the identifier columns are missing
    pub fn from_record(row: &Record) -> Option<Self> {
        let source = row.get(SOURCE_ID)?.as_str()?.to_string();
        let target = row.get(TARGET_ID)?.as_str()?.to_string();
        let match_value = row
            .get(MATCH_VALUE)
            .and_then(Value::as_str)
            .unwrap_or(&target)
            .to_string();
        let match_type = row
            .get(MATCH_TYPE)
            .and_then(Value::as_str)
            .and_then(MatchType::from_str)
            .unwrap_or(MatchType::Exact);
        let confidence = row.get(CONFIDENCE).and_then(Value::as_f64).unwrap_or(1.0);
        let resolved_externally = row
            .get(RESOLVED_EXTERNALLY)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Some(MatchRecord {
            source,
            target,
            match_value,
            match_type,
            confidence,
            resolved_externally,
        })
    }
}
