//! Built-in actions
//!
//! Each action reads named datasets from the context and returns new ones.
//! Matches are written in the match-row layout of `IdMatch::to_record`, errors
//! in the layout of `aggregator::error_record`, so later steps can consume
//! the output of earlier ones without extra configuration.

mod aggregate_results;
mod bidirectional_validate;
mod composite_match;
mod create_dataset;
mod match_datasets;
mod resolve_identifiers;

use std::sync::Arc;

use serde_json::Value;

use crate::action::ActionHandler;
use crate::context::{value_as_key, Record};

pub use aggregate_results::AggregateResultsAction;
pub use bidirectional_validate::BidirectionalValidateAction;
pub use composite_match::CompositeMatchAction;
pub use create_dataset::CreateDatasetAction;
pub use match_datasets::{JoinMethod, MatchDatasetsAction};
pub use resolve_identifiers::ResolveIdentifiersAction;

/// Every built-in handler, for `ActionRegistry::with_builtin_actions`
pub fn builtin_actions() -> Vec<Arc<dyn ActionHandler>> {
    vec![
        Arc::new(CreateDatasetAction),
        Arc::new(MatchDatasetsAction),
        Arc::new(CompositeMatchAction),
        Arc::new(ResolveIdentifiersAction),
        Arc::new(BidirectionalValidateAction),
        Arc::new(AggregateResultsAction),
    ]
}

/// Trimmed, non-empty key of `column` in `row`
pub(crate) fn row_key(row: &Record, column: &str) -> Option<String> {
    row.get(column)
        .and_then(value_as_key)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Distinct keys of `column`, in first-seen order
pub(crate) fn distinct_keys(rows: &[Record], column: &str) -> Vec<String> {
    let mut seen = ahash::AHashSet::new();
    rows.iter()
        .filter_map(|row| row_key(row, column))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

pub(crate) fn one_row(column: &str, value: impl Into<String>) -> Record {
    let mut row = Record::new();
    row.insert(column.to_string(), Value::String(value.into()));
    row
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::action::ActionEnv;
    use crate::batch::BatchRunner;
    use crate::config::BatchConfig;
    use crate::context::Record;
    use crate::matching::IdNormalizer;
    use crate::progress::ProgressTracker;
    use crate::resolver::ResolverRegistry;

    pub fn env(resolvers: ResolverRegistry) -> ActionEnv {
        let config = BatchConfig {
            max_concurrent: 2,
            chunk_size: 2,
            max_attempts: 2,
            backoff_ms: 1,
            timeout_secs: 5,
        };
        let cancel = CancellationToken::new();
        ActionEnv {
            job_id: Uuid::new_v4(),
            step_index: 0,
            step_name: "test".into(),
            cancel: cancel.clone(),
            batch: BatchRunner::new(&config, cancel),
            chunk_size: config.chunk_size,
            progress: Arc::new(ProgressTracker::new(Uuid::new_v4(), 1, 10)),
            resolvers: Arc::new(resolvers),
            normalizer: IdNormalizer::new(["UniProtKB:"]),
        }
    }

    pub fn rows(value: Value) -> Vec<Record> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_object().cloned()).collect())
            .unwrap_or_default()
    }
}
