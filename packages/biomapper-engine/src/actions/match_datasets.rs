use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{distinct_keys, row_key};
use crate::action::{require_dataset, ActionEnv, ActionHandler, ActionOutput, StepParams};
use crate::context::{ExecutionContext, Record};
use crate::error::{OrchestratorError, Result};
use crate::matching::{build_index, hash_partitioned_join, match_with_index, merge_join, IdMatch, MatchRecord};
use crate::resolver::ResolverRegistry;

/// Join algorithm used by `MATCH_DATASETS`; all three produce the same pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMethod {
    Hash,
    Merge,
    Partitioned,
}

impl JoinMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hash" => Some(JoinMethod::Hash),
            "merge" => Some(JoinMethod::Merge),
            "partitioned" => Some(JoinMethod::Partitioned),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JoinMethod::Hash => "hash",
            JoinMethod::Merge => "merge",
            JoinMethod::Partitioned => "partitioned",
        }
    }
}

/// Exact key join of two datasets
///
/// Params: `source`, `target`, `output_key`, `source_column` (default `id`),
/// `target_column` (default: the source column), `source_id_column` /
/// `target_id_column` (identifiers written to the match rows, default: the
/// join columns), `method` (`hash`, `merge`, `partitioned`), `partitions`.
pub struct MatchDatasetsAction;

#[async_trait]
impl ActionHandler for MatchDatasetsAction {
    fn action_type(&self) -> &'static str {
        "MATCH_DATASETS"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["source", "target", "output_key"]
    }

    fn validate_params(&self, params: &StepParams, _resolvers: &ResolverRegistry) -> Vec<String> {
        let mut problems: Vec<String> = self
            .required_params()
            .iter()
            .filter(|key| !params.has(key))
            .map(|key| {
                format!(
                    "step '{}' (MATCH_DATASETS): missing required parameter '{}'",
                    params.step(),
                    key
                )
            })
            .collect();
        if let Some(method) = params.opt_str("method") {
            if JoinMethod::from_str(method).is_none() {
                problems.push(format!(
                    "step '{}' (MATCH_DATASETS): unknown join method '{}'",
                    params.step(),
                    method
                ));
            }
        }
        problems
    }

    async fn execute(
        &self,
        params: &StepParams,
        context: &ExecutionContext,
        env: &ActionEnv,
    ) -> Result<ActionOutput> {
        let start = Instant::now();
        let source_name = params.str("source")?;
        let target_name = params.str("target")?;
        let output_key = params.str("output_key")?;
        let source_column = params.str_or("source_column", "id");
        let target_column = params.str_or("target_column", source_column);
        let source_id_column = params.str_or("source_id_column", source_column);
        let target_id_column = params.str_or("target_id_column", target_column);
        let method_name = params.str_or("method", "hash");
        let method = JoinMethod::from_str(method_name).ok_or_else(|| {
            OrchestratorError::config(format!("unknown join method '{}'", method_name))
        })?;

        let source = require_dataset(context, params.step(), source_name)?;
        let target = require_dataset(context, params.step(), target_name)?;

        let source_rows: Vec<&Record> = source.iter().collect();
        let target_rows: Vec<&Record> = target.iter().collect();
        let source_key = |row: &&Record| row_key(row, source_column);
        let target_key = |row: &&Record| row_key(row, target_column);

        let joined: Vec<MatchRecord<&Record, &Record>> = match method {
            JoinMethod::Hash => {
                let index = build_index(&target_rows, target_key);
                match_with_index(&source_rows, &index, source_key)
            }
            JoinMethod::Merge => merge_join(&source_rows, &target_rows, source_key, target_key),
            JoinMethod::Partitioned => {
                let partitions = params.usize_or("partitions", num_cpus::get());
                hash_partitioned_join(&source_rows, &target_rows, source_key, target_key, partitions)
            }
        };

        let matches: Vec<IdMatch> = joined
            .into_iter()
            .map(|m| {
                let value = m.match_value.clone();
                m.map(
                    |s| row_key(s, source_id_column).unwrap_or_else(|| value.clone()),
                    |t| row_key(t, target_id_column).unwrap_or_else(|| value.clone()),
                )
            })
            .collect();

        let matched_keys: ahash::AHashSet<&str> =
            matches.iter().map(|m| m.match_value.as_str()).collect();
        let unmatched_sources = distinct_keys(source, source_column)
            .into_iter()
            .filter(|key| !matched_keys.contains(key.as_str()))
            .count();

        info!(
            "Job {} step '{}': {} x {} rows -> {} matches via {} join in {:?}",
            env.job_id,
            env.step_name,
            source.len(),
            target.len(),
            matches.len(),
            method.as_str(),
            start.elapsed()
        );

        let rows: Vec<Record> = matches.iter().map(IdMatch::to_record).collect();
        Ok(ActionOutput::new()
            .with_statistic(format!("{}_matches", output_key), json!(rows.len()))
            .with_statistic(
                format!("{}_unmatched_sources", output_key),
                json!(unmatched_sources),
            )
            .with_details(json!({
                "source": source_name,
                "target": target_name,
                "method": method.as_str(),
                "matches": rows.len(),
            }))
            .with_message(format!("{} matches", rows.len()))
            .with_dataset(output_key, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{env, rows};

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.insert_dataset(
            "src",
            rows(json!([
                {"name": "a", "uniprot": "P1"},
                {"name": "b", "uniprot": "P2"},
                {"name": "c", "uniprot": "P9"},
                {"name": "d"},
            ])),
        );
        ctx.insert_dataset(
            "tgt",
            rows(json!([
                {"acc": "P2", "gene": "G2"},
                {"acc": "P1", "gene": "G1"},
                {"acc": "P1", "gene": "G1b"},
            ])),
        );
        ctx
    }

    fn params(method: &str) -> StepParams {
        StepParams::from_value(
            "join",
            &json!({
                "source": "src",
                "target": "tgt",
                "source_column": "uniprot",
                "target_column": "acc",
                "source_id_column": "name",
                "target_id_column": "gene",
                "method": method,
                "partitions": 3,
                "output_key": "pairs",
            }),
        )
    }

    #[tokio::test]
    async fn test_methods_agree() {
        let env = env(ResolverRegistry::new());
        let ctx = context();

        let mut results = Vec::new();
        for method in ["hash", "merge", "partitioned"] {
            let out = MatchDatasetsAction
                .execute(&params(method), &ctx, &env)
                .await
                .unwrap();
            let mut pairs: Vec<(String, String)> = out.datasets["pairs"]
                .iter()
                .filter_map(IdMatch::from_record)
                .map(|m| (m.source, m.target))
                .collect();
            pairs.sort();
            assert_eq!(out.statistics["pairs_unmatched_sources"], 1);
            results.push(pairs);
        }

        let expected = vec![
            ("a".to_string(), "G1".to_string()),
            ("a".to_string(), "G1b".to_string()),
            ("b".to_string(), "G2".to_string()),
        ];
        for pairs in results {
            assert_eq!(pairs, expected);
        }
    }

    #[tokio::test]
    async fn test_missing_dataset_fails_step() {
        let env = env(ResolverRegistry::new());
        let err = MatchDatasetsAction
            .execute(&params("hash"), &ExecutionContext::new(), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StepExecutionFailed { .. }));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let problems = MatchDatasetsAction.validate_params(&params("nested_loop"), &ResolverRegistry::new());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("nested_loop"));
    }
}
