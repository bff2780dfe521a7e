use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::distinct_keys;
use crate::action::{require_dataset, ActionEnv, ActionHandler, ActionOutput, StepParams};
use crate::aggregator::error_record;
use crate::context::{ExecutionContext, Record};
use crate::error::Result;
use crate::matching::{IdMatch, MatchType};
use crate::resolver::ResolverRegistry;

/// Resolve identifiers through a registered external resolver
///
/// Distinct identifiers are sent in sub-batches of `chunk_size` through the
/// job's batch runner. A sub-batch that exhausts its retries only marks its
/// own identifiers as errored (`errors_key`); the step itself succeeds.
///
/// Params: `input`, `resolver`, `output_key`, `column` (default `id`),
/// `errors_key` (default `<output_key>_errors`), `chunk_size`, `confidence`,
/// `match_type` (default `exact`).
pub struct ResolveIdentifiersAction;

#[async_trait]
impl ActionHandler for ResolveIdentifiersAction {
    fn action_type(&self) -> &'static str {
        "RESOLVE_IDENTIFIERS"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["input", "resolver", "output_key"]
    }

    fn validate_params(&self, params: &StepParams, resolvers: &ResolverRegistry) -> Vec<String> {
        let mut problems: Vec<String> = self
            .required_params()
            .iter()
            .filter(|key| !params.has(key))
            .map(|key| {
                format!(
                    "step '{}' (RESOLVE_IDENTIFIERS): missing required parameter '{}'",
                    params.step(),
                    key
                )
            })
            .collect();
        if let Some(name) = params.opt_str("resolver") {
            if !resolvers.contains(name) {
                problems.push(format!(
                    "step '{}' (RESOLVE_IDENTIFIERS): unknown resolver '{}'",
                    params.step(),
                    name
                ));
            }
        }
        if let Some(kind) = params.opt_str("match_type") {
            if MatchType::from_str(kind).is_none() {
                problems.push(format!(
                    "step '{}' (RESOLVE_IDENTIFIERS): unknown match type '{}'",
                    params.step(),
                    kind
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
        let input = params.str("input")?;
        let resolver_name = params.str("resolver")?;
        let output_key = params.str("output_key")?;
        let column = params.str_or("column", "id");
        let errors_key = params
            .opt_str("errors_key")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_errors", output_key));
        let chunk_size = params.usize_or("chunk_size", env.chunk_size);
        let confidence = params.f64_or("confidence", 1.0);
        let match_type = params
            .opt_str("match_type")
            .and_then(MatchType::from_str)
            .unwrap_or(MatchType::Exact);

        let resolver = env.resolver(resolver_name)?;
        let ids = distinct_keys(require_dataset(context, params.step(), input)?, column);
        let total = ids.len();

        let progress = env.progress.clone();
        let step_name = env.step_name.clone();
        let report = env
            .batch
            .run(ids, chunk_size, |chunk| {
                let resolver = Arc::clone(&resolver);
                let progress = progress.clone();
                let step_name = step_name.clone();
                async move {
                    let resolved = resolver.resolve(&chunk).await?;
                    progress.message(format!(
                        "{}: resolved {} of {} identifiers in sub-batch",
                        step_name,
                        resolved.len(),
                        chunk.len()
                    ));
                    Ok((chunk, resolved))
                }
            })
            .await;

        let mut matches: Vec<IdMatch> = Vec::new();
        let mut resolved_ids = 0usize;
        for (_, (chunk, resolved)) in &report.succeeded {
            for id in chunk {
                let Some(targets) = resolved.get(id) else {
                    continue;
                };
                if !targets.is_empty() {
                    resolved_ids += 1;
                }
                for target in targets {
                    matches.push(
                        IdMatch::new(id.clone(), target.clone(), id.as_str(), match_type)
                            .with_confidence(confidence)
                            .external(),
                    );
                }
            }
        }

        let mut errors: Vec<Record> = Vec::new();
        for failed in &report.failed {
            for id in &failed.items {
                errors.push(error_record(id, "resolver", &failed.error));
            }
        }
        for (_, items) in &report.skipped {
            for id in items {
                errors.push(error_record(id, "cancelled", "sub-batch skipped after cancellation"));
            }
        }
        if !errors.is_empty() {
            warn!(
                "Job {} step '{}': {} identifiers not resolved by '{}' ({} failed sub-batches)",
                env.job_id,
                env.step_name,
                errors.len(),
                resolver_name,
                report.failed.len()
            );
        }

        info!(
            "Job {} step '{}': resolved {}/{} identifiers via '{}' in {:?}",
            env.job_id,
            env.step_name,
            resolved_ids,
            total,
            resolver_name,
            start.elapsed()
        );

        let rows: Vec<Record> = matches.iter().map(IdMatch::to_record).collect();
        Ok(ActionOutput::new()
            .with_statistic(
                format!("{}_resolution", output_key),
                json!({
                    "identifiers": total,
                    "resolved": resolved_ids,
                    "errored": errors.len(),
                    "sub_batches": report.total_batches(),
                    "failed_sub_batches": report.failed.len(),
                    "retries": report.retries,
                }),
            )
            .with_details(json!({
                "input": input,
                "resolver": resolver_name,
                "matches": rows.len(),
                "errors": errors.len(),
            }))
            .with_message(format!("resolved {} of {} identifiers", resolved_ids, total))
            .with_dataset(output_key, rows)
            .with_dataset(errors_key, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{env, rows};
    use crate::error::OrchestratorError;
    use crate::resolver::{IdentifierResolver, MappingTableResolver};
    use std::collections::BTreeMap;

    /// Fails every call that includes the poisoned identifier
    struct Flaky {
        poisoned: &'static str,
        inner: MappingTableResolver,
    }

    #[async_trait]
    impl IdentifierResolver for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn resolve(&self, ids: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
            if ids.iter().any(|id| id == self.poisoned) {
                return Err(OrchestratorError::Resolver {
                    resolver: "flaky".into(),
                    message: "503 Service Unavailable".into(),
                });
            }
            self.inner.resolve(ids).await
        }
    }

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.insert_dataset(
            "ids",
            rows(json!([{"id": "A"}, {"id": "B"}, {"id": "A"}, {"id": "C"}, {"id": "D"}])),
        );
        ctx
    }

    #[tokio::test]
    async fn test_resolves_in_sub_batches() {
        let registry = ResolverRegistry::new();
        registry.register(Arc::new(MappingTableResolver::from_pairs(
            "table",
            [("A", "X1"), ("A", "X2"), ("C", "X3")],
        )));
        let params = StepParams::from_value(
            "resolve",
            &json!({"input": "ids", "resolver": "table", "output_key": "resolved", "chunk_size": 2}),
        );

        let out = ResolveIdentifiersAction
            .execute(&params, &context(), &env(registry))
            .await
            .unwrap();

        let matches: Vec<IdMatch> = out.datasets["resolved"].iter().filter_map(IdMatch::from_record).collect();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.resolved_externally));
        assert!(out.datasets["resolved_errors"].is_empty());
        assert_eq!(out.statistics["resolved_resolution"]["resolved"], 2);
        assert_eq!(out.statistics["resolved_resolution"]["sub_batches"], 2);
    }

    #[tokio::test]
    async fn test_failed_sub_batch_marks_only_its_identifiers() {
        let registry = ResolverRegistry::new();
        registry.register(Arc::new(Flaky {
            poisoned: "C",
            inner: MappingTableResolver::from_pairs("inner", [("A", "X1"), ("B", "X2"), ("D", "X4")]),
        }));
        let params = StepParams::from_value(
            "resolve",
            &json!({"input": "ids", "resolver": "flaky", "output_key": "r", "chunk_size": 2}),
        );

        let out = ResolveIdentifiersAction
            .execute(&params, &context(), &env(registry))
            .await
            .unwrap();

        // Batches: [A, B] ok, [C, D] exhausted
        assert_eq!(out.datasets["r"].len(), 2);
        let errored: Vec<&str> = out.datasets["r_errors"]
            .iter()
            .filter_map(|row| row["id"].as_str())
            .collect();
        assert_eq!(errored, vec!["C", "D"]);
        assert_eq!(out.statistics["r_resolution"]["failed_sub_batches"], 1);
        assert_eq!(out.statistics["r_resolution"]["retries"], 1);
    }

    #[test]
    fn test_unknown_resolver_is_a_validation_problem() {
        let params = StepParams::from_value(
            "resolve",
            &json!({"input": "ids", "resolver": "nowhere", "output_key": "r"}),
        );
        let problems = ResolveIdentifiersAction.validate_params(&params, &ResolverRegistry::new());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("nowhere"));
    }
}
