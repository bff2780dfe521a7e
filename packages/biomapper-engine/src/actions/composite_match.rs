use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::distinct_keys;
use crate::action::{require_dataset, ActionEnv, ActionHandler, ActionOutput, StepParams};
use crate::context::{ExecutionContext, Record};
use crate::error::Result;
use crate::matching::{CompositeKeyResolver, IdMatch};

/// Match identifiers that may be composites like `Q2_Q3`
///
/// Params: `source`, `target`, `output_key`, `source_column` (default `id`),
/// `target_column` (default: the source column), `separator` (default `_`).
pub struct CompositeMatchAction;

#[async_trait]
impl ActionHandler for CompositeMatchAction {
    fn action_type(&self) -> &'static str {
        "COMPOSITE_MATCH"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["source", "target", "output_key"]
    }

    async fn execute(
        &self,
        params: &StepParams,
        context: &ExecutionContext,
        env: &ActionEnv,
    ) -> Result<ActionOutput> {
        let source_name = params.str("source")?;
        let target_name = params.str("target")?;
        let output_key = params.str("output_key")?;
        let source_column = params.str_or("source_column", "id");
        let target_column = params.str_or("target_column", source_column);
        let resolver = CompositeKeyResolver::new(params.str_or("separator", "_"));

        let sources = distinct_keys(require_dataset(context, params.step(), source_name)?, source_column);
        let targets = distinct_keys(require_dataset(context, params.step(), target_name)?, target_column);

        let report = resolver.resolve(&sources, &targets);
        if !report.unmatched_parts.is_empty() {
            debug!(
                "Step '{}': composite parts without a match: {:?}",
                env.step_name, report.unmatched_parts
            );
        }
        info!(
            "Job {} step '{}': {} sources, {} matches, {} unmatched sources",
            env.job_id,
            env.step_name,
            sources.len(),
            report.matches.len(),
            report.unmatched_sources.len()
        );

        let rows: Vec<Record> = report.matches.iter().map(IdMatch::to_record).collect();
        Ok(ActionOutput::new()
            .with_statistic(format!("{}_matches", output_key), json!(rows.len()))
            .with_statistic(
                format!("{}_unmatched_sources", output_key),
                json!(report.unmatched_sources.len()),
            )
            .with_statistic(
                format!("{}_unmatched_parts", output_key),
                json!(report.unmatched_parts),
            )
            .with_details(json!({
                "source": source_name,
                "target": target_name,
                "separator": resolver.separator(),
                "matches": rows.len(),
            }))
            .with_message(format!(
                "{} matches, {} unmatched sources",
                rows.len(),
                report.unmatched_sources.len()
            ))
            .with_dataset(output_key, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{env, rows};
    use crate::matching::MatchType;
    use crate::resolver::ResolverRegistry;

    #[tokio::test]
    async fn test_composite_source_matches_parts() {
        let mut ctx = ExecutionContext::new();
        ctx.insert_dataset("src", rows(json!([{"id": "Q1"}, {"id": "Q2_Q3"}, {"id": "Q7_Q8"}])));
        ctx.insert_dataset("tgt", rows(json!([{"id": "Q1"}, {"id": "Q3"}, {"id": "Q7"}])));

        let params = StepParams::from_value(
            "composite",
            &json!({"source": "src", "target": "tgt", "output_key": "m"}),
        );
        let out = CompositeMatchAction
            .execute(&params, &ctx, &env(ResolverRegistry::new()))
            .await
            .unwrap();

        let matches: Vec<IdMatch> = out.datasets["m"].iter().filter_map(IdMatch::from_record).collect();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].match_type, MatchType::Direct);
        assert_eq!((matches[1].source.as_str(), matches[1].target.as_str()), ("Q2_Q3", "Q3"));
        assert_eq!(matches[1].match_type, MatchType::Composite);
        assert_eq!(out.statistics["m_unmatched_parts"], json!(["Q2", "Q8"]));
        assert_eq!(out.statistics["m_unmatched_sources"], 0);
    }
}
