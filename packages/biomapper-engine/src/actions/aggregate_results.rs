use async_trait::async_trait;
use serde_json::json;

use crate::action::{require_dataset, ActionEnv, ActionHandler, ActionOutput, StepParams};
use crate::aggregator::ResultAggregator;
use crate::context::ExecutionContext;
use crate::error::Result;

/// One result row per input identifier
///
/// Params: `input`, `output_key`, `column` (default `id`), `matches` and
/// `errors` (dataset names, a string or a list).
pub struct AggregateResultsAction;

#[async_trait]
impl ActionHandler for AggregateResultsAction {
    fn action_type(&self) -> &'static str {
        "AGGREGATE_RESULTS"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["input", "matches", "output_key"]
    }

    async fn execute(
        &self,
        params: &StepParams,
        context: &ExecutionContext,
        _env: &ActionEnv,
    ) -> Result<ActionOutput> {
        let input = params.str("input")?;
        let output_key = params.str("output_key")?;
        let column = params.str_or("column", "id");
        let matches = params.str_list("matches");
        let errors = params.str_list("errors");

        require_dataset(context, params.step(), input)?;
        let aggregator = ResultAggregator::from_context(context, input, column, &matches, &errors)
            .unwrap_or_default();
        let ignored = aggregator.ignored_count();
        let result = aggregator.finish(None);

        let summary = json!({
            "total": result.total(),
            "matched": result.matched,
            "unmapped": result.unmapped,
            "errored": result.errored,
            "ignored": ignored,
        });
        Ok(ActionOutput::new()
            .with_statistic(format!("{}_summary", output_key), summary.clone())
            .with_details(json!({ "input": input, "matches": matches, "errors": errors, "summary": summary }))
            .with_message(format!(
                "{} inputs: {} matched, {} unmapped, {} errored",
                result.total(),
                result.matched,
                result.unmapped,
                result.errored
            ))
            .with_dataset(output_key, result.to_records()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{env, rows};
    use crate::resolver::ResolverRegistry;

    #[tokio::test]
    async fn test_every_input_accounted_for() {
        let mut ctx = ExecutionContext::new();
        ctx.insert_dataset("ids", rows(json!([{"id": "A"}, {"id": "B"}, {"id": "C"}])));
        ctx.insert_dataset(
            "hits",
            rows(json!([{"source_id": "A", "target_id": "X", "confidence": 0.9}])),
        );
        ctx.insert_dataset(
            "errs",
            rows(json!([{"id": "C", "error_type": "resolver", "error_message": "503"}])),
        );

        let params = StepParams::from_value(
            "aggregate",
            &json!({"input": "ids", "matches": ["hits", "missing"], "errors": "errs", "output_key": "final"}),
        );
        let out = AggregateResultsAction
            .execute(&params, &ctx, &env(ResolverRegistry::new()))
            .await
            .unwrap();

        let rows = &out.datasets["final"];
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["status"], "matched");
        assert_eq!(rows[1]["status"], "no_mapping_found");
        assert_eq!(rows[2]["status"], "error");
        assert_eq!(out.statistics["final_summary"]["total"], 3);
    }
}
