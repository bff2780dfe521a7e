use async_trait::async_trait;
use serde_json::json;

use super::one_row;
use crate::action::{ActionEnv, ActionHandler, ActionOutput, StepParams};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::resolver::ResolverRegistry;

/// Seed a dataset from inline rows, or from a plain identifier list
///
/// `rows: [{...}]` is stored as given; `ids: [..]` becomes one row per
/// identifier under `column` (default `id`).
pub struct CreateDatasetAction;

#[async_trait]
impl ActionHandler for CreateDatasetAction {
    fn action_type(&self) -> &'static str {
        "CREATE_DATASET"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["output_key"]
    }

    fn validate_params(&self, params: &StepParams, _resolvers: &ResolverRegistry) -> Vec<String> {
        let mut problems: Vec<String> = self
            .required_params()
            .iter()
            .filter(|key| !params.has(key))
            .map(|key| {
                format!(
                    "step '{}' (CREATE_DATASET): missing required parameter '{}'",
                    params.step(),
                    key
                )
            })
            .collect();
        if !params.has("rows") && !params.has("ids") {
            problems.push(format!(
                "step '{}' (CREATE_DATASET): one of 'rows' or 'ids' is required",
                params.step()
            ));
        }
        problems
    }

    async fn execute(
        &self,
        params: &StepParams,
        _context: &ExecutionContext,
        _env: &ActionEnv,
    ) -> Result<ActionOutput> {
        let output_key = params.str("output_key")?;
        let rows = if params.has("rows") {
            params.rows("rows")?
        } else {
            let column = params.str_or("column", "id");
            params
                .str_list("ids")
                .into_iter()
                .map(|id| one_row(column, id))
                .collect()
        };

        let count = rows.len();
        Ok(ActionOutput::new()
            .with_statistic(format!("{}_rows", output_key), json!(count))
            .with_details(json!({ "output_key": output_key, "rows": count }))
            .with_message(format!("created '{}' with {} rows", output_key, count))
            .with_dataset(output_key, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::env;

    #[tokio::test]
    async fn test_rows_and_ids() {
        let env = env(ResolverRegistry::new());
        let ctx = ExecutionContext::new();

        let params = StepParams::from_value(
            "load",
            &json!({"output_key": "src", "rows": [{"id": "P1", "name": "a"}]}),
        );
        let out = CreateDatasetAction.execute(&params, &ctx, &env).await.unwrap();
        assert_eq!(out.datasets["src"][0]["name"], "a");
        assert_eq!(out.statistics["src_rows"], 1);

        let params = StepParams::from_value(
            "load",
            &json!({"output_key": "ids", "ids": ["P1", "P2"], "column": "uniprot"}),
        );
        let out = CreateDatasetAction.execute(&params, &ctx, &env).await.unwrap();
        assert_eq!(out.datasets["ids"].len(), 2);
        assert_eq!(out.datasets["ids"][1]["uniprot"], "P2");
    }

    #[test]
    fn test_requires_rows_or_ids() {
        let params = StepParams::from_value("load", &json!({"output_key": "x"}));
        let problems = CreateDatasetAction.validate_params(&params, &ResolverRegistry::new());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("'rows' or 'ids'"));
    }
}
