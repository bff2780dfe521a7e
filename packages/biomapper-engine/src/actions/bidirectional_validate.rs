use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::action::{require_dataset, ActionEnv, ActionHandler, ActionOutput, StepParams};
use crate::context::{ExecutionContext, Record};
use crate::error::Result;
use crate::matching::{BidirectionalValidator, IdMatch, ValidationStatus};
use crate::resolver::ResolverRegistry;

pub const VALIDATION: &str = "validation";
pub const VALIDATION_LABEL: &str = "validation_label";

/// Reconcile forward matches with a reverse lookup of their targets
///
/// Adds `validation` / `validation_label` columns to every match row. Without
/// `reverse_resolver` (or when the resolver fails) the columns are null and
/// the step still succeeds.
///
/// Params: `matches`, `reverse_resolver`, `output_key` (default: overwrite
/// `matches`).
pub struct BidirectionalValidateAction;

#[async_trait]
impl ActionHandler for BidirectionalValidateAction {
    fn action_type(&self) -> &'static str {
        "BIDIRECTIONAL_VALIDATE"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["matches"]
    }

    fn validate_params(&self, params: &StepParams, resolvers: &ResolverRegistry) -> Vec<String> {
        let mut problems: Vec<String> = self
            .required_params()
            .iter()
            .filter(|key| !params.has(key))
            .map(|key| {
                format!(
                    "step '{}' (BIDIRECTIONAL_VALIDATE): missing required parameter '{}'",
                    params.step(),
                    key
                )
            })
            .collect();
        if let Some(name) = params.opt_str("reverse_resolver") {
            if !resolvers.contains(name) {
                problems.push(format!(
                    "step '{}' (BIDIRECTIONAL_VALIDATE): unknown resolver '{}'",
                    params.step(),
                    name
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
        let matches_name = params.str("matches")?;
        let output_key = params.str_or("output_key", matches_name);
        let rows = require_dataset(context, params.step(), matches_name)?;

        // Rows that are not match rows pass through unvalidated
        let mut forward = Vec::with_capacity(rows.len());
        let mut positions = Vec::with_capacity(rows.len());
        for (pos, row) in rows.iter().enumerate() {
            if let Some(m) = IdMatch::from_record(row) {
                forward.push(m);
                positions.push(pos);
            }
        }

        let reverse = match params.opt_str("reverse_resolver") {
            Some(name) => Some(env.resolver(name)?),
            None => {
                warn!(
                    "Step '{}': no reverse resolver configured, matches left unvalidated",
                    env.step_name
                );
                None
            }
        };

        let validator = BidirectionalValidator::new(env.normalizer.clone());
        let report = validator.validate(forward, reverse.as_deref()).await;

        let mut output: Vec<Record> = rows.to_vec();
        for row in output.iter_mut() {
            row.insert(VALIDATION.into(), Value::Null);
            row.insert(VALIDATION_LABEL.into(), Value::Null);
        }
        for (validated, &pos) in report.matches.iter().zip(&positions) {
            if let Some(status) = validated.status {
                output[pos].insert(VALIDATION.into(), Value::String(status.as_str().into()));
                output[pos].insert(VALIDATION_LABEL.into(), Value::String(status.label().into()));
            }
        }

        let counts = json!({
            "validated": report.count(ValidationStatus::Validated),
            "validated_ambiguous": report.count(ValidationStatus::ValidatedAmbiguous),
            "successful_no_reverse_path": report.count(ValidationStatus::SuccessfulNoReversePath),
            "successful": report.count(ValidationStatus::Successful),
            "reverse_path_found": report.reverse_path_found,
        });
        info!(
            "Job {} step '{}': validated {} of {} matches",
            env.job_id,
            env.step_name,
            report.count(ValidationStatus::Validated)
                + report.count(ValidationStatus::ValidatedAmbiguous),
            report.matches.len()
        );

        Ok(ActionOutput::new()
            .with_statistic(format!("{}_validation", output_key), counts.clone())
            .with_details(json!({ "matches": matches_name, "counts": counts }))
            .with_message(format!("validated {} matches", report.matches.len()))
            .with_dataset(output_key, output))
    }
}
