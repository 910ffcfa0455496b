//! Stage 0 — normalize the raw submission into the pipeline's working shape.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::{HandlerContext, TaskHandler};
use crate::error::TaskError;
use crate::registry::TaskKind;

/// Validates the submission and renders the company/page description strings
/// every later stage works from.
pub struct NormalizeInput;

/// The submission payload, as the web layer sends it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Submission {
    page_type: String,
    company_name: String,
    company_url: String,
    company_description: String,
    /// A JSON array, or a string holding one, or a bare keyword.
    seed_keywords: Value,
    /// Same coercions as `seed_keywords`.
    locations: Value,
    page_url: String,
    page_title: String,
    #[serde(default)]
    page_info: String,
    #[serde(default)]
    page_usp: String,
    #[serde(default)]
    is_new_page: bool,
}

/// Accept a JSON array of strings, a string containing one, or a single bare
/// string.
fn parse_json_or_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Value::String(s) => match serde_json::from_str::<Vec<String>>(s) {
            Ok(parsed) => parsed,
            Err(_) => vec![s.clone()],
        },
        other => vec![other.to_string()],
    }
}

#[async_trait]
impl TaskHandler for NormalizeInput {
    fn kind(&self) -> TaskKind {
        TaskKind::NormalizeInput
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError> {
        let payload = ctx.job_payload().await?;
        let submission: Submission =
            serde_json::from_value(payload).map_err(|e| TaskError::InvalidPayload {
                reason: format!("submission does not match expected shape: {e}"),
            })?;

        let locations = parse_json_or_list(&submission.locations);
        let seed_keywords = parse_json_or_list(&submission.seed_keywords);
        if locations.is_empty() || seed_keywords.is_empty() {
            return Err(TaskError::InvalidPayload {
                reason: "submission needs at least one location and one seed keyword".to_string(),
            });
        }

        let company_string = format!(
            "Basic company profile: \n Name: {}\n Description: {}\n Website: {}",
            submission.company_name, submission.company_description, submission.company_url
        );
        let page_string = format!(
            "Page to generate:\n URL: {}\n Title: {}\n Info: {}\n USP: {}\n Is New Page: {}",
            submission.page_url,
            submission.page_title,
            submission.page_info,
            submission.page_usp,
            submission.is_new_page
        );

        Ok(json!({
            "company_string": company_string,
            "page_string": page_string,
            "locations": locations,
            "seed_keywords": seed_keywords,
            "page_type": submission.page_type,
        }))
    }
}
