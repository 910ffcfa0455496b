//! Stage 5 — render the final page through the completion provider.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::engine::{HandlerContext, TaskHandler};
use crate::error::TaskError;
use crate::pipeline::{string_field, string_list};
use crate::providers::CompletionProvider;
use crate::registry::TaskKind;

/// Models like to wrap HTML in a Markdown fence; unwrap it when they do.
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```(?:html)?\s*\n?(.*?)\n?\s*```\s*$").unwrap()
});

fn strip_code_fences(text: &str) -> String {
    match CODE_FENCE.captures(text) {
        Some(caps) => caps[1].to_string(),
        None => text.trim().to_string(),
    }
}

/// Produces the final HTML from the winning cluster and the normalized
/// company/page descriptions.
pub struct RenderPage {
    completion: Arc<dyn CompletionProvider>,
    max_tokens: u32,
}

impl RenderPage {
    pub fn new(completion: Arc<dyn CompletionProvider>, max_tokens: u32) -> Self {
        Self {
            completion,
            max_tokens,
        }
    }
}

#[async_trait]
impl TaskHandler for RenderPage {
    fn kind(&self) -> TaskKind {
        TaskKind::RenderPage
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError> {
        let selected = ctx.upstream(TaskKind::SelectCluster).await?;
        let best_cluster = selected
            .get("best_cluster")
            .ok_or_else(|| TaskError::InvalidPayload {
                reason: "selection stage produced no best_cluster".to_string(),
            })?;
        let keywords = string_list(best_cluster, "keywords")?;

        let normalized = ctx.upstream(TaskKind::NormalizeInput).await?;
        let company_string = string_field(&normalized, "company_string")?;
        let page_string = string_field(&normalized, "page_string")?;
        let page_type = string_field(&normalized, "page_type")?;

        let prompt = json!({
            "task": "generate_page_html",
            "page_type": page_type,
            "company": company_string,
            "page": page_string,
            "target_keywords": keywords,
            "instruction": "Write the complete HTML for this page. Use the company \
                and page details verbatim where appropriate and work each target \
                keyword into natural copy. Return only the HTML document.",
        })
        .to_string();

        let raw = self
            .completion
            .generate_text(&prompt, self.max_tokens)
            .await?;
        let generated_html = strip_code_fences(&raw);

        Ok(json!({"generated_html": generated_html}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_html_is_unwrapped() {
        let fenced = "```html\n<html><body>hi</body></html>\n```";
        assert_eq!(strip_code_fences(fenced), "<html><body>hi</body></html>");

        let bare_fence = "```\n<p>x</p>\n```";
        assert_eq!(strip_code_fences(bare_fence), "<p>x</p>");
    }

    #[test]
    fn plain_output_is_only_trimmed() {
        assert_eq!(strip_code_fences("  <html></html>\n"), "<html></html>");
        assert_eq!(
            strip_code_fences("uses ``` inline but not fenced"),
            "uses ``` inline but not fenced"
        );
    }
}
