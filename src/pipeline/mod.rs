//! The six product handlers of the content-generation pipeline.

pub mod clusters;
pub mod keywords;
pub mod normalize;
pub mod render;

use std::sync::Arc;

use serde_json::Value;

pub use clusters::{ClusterKeywords, SelectCluster};
pub use keywords::{ExpandKeywords, SelectKeywords};
pub use normalize::NormalizeInput;
pub use render::RenderPage;

use crate::engine::HandlerSet;
use crate::error::TaskError;
use crate::providers::{CompletionProvider, EmbeddingService, KeywordProvider};

/// Wire up one handler per standard pipeline stage.
pub fn standard_handlers(
    completion: Arc<dyn CompletionProvider>,
    keywords: Arc<dyn KeywordProvider>,
    embeddings: Arc<dyn EmbeddingService>,
    max_tokens: u32,
) -> HandlerSet {
    HandlerSet::new()
        .with(Arc::new(NormalizeInput))
        .with(Arc::new(ExpandKeywords::new(keywords)))
        .with(Arc::new(SelectKeywords::new(embeddings.clone())))
        .with(Arc::new(ClusterKeywords::new(embeddings.clone())))
        .with(Arc::new(SelectCluster::new(embeddings)))
        .with(Arc::new(RenderPage::new(completion, max_tokens)))
}

/// Pull a required list of strings out of an upstream result.
pub(crate) fn string_list(value: &Value, key: &str) -> Result<Vec<String>, TaskError> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| TaskError::InvalidPayload {
            reason: format!("expected string list at {key:?}"),
        })
}

/// Pull a required string field out of an upstream result.
pub(crate) fn string_field(value: &Value, key: &str) -> Result<String, TaskError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TaskError::InvalidPayload {
            reason: format!("expected string at {key:?}"),
        })
}
