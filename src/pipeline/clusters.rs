//! Stages 3–4 — cluster the candidate keywords, then pick the cluster most
//! relevant to the page being generated.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::engine::{HandlerContext, TaskHandler};
use crate::error::TaskError;
use crate::pipeline::{string_field, string_list};
use crate::providers::EmbeddingService;
use crate::providers::embedding::cosine;
use crate::registry::TaskKind;

/// Groups the full candidate list into one cluster per seed keyword.
pub struct ClusterKeywords {
    embeddings: Arc<dyn EmbeddingService>,
}

impl ClusterKeywords {
    pub fn new(embeddings: Arc<dyn EmbeddingService>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl TaskHandler for ClusterKeywords {
    fn kind(&self) -> TaskKind {
        TaskKind::ClusterKeywords
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError> {
        let expanded = ctx.upstream(TaskKind::ExpandKeywords).await?;
        let full_kw_list = string_list(&expanded, "full_kw_list")?;
        let normalized = ctx.upstream(TaskKind::NormalizeInput).await?;
        let seed_keywords = string_list(&normalized, "seed_keywords")?;

        let grouped = self
            .embeddings
            .cluster_hierarchical(&full_kw_list, seed_keywords.len())
            .await?;

        let clusters: Vec<Value> = grouped
            .into_iter()
            .enumerate()
            .map(|(i, keywords)| json!({"cluster_id": i, "keywords": keywords}))
            .collect();

        debug!(job_id = %ctx.job_id, clusters = clusters.len(), "Clustering finished");
        Ok(Value::Array(clusters))
    }
}

/// Scores each cluster against the page description and keeps the winner.
pub struct SelectCluster {
    embeddings: Arc<dyn EmbeddingService>,
}

impl SelectCluster {
    pub fn new(embeddings: Arc<dyn EmbeddingService>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl TaskHandler for SelectCluster {
    fn kind(&self) -> TaskKind {
        TaskKind::SelectCluster
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError> {
        let clusters = ctx.upstream(TaskKind::ClusterKeywords).await?;
        let clusters = clusters
            .as_array()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TaskError::InvalidPayload {
                reason: "cluster stage produced no clusters".to_string(),
            })?;

        let normalized = ctx.upstream(TaskKind::NormalizeInput).await?;
        let page_string = string_field(&normalized, "page_string")?;
        let page_emb = self.embeddings.embed(&page_string).await?;

        let mut best: Option<(&Value, f32)> = None;
        for cluster in clusters {
            let keywords = string_list(cluster, "keywords")?;
            let cluster_emb = self.embeddings.embed(&keywords.join(" ")).await?;
            let score = cosine(&page_emb, &cluster_emb);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((cluster, score));
            }
        }

        let (winner, score) = best.ok_or_else(|| TaskError::InvalidPayload {
            reason: "no cluster could be scored".to_string(),
        })?;
        debug!(job_id = %ctx.job_id, score, "Best cluster selected");

        Ok(json!({"best_cluster": winner}))
    }
}
