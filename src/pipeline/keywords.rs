//! Stages 1–2 — expand seed keywords into candidates, then select the best
//! of them by embedding similarity.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::engine::{HandlerContext, TaskHandler};
use crate::error::TaskError;
use crate::pipeline::string_list;
use crate::providers::{EmbeddingService, KeywordProvider, SimilarityCenter};
use crate::registry::TaskKind;

/// Candidates in a similarity bucket at or above this lower bound survive
/// selection.
const SELECT_THRESHOLD: f32 = 0.69;

/// Expands every seed keyword through the keyword provider, per location.
pub struct ExpandKeywords {
    provider: Arc<dyn KeywordProvider>,
}

impl ExpandKeywords {
    pub fn new(provider: Arc<dyn KeywordProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TaskHandler for ExpandKeywords {
    fn kind(&self) -> TaskKind {
        TaskKind::ExpandKeywords
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError> {
        let normalized = ctx.upstream(TaskKind::NormalizeInput).await?;
        let locations = string_list(&normalized, "locations")?;
        let seed_keywords = string_list(&normalized, "seed_keywords")?;
        if locations.is_empty() || seed_keywords.is_empty() {
            return Err(TaskError::InvalidPayload {
                reason: "normalized input has no locations or seed keywords".to_string(),
            });
        }

        let mut similar_kw_dict = Map::new();
        let mut full_set: BTreeSet<String> = BTreeSet::new();

        for location in &locations {
            // One location's seeds are fetched together; the provider's own
            // pacing still applies underneath.
            let fetches = seed_keywords
                .iter()
                .map(|seed| self.provider.similar_keywords(seed, location));
            let results = try_join_all(fetches).await?;

            let mut per_location = Map::new();
            for (seed, candidates) in seed_keywords.iter().zip(results) {
                full_set.extend(candidates.keys().cloned());
                let encoded =
                    serde_json::to_value(&candidates).map_err(|e| TaskError::InvalidPayload {
                        reason: format!("cannot encode keyword metrics: {e}"),
                    })?;
                per_location.insert(seed.clone(), encoded);
            }
            similar_kw_dict.insert(location.clone(), Value::Object(per_location));
        }

        debug!(
            job_id = %ctx.job_id,
            candidates = full_set.len(),
            "Keyword expansion finished"
        );

        Ok(json!({
            "similar_kw_dict": similar_kw_dict,
            "full_kw_list": full_set.into_iter().collect::<Vec<_>>(),
        }))
    }
}

/// Buckets candidates against each seed (and the seed centroid) and keeps
/// the high-similarity bands.
pub struct SelectKeywords {
    embeddings: Arc<dyn EmbeddingService>,
}

impl SelectKeywords {
    pub fn new(embeddings: Arc<dyn EmbeddingService>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl TaskHandler for SelectKeywords {
    fn kind(&self) -> TaskKind {
        TaskKind::SelectKeywords
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError> {
        let expanded = ctx.upstream(TaskKind::ExpandKeywords).await?;
        let full_kw_list = string_list(&expanded, "full_kw_list")?;
        let normalized = ctx.upstream(TaskKind::NormalizeInput).await?;
        let seed_keywords = string_list(&normalized, "seed_keywords")?;

        let mut bucketed = Vec::with_capacity(seed_keywords.len() + 1);
        for seed in &seed_keywords {
            let buckets = self
                .embeddings
                .bucket_by_similarity(SimilarityCenter::Keyword(seed), &full_kw_list)
                .await?;
            bucketed.push((seed.clone(), buckets));
        }

        let centroid = self.embeddings.centroid(&seed_keywords).await?;
        let centroid_buckets = self
            .embeddings
            .bucket_by_similarity(SimilarityCenter::Vector(centroid), &full_kw_list)
            .await?;
        bucketed.push(("seed centroid".to_string(), centroid_buckets));

        let mut best_keywords = Map::new();
        for (center, buckets) in bucketed {
            let mut kept = Vec::new();
            for (bucket, keywords) in buckets {
                if bucket.parse::<f32>().unwrap_or(-1.0) >= SELECT_THRESHOLD {
                    kept.extend(keywords);
                }
            }
            best_keywords.insert(center, json!(kept));
        }

        Ok(Value::Object(best_keywords))
    }
}
