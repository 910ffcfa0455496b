//! Embedding collaborator — vectors plus the similarity operations built on
//! them.
//!
//! Only `embed` talks to the outside world; centroid, bucketing, and
//! clustering are provided on the trait so every implementation (including
//! test fakes) gets identical geometry.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ProviderError;

/// Number of similarity buckets over the cosine range [-1, 1].
const BUCKETS: usize = 100;

/// What to measure candidates against.
pub enum SimilarityCenter<'a> {
    /// Embed this text and use the result as the center.
    Keyword(&'a str),
    /// Use a precomputed vector (e.g. a seed centroid).
    Vector(Vec<f32>),
}

/// Embedding collaborator contract.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed a batch. Implementations with a batching transport should
    /// override this.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Mean of the texts' embeddings.
    async fn centroid(&self, texts: &[String]) -> Result<Vec<f32>, ProviderError> {
        let embeddings = self.embed_many(texts).await?;
        let Some(first) = embeddings.first() else {
            return Err(ProviderError::InvalidResponse {
                provider: "embedding".to_string(),
                reason: "cannot take the centroid of zero texts".to_string(),
            });
        };

        let mut mean = vec![0.0f32; first.len()];
        for emb in &embeddings {
            for (m, v) in mean.iter_mut().zip(emb) {
                *m += v;
            }
        }
        let n = embeddings.len() as f32;
        for m in &mut mean {
            *m /= n;
        }
        Ok(mean)
    }

    /// Cosine similarity of two texts.
    async fn similarity(&self, a: &str, b: &str) -> Result<f32, ProviderError> {
        let ea = self.embed(a).await?;
        let eb = self.embed(b).await?;
        Ok(cosine(&ea, &eb))
    }

    /// Group candidates into cosine-similarity buckets against a center.
    ///
    /// Keys are the lower bound of each 0.02-wide bucket over [-1, 1],
    /// formatted to two decimals. Empty buckets are omitted.
    async fn bucket_by_similarity(
        &self,
        center: SimilarityCenter<'_>,
        candidates: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>, ProviderError> {
        let center_emb = match center {
            SimilarityCenter::Keyword(text) => self.embed(text).await?,
            SimilarityCenter::Vector(v) => v,
        };

        let bucket_size = 2.0 / BUCKETS as f32;
        let embeddings = self.embed_many(candidates).await?;

        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (candidate, emb) in candidates.iter().zip(&embeddings) {
            let sim = cosine(&center_emb, emb);
            let idx = (((sim + 1.0) / bucket_size) as usize).min(BUCKETS - 1);
            let lower = -1.0 + idx as f32 * bucket_size;
            buckets
                .entry(format!("{lower:.2}"))
                .or_default()
                .push(candidate.clone());
        }
        Ok(buckets)
    }

    /// Agglomerative clustering of the items into `k` groups.
    ///
    /// Average linkage over cosine distance. Items keep their input order
    /// within a group; groups are ordered by their earliest item.
    async fn cluster_hierarchical(
        &self,
        items: &[String],
        k: usize,
    ) -> Result<Vec<Vec<String>>, ProviderError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.embed_many(items).await?;
        let mut clusters = agglomerate(&embeddings, k);

        for cluster in &mut clusters {
            cluster.sort_unstable();
        }
        clusters.sort_by_key(|c| c[0]);

        Ok(clusters
            .into_iter()
            .map(|idxs| idxs.into_iter().map(|i| items[i].clone()).collect())
            .collect())
    }
}

/// Cosine similarity between two vectors. Zero-magnitude vectors compare as
/// dissimilar rather than dividing by zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Merge singleton clusters bottom-up until `k` remain, joining the pair
/// with the smallest average pairwise cosine distance each round.
fn agglomerate(embeddings: &[Vec<f32>], k: usize) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = (0..embeddings.len()).map(|i| vec![i]).collect();
    let target = k.max(1);

    while clusters.len() > target {
        let (mut best_i, mut best_j, mut best) = (0usize, 1usize, f32::MAX);
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let d = average_distance(&clusters[i], &clusters[j], embeddings);
                if d < best {
                    best = d;
                    best_i = i;
                    best_j = j;
                }
            }
        }
        // best_j > best_i, so removing j leaves i's index intact.
        let merged = clusters.swap_remove(best_j);
        clusters[best_i].extend(merged);
    }

    clusters
}

fn average_distance(a: &[usize], b: &[usize], embeddings: &[Vec<f32>]) -> f32 {
    let mut total = 0.0f32;
    for &i in a {
        for &j in b {
            total += 1.0 - cosine(&embeddings[i], &embeddings[j]);
        }
    }
    total / (a.len() * b.len()) as f32
}

/// HTTP embedding backend against an OpenAI-compatible `/embeddings`
/// endpoint, with a bounded in-memory vector cache.
pub struct HttpEmbeddings {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<SecretString>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
    cache_size: usize,
}

impl HttpEmbeddings {
    pub fn new(url: &str, model: &str, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            model: model.to_string(),
            api_key,
            cache: RwLock::new(HashMap::new()),
            cache_size: 10_000,
        }
    }

    async fn fetch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({"model": self.model, "input": texts}));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                provider: "embedding".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                provider: "embedding".to_string(),
                retry_after: None,
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Overloaded {
                provider: "embedding".to_string(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::RequestFailed {
                provider: "embedding".to_string(),
                reason: format!("unexpected status {status}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "embedding".to_string(),
                reason: e.to_string(),
            })?;

        let data = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: "embedding".to_string(),
                reason: "response missing 'data' array".to_string(),
            })?;

        let mut out = Vec::with_capacity(data.len());
        for entry in data {
            let vector = entry
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::InvalidResponse {
                    provider: "embedding".to_string(),
                    reason: "entry missing 'embedding' array".to_string(),
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            out.push(vector);
        }

        if out.len() != texts.len() {
            return Err(ProviderError::InvalidResponse {
                provider: "embedding".to_string(),
                reason: format!("asked for {} embeddings, got {}", texts.len(), out.len()),
            });
        }
        Ok(out)
    }

    async fn store_in_cache(&self, text: &str, vector: Vec<f32>) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.cache_size
            && let Some(evict) = cache.keys().next().cloned()
        {
            cache.remove(&evict);
        }
        cache.insert(text.to_string(), vector);
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if let Some(hit) = self.cache.read().await.get(text) {
            return Ok(hit.clone());
        }

        let mut vectors = self.fetch(std::slice::from_ref(&text.to_string())).await?;
        let vector = vectors.remove(0);
        self.store_in_cache(text, vector.clone()).await;
        Ok(vector)
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut resolved: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        {
            let cache = self.cache.read().await;
            for text in texts {
                resolved.push(cache.get(text).cloned());
            }
        }

        let missing: Vec<String> = texts
            .iter()
            .zip(&resolved)
            .filter(|(_, hit)| hit.is_none())
            .map(|(text, _)| text.clone())
            .collect();

        if !missing.is_empty() {
            debug!(total = texts.len(), missing = missing.len(), "Embedding batch");
            let fetched = self.fetch(&missing).await?;
            let mut fetched_iter = fetched.into_iter();
            for (slot, text) in resolved.iter_mut().zip(texts) {
                if slot.is_none() {
                    let vector = fetched_iter.next().ok_or_else(|| {
                        ProviderError::InvalidResponse {
                            provider: "embedding".to_string(),
                            reason: "batch response shorter than request".to_string(),
                        }
                    })?;
                    self.store_in_cache(text, vector.clone()).await;
                    *slot = Some(vector);
                }
            }
        }

        Ok(resolved.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic fake: maps each text to a fixed 2-d direction.
    struct FakeEmbedder;

    #[async_trait]
    impl EmbeddingService for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(match text {
                t if t.starts_with("bin") => vec![1.0, 0.0],
                t if t.starts_with("skip") => vec![0.9, 0.1],
                t if t.starts_with("garden") => vec![0.0, 1.0],
                t if t.starts_with("lawn") => vec![0.1, 0.9],
                _ => vec![0.5, 0.5],
            })
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn centroid_is_mean_of_embeddings() {
        let centroid = FakeEmbedder
            .centroid(&strings(&["bin rental", "garden waste"]))
            .await
            .unwrap();
        assert!((centroid[0] - 0.5).abs() < 1e-6);
        assert!((centroid[1] - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn bucketing_groups_by_similarity_band() {
        let candidates = strings(&["bin hire", "skip hire", "garden care"]);
        let buckets = FakeEmbedder
            .bucket_by_similarity(SimilarityCenter::Keyword("bin rental"), &candidates)
            .await
            .unwrap();

        // "bin hire" is identical to the center; "garden care" is orthogonal.
        let top: Vec<_> = buckets
            .iter()
            .filter(|(k, _)| k.parse::<f32>().unwrap() >= 0.69)
            .flat_map(|(_, v)| v.clone())
            .collect();
        assert!(top.contains(&"bin hire".to_string()));
        assert!(top.contains(&"skip hire".to_string()));
        assert!(!top.contains(&"garden care".to_string()));
    }

    #[tokio::test]
    async fn clustering_separates_the_two_topics() {
        let items = strings(&["bin hire", "skip bins", "garden waste", "lawn care"]);
        let clusters = FakeEmbedder.cluster_hierarchical(&items, 2).await.unwrap();
        assert_eq!(clusters.len(), 2);

        let bins = clusters
            .iter()
            .find(|c| c.contains(&"bin hire".to_string()))
            .unwrap();
        assert!(bins.contains(&"skip bins".to_string()));
        assert!(!bins.contains(&"garden waste".to_string()));
    }

    #[tokio::test]
    async fn clustering_with_fewer_items_than_k() {
        let items = strings(&["bin hire"]);
        let clusters = FakeEmbedder.cluster_hierarchical(&items, 3).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(FakeEmbedder
            .cluster_hierarchical(&[], 3)
            .await
            .unwrap()
            .is_empty());
    }
}
