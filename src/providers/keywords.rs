//! Keyword-similarity provider — candidate keywords with search metrics.
//!
//! The concrete implementation talks to the Twinword keyword-suggestion API
//! via RapidAPI, paced to its requests-per-minute allowance. A caching
//! decorator stores raw responses in the database so re-runs and sibling
//! jobs don't re-spend API quota on the same (keyword, location) pair.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::store::Database;

const TWINWORD_URL: &str = "https://twinword-keyword-suggestion-v1.p.rapidapi.com/suggest/";
const TWINWORD_HOST: &str = "twinword-keyword-suggestion-v1.p.rapidapi.com";
/// Twinword's free-tier allowance.
const TWINWORD_CALLS_PER_MINUTE: u32 = 12;

/// Search metrics reported for one candidate keyword.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordMetrics {
    pub search_volume: Option<u64>,
    pub cpc: Option<f64>,
    pub competition: Option<f64>,
}

/// Collaborator that expands a term into similar keywords with metrics.
#[async_trait]
pub trait KeywordProvider: Send + Sync {
    /// Candidate keywords similar to `term` for a two-letter country code.
    async fn similar_keywords(
        &self,
        term: &str,
        location: &str,
    ) -> Result<BTreeMap<String, KeywordMetrics>, ProviderError>;
}

/// Dead simple pacing: spaces calls out to `calls_per_minute`.
///
/// Cannot arbitrate between separate processes sharing one API key.
struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(calls_per_minute: u32) -> Self {
        Self {
            min_interval: Duration::from_secs(60) / calls_per_minute,
            last_call: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Twinword keyword-suggestion API over RapidAPI.
pub struct TwinwordKeywords {
    client: reqwest::Client,
    api_key: SecretString,
    limiter: RateLimiter,
}

impl TwinwordKeywords {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            limiter: RateLimiter::new(TWINWORD_CALLS_PER_MINUTE),
        }
    }

    fn parse_response(body: &Value) -> Result<BTreeMap<String, KeywordMetrics>, ProviderError> {
        let keywords = body
            .get("keywords")
            .and_then(Value::as_object)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: "twinword".to_string(),
                reason: "response missing 'keywords' object".to_string(),
            })?;

        let mut out = BTreeMap::new();
        for (candidate, data) in keywords {
            out.insert(
                candidate.clone(),
                KeywordMetrics {
                    search_volume: metric_u64(data.get("search volume")),
                    cpc: metric_f64(data.get("cpc")),
                    competition: metric_f64(data.get("paid competition")),
                },
            );
        }
        Ok(out)
    }
}

/// Twinword reports metrics as numbers or numeric strings; empty strings
/// mean "no data".
fn metric_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

fn metric_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl KeywordProvider for TwinwordKeywords {
    async fn similar_keywords(
        &self,
        term: &str,
        location: &str,
    ) -> Result<BTreeMap<String, KeywordMetrics>, ProviderError> {
        self.limiter.wait().await;

        let response = self
            .client
            .get(TWINWORD_URL)
            .query(&[("phrase", term), ("lang", "en"), ("loc", location)])
            .header("x-rapidapi-key", self.api_key.expose_secret())
            .header("x-rapidapi-host", TWINWORD_HOST)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                provider: "twinword".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                provider: "twinword".to_string(),
                retry_after: None,
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Overloaded {
                provider: "twinword".to_string(),
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::AuthFailed {
                provider: "twinword".to_string(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::RequestFailed {
                provider: "twinword".to_string(),
                reason: format!("unexpected status {status}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: "twinword".to_string(),
                reason: e.to_string(),
            })?;

        Self::parse_response(&body)
    }
}

/// Cache-first decorator: checks the `similar_keyword_searches` table before
/// calling through, and stores fresh responses after.
pub struct CachedKeywords {
    inner: Arc<dyn KeywordProvider>,
    db: Arc<dyn Database>,
}

impl CachedKeywords {
    pub fn new(inner: Arc<dyn KeywordProvider>, db: Arc<dyn Database>) -> Self {
        Self { inner, db }
    }
}

#[async_trait]
impl KeywordProvider for CachedKeywords {
    async fn similar_keywords(
        &self,
        term: &str,
        location: &str,
    ) -> Result<BTreeMap<String, KeywordMetrics>, ProviderError> {
        match self.db.cached_keyword_search(term, location).await {
            Ok(Some(cached)) => {
                if let Ok(parsed) = serde_json::from_value(cached) {
                    debug!(term, location, "Keyword cache hit");
                    return Ok(parsed);
                }
                warn!(term, location, "Discarding unparseable keyword cache entry");
            }
            Ok(None) => {}
            Err(e) => warn!(term, location, error = %e, "Keyword cache read failed"),
        }

        let fresh = self.inner.similar_keywords(term, location).await?;

        match serde_json::to_value(&fresh) {
            Ok(raw) => {
                if let Err(e) = self.db.cache_keyword_search(term, location, &raw).await {
                    warn!(term, location, error = %e, "Failed to cache keyword search");
                }
            }
            Err(e) => warn!(term, location, error = %e, "Failed to serialize keyword result"),
        }

        Ok(fresh)
    }
}
