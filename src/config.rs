//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Scheduler loop tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between polls when no pending task exists.
    pub poll_interval: Duration,
    /// Sleep after an unexpected loop-level error before resuming.
    pub error_backoff: Duration,
    /// Total handler attempts per task (first try included).
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub retry_max_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(4),
            retry_max_delay: Duration::from_secs(10),
        }
    }
}

/// Supported completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// External collaborator wiring.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Completion backend to use.
    pub backend: LlmBackend,
    /// API key for the completion backend.
    pub llm_api_key: SecretString,
    /// Completion model name.
    pub model: String,
    /// Token budget for rendered output.
    pub max_tokens: u32,
    /// RapidAPI key for the Twinword keyword-suggestion API.
    pub rapidapi_key: SecretString,
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub embedding_url: String,
    /// Embedding model name.
    pub embedding_model: String,
    /// Optional bearer token for the embeddings endpoint.
    pub embedding_api_key: Option<SecretString>,
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the local database file.
    pub db_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub providers: ProviderConfig,
}

impl EngineConfig {
    /// Load configuration from the environment.
    ///
    /// Required: `ANTHROPIC_API_KEY` (or `OPENAI_API_KEY` with
    /// `PAGEFORGE_LLM_BACKEND=openai`) and `RAPIDAPI_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("PAGEFORGE_LLM_BACKEND").as_deref() {
            Ok("openai") => LlmBackend::OpenAi,
            _ => LlmBackend::Anthropic,
        };

        let (key_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-sonnet-4-20250514"),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o"),
        };
        let llm_api_key = require_env(key_var)?;
        let rapidapi_key = require_env("RAPIDAPI_KEY")?;

        let model =
            std::env::var("PAGEFORGE_MODEL").unwrap_or_else(|_| default_model.to_string());
        let max_tokens = parse_env("PAGEFORGE_MAX_TOKENS", 4096)?;

        let embedding_url = std::env::var("PAGEFORGE_EMBED_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8081/v1/embeddings".to_string());
        let embedding_model = std::env::var("PAGEFORGE_EMBED_MODEL")
            .unwrap_or_else(|_| "bge-micro-v2".to_string());
        let embedding_api_key = std::env::var("PAGEFORGE_EMBED_API_KEY")
            .ok()
            .map(SecretString::from);

        let db_path = std::env::var("PAGEFORGE_DB_PATH")
            .unwrap_or_else(|_| "./data/pageforge.db".to_string())
            .into();

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_millis(parse_env("PAGEFORGE_POLL_MS", 1000)?),
            ..Default::default()
        };

        Ok(Self {
            db_path,
            scheduler,
            providers: ProviderConfig {
                backend,
                llm_api_key,
                model,
                max_tokens,
                rapidapi_key,
                embedding_url,
                embedding_model,
                embedding_api_key,
            },
        })
    }
}

fn require_env(name: &str) -> Result<SecretString, ConfigError> {
    std::env::var(name)
        .map(SecretString::from)
        .map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: name.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults_match_retry_policy() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.retry_attempts, 3);
        assert!(cfg.retry_base_delay <= cfg.retry_max_delay);
    }
}
