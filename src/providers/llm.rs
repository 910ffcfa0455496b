//! Completion provider — text generation for the rendering stage.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Uses the rig-core crate for HTTP transport and a small adapter to bridge
//! rig's `CompletionModel` trait to our `CompletionProvider` trait.

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::{AssistantContent, CompletionModel};
use secrecy::ExposeSecret;

use crate::config::{LlmBackend, ProviderConfig};
use crate::error::ProviderError;

/// A synchronous-from-the-handler's-view text completion collaborator.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Send a prompt, get the completion text back.
    async fn generate_text(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError>;

    /// Model identifier, for logging.
    fn model_name(&self) -> &str;
}

/// Create a completion provider from configuration.
pub fn create_completion_provider(
    config: &ProviderConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(
    config: &ProviderConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.llm_api_key.expose_secret()).map_err(|e| {
            ProviderError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigCompletion::new(model, &config.model)))
}

fn create_openai_provider(
    config: &ProviderConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.llm_api_key.expose_secret()).map_err(|e| {
            ProviderError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigCompletion::new(model, &config.model)))
}

/// Adapter from a rig `CompletionModel` to `CompletionProvider`.
pub struct RigCompletion<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigCompletion<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M: CompletionModel> CompletionProvider for RigCompletion<M> {
    async fn generate_text(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        let request = self
            .model
            .completion_request(prompt)
            .max_tokens(max_tokens as u64)
            .build();

        let response = self
            .model
            .completion(request)
            .await
            .map_err(|e| classify_completion_error(&self.model_name, &e.to_string()))?;

        let text: String = response
            .choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(t) => Some(t.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "completion contained no text content".to_string(),
            });
        }
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Map a provider failure onto the retry taxonomy by inspecting the message.
///
/// 429 and 529 are the retry-after-a-delay family; everything else is a
/// plain request failure (still transient) unless it smells like bad
/// credentials.
fn classify_completion_error(provider: &str, message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("529") || lower.contains("overloaded") {
        ProviderError::Overloaded {
            provider: provider.to_string(),
        }
    } else if lower.contains("401") || lower.contains("authentication") {
        ProviderError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        ProviderError::RequestFailed {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    }
}
