//! LLM provider adapters.
//!
//! Each adapter exposes the same capability set over one vendor API:
//! plain completions, structured (JSON) completions, usage-reporting
//! variants, token counting, and model listing. All raw errors are routed
//! through the error classifier and the retry engine before they surface.

use std::collections::HashMap;
use std::sync::Arc;

use crate::costs::{CompletionResult, StructuredResult, TokenUsage};
use crate::errors::{ClassifiedError, ProviderError};
use crate::prelude::*;
use crate::retry::{RetryConfig, RetryMetrics, RetryPolicy};

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod xai;

/// Sampling and length options for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionOpts {
    pub temperature: f32,
    pub max_tokens: u32,

    /// Model to use instead of the provider's default, without mutating
    /// provider state.
    pub model_override: Option<String>,
}

impl Default for CompletionOpts {
    fn default() -> Self {
        Self { temperature: 0.7, max_tokens: 1000, model_override: None }
    }
}

/// Capability set every provider adapter satisfies.
#[async_trait]
pub trait Provider: std::fmt::Debug + Send + Sync {
    /// Short provider name ("openai", "anthropic", "google", "xai").
    fn name(&self) -> &str;

    /// The provider's default model.
    fn model(&self) -> &str;

    /// Generate a plain text completion.
    async fn generate_completion(
        &self,
        prompt: &str,
        opts: &CompletionOpts,
    ) -> Result<String, ProviderError> {
        Ok(self.generate_completion_with_usage(prompt, opts).await?.content)
    }

    /// Generate a JSON completion conforming to `schema`.
    async fn generate_structured_completion(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &CompletionOpts,
    ) -> Result<Value, ProviderError> {
        Ok(self
            .generate_structured_completion_with_usage(prompt, schema, opts)
            .await?
            .value)
    }

    /// Plain completion, returning token usage alongside the content.
    async fn generate_completion_with_usage(
        &self,
        prompt: &str,
        opts: &CompletionOpts,
    ) -> Result<CompletionResult, ProviderError>;

    /// Structured completion, returning token usage alongside the value.
    async fn generate_structured_completion_with_usage(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &CompletionOpts,
    ) -> Result<StructuredResult, ProviderError>;

    /// Rough token estimate. Around 4 bytes per token for English; adapters
    /// with a real tokenizer may override.
    fn count_tokens(&self, text: &str) -> u64 {
        (text.len() / 4) as u64
    }

    /// Models available from the provider's live listing API. May be empty
    /// when the provider has no listing endpoint; callers fall back to
    /// [`Provider::static_models`].
    async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError>;

    /// Hard-coded model list, newest first. The authority when live listing
    /// is unavailable.
    fn static_models(&self) -> Vec<String>;

    /// Release HTTP clients and other resources.
    async fn cleanup(&self) {}
}

/// Strip a leading Markdown code fence from a structured response body.
/// Some models wrap JSON in ```json ... ``` despite instructions.
pub(crate) fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Parse a structured response body.
///
/// An empty body becomes an empty object with a warning rather than an
/// error; anything else that is not valid JSON is a non-retryable parse
/// failure.
pub(crate) fn parse_structured_body(
    provider: &str,
    content: &str,
) -> Result<Value, ProviderError> {
    let body = strip_code_fences(content);
    if body.is_empty() {
        warn!(provider, "structured response body was empty");
        return Ok(json!({}));
    }
    serde_json::from_str(body).map_err(|err| {
        ClassifiedError::parse_failure(
            provider,
            format!("failed to parse JSON response: {err}"),
        )
        .into()
    })
}

/// Instructions appended to the prompt for providers without native
/// structured output.
pub(crate) fn append_schema_instructions(prompt: &str, schema: &Value) -> String {
    format!("{prompt}\n\nRespond with valid JSON matching this schema: {schema}")
}

/// Estimate token usage from text lengths when a response carries no usage
/// block. The estimate is marked so cost rollups stay honest.
pub(crate) fn estimate_usage(
    provider: &str,
    model: &str,
    prompt: &str,
    content: &str,
) -> TokenUsage {
    TokenUsage {
        input_tokens: (prompt.len() / 4) as u64,
        output_tokens: (content.len() / 4) as u64,
        model: model.to_owned(),
        provider: provider.to_owned(),
        estimated: true,
    }
}

/// API keys and default models for the providers a run may use.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub anthropic_model: Option<String>,
    pub google_model: Option<String>,
    pub xai_model: Option<String>,
    pub retry: RetryConfig,
}

impl ProviderSettings {
    /// Read API keys from the conventional environment variables.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            openai_api_key: var("OPENAI_API_KEY"),
            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            google_api_key: var("GOOGLE_API_KEY"),
            xai_api_key: var("XAI_API_KEY"),
            ..Default::default()
        }
    }
}

/// Build the provider map from settings. Providers without a key are simply
/// absent; at least one must be configured.
pub fn build_providers(
    settings: &ProviderSettings,
    retry_metrics: Arc<RetryMetrics>,
) -> Result<HashMap<String, Arc<dyn Provider>>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    let policy = RetryPolicy::new(settings.retry.clone(), retry_metrics);

    if let Some(key) = &settings.openai_api_key {
        let model = settings.openai_model.as_deref().unwrap_or(openai::DEFAULT_MODEL);
        providers.insert(
            "openai".to_owned(),
            Arc::new(openai::OpenAiProvider::new(key, model, policy.clone())),
        );
        info!(model, "initialized OpenAI provider");
    }
    if let Some(key) = &settings.anthropic_api_key {
        let model =
            settings.anthropic_model.as_deref().unwrap_or(anthropic::DEFAULT_MODEL);
        providers.insert(
            "anthropic".to_owned(),
            Arc::new(anthropic::AnthropicProvider::new(key, model, policy.clone())),
        );
        info!(model, "initialized Anthropic provider");
    }
    if let Some(key) = &settings.google_api_key {
        let model = settings.google_model.as_deref().unwrap_or(google::DEFAULT_MODEL);
        providers.insert(
            "google".to_owned(),
            Arc::new(google::GoogleProvider::new(key, model, policy.clone())),
        );
        info!(model, "initialized Google provider");
    }
    if let Some(key) = &settings.xai_api_key {
        let model = settings.xai_model.as_deref().unwrap_or(xai::DEFAULT_MODEL);
        providers.insert(
            "xai".to_owned(),
            Arc::new(xai::XaiProvider::new(key, model, policy)),
        );
        info!(model, "initialized xAI provider");
    }

    if providers.is_empty() {
        return Err(anyhow!(
            "at least one LLM provider API key must be configured \
             (OPENAI_API_KEY, ANTHROPIC_API_KEY, GOOGLE_API_KEY or XAI_API_KEY)"
        ));
    }
    Ok(providers)
}

/// Canonical ordering for round-robin distribution. HashMap iteration order
/// is unstable, so the generator walks this list instead.
pub const PROVIDER_ORDER: [&str; 4] = ["openai", "anthropic", "google", "xai"];
