//! Anthropic Messages API provider adapter.

use reqwest::Client;

use crate::costs::{CompletionResult, StructuredResult, TokenUsage};
use crate::errors::{ProviderError, classify, classify_reqwest};
use crate::prelude::*;
use crate::providers::{
    CompletionOpts, Provider, append_schema_instructions, estimate_usage,
    parse_structured_body,
};
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const PROVIDER_NAME: &str = "anthropic";

/// Hard-coded model list, newest first. Anthropic has no public listing
/// endpoint usable with plain API keys, so this list is the authority.
const STATIC_MODELS: [&str; 6] = [
    "claude-opus-4-5-20251101",
    "claude-haiku-4-5-20251001",
    "claude-sonnet-4-5-20250929",
    "claude-sonnet-4-20250514",
    "claude-3-5-sonnet-20241022",
    "claude-3-haiku-20240307",
];

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str, retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, api_key: api_key.to_owned(), model: model.to_owned(), retry }
    }

    async fn messages_once(
        &self,
        model: &str,
        prompt: &str,
        opts: &CompletionOpts,
    ) -> Result<CompletionResult, ProviderError> {
        let body = MessagesRequest {
            model,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            messages: vec![MessageParam { role: "user", content: prompt }],
        };
        let response = self
            .client
            .post(format!("{API_BASE}/v1/messages"))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest(PROVIDER_NAME, &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_reqwest(PROVIDER_NAME, &e))?;
        if !status.is_success() {
            return Err(classify(PROVIDER_NAME, Some(status.as_u16()), &text).into());
        }
        trace!(%text, "Anthropic response");

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| {
            crate::errors::ClassifiedError::parse_failure(
                PROVIDER_NAME,
                format!("error parsing Anthropic response: {e}"),
            )
        })?;

        let content = parsed
            .content
            .first()
            .and_then(|block| block.text.clone())
            .unwrap_or_default();
        if content.is_empty() {
            warn!("Anthropic API returned empty response");
        }

        let token_usage = match parsed.usage {
            Some(usage) => Some(TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                model: model.to_owned(),
                provider: PROVIDER_NAME.to_owned(),
                estimated: false,
            }),
            None => Some(estimate_usage(PROVIDER_NAME, model, prompt, &content)),
        };
        Ok(CompletionResult { content, token_usage })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(level = "debug", skip_all)]
    async fn generate_completion_with_usage(
        &self,
        prompt: &str,
        opts: &CompletionOpts,
    ) -> Result<CompletionResult, ProviderError> {
        let model = opts.model_override.as_deref().unwrap_or(&self.model).to_owned();
        self.retry
            .run(PROVIDER_NAME, || self.messages_once(&model, prompt, opts))
            .await
    }

    #[instrument(level = "debug", skip_all)]
    async fn generate_structured_completion_with_usage(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &CompletionOpts,
    ) -> Result<StructuredResult, ProviderError> {
        // The Messages API has no structured-output mode; the schema rides
        // along in the prompt and the body is parsed defensively.
        let model = opts.model_override.as_deref().unwrap_or(&self.model).to_owned();
        let json_prompt = append_schema_instructions(prompt, schema);
        let result = self
            .retry
            .run(PROVIDER_NAME, || self.messages_once(&model, &json_prompt, opts))
            .await?;
        let value = parse_structured_body(PROVIDER_NAME, &result.content)?;
        Ok(StructuredResult { value, token_usage: result.token_usage })
    }

    /// No usable listing API for plain API keys; returns empty so callers
    /// fall back to [`Provider::static_models`].
    async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    fn static_models(&self) -> Vec<String> {
        STATIC_MODELS.iter().map(|m| m.to_string()).collect()
    }
}
