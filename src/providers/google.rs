//! Google Gemini provider adapter (Generative Language API).

use reqwest::Client;

use crate::costs::{CompletionResult, StructuredResult, TokenUsage};
use crate::errors::{ProviderError, classify, classify_reqwest};
use crate::prelude::*;
use crate::providers::{
    CompletionOpts, Provider, append_schema_instructions, estimate_usage,
    parse_structured_body,
};
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER_NAME: &str = "google";

/// Hard-coded model list, newest first.
const STATIC_MODELS: [&str; 3] = ["gemini-1.5-pro", "gemini-1.5-flash", "gemini-1.0-pro"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Debug)]
pub struct GoogleProvider {
    client: Client,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl GoogleProvider {
    pub fn new(api_key: &str, model: &str, retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, api_key: api_key.to_owned(), model: model.to_owned(), retry }
    }

    async fn generate_once(
        &self,
        model: &str,
        prompt: &str,
        opts: &CompletionOpts,
        json_mode: bool,
    ) -> Result<CompletionResult, ProviderError> {
        let body = GenerateContentRequest {
            contents: vec![Content { parts: vec![Part { text: prompt }] }],
            generation_config: GenerationConfig {
                temperature: opts.temperature,
                max_output_tokens: opts.max_tokens,
                response_mime_type: json_mode.then_some("application/json"),
            },
        };
        let url = format!(
            "{API_BASE}/models/{model}:generateContent?key={key}",
            key = self.api_key
        );
        let response = self
            .client
            .post(&url)
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
        trace!(%text, "Google response");

        let parsed: GenerateContentResponse = serde_json::from_str(&text).map_err(|e| {
            crate::errors::ClassifiedError::parse_failure(
                PROVIDER_NAME,
                format!("error parsing Google response: {e}"),
            )
        })?;

        let content = parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .and_then(|p| p.text.clone())
            .unwrap_or_default();
        if content.is_empty() {
            warn!("Google API returned empty response");
        }

        let token_usage = match parsed.usage_metadata {
            Some(usage) => Some(TokenUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
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
impl Provider for GoogleProvider {
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
            .run(PROVIDER_NAME, || self.generate_once(&model, prompt, opts, false))
            .await
    }

    #[instrument(level = "debug", skip_all)]
    async fn generate_structured_completion_with_usage(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &CompletionOpts,
    ) -> Result<StructuredResult, ProviderError> {
        // JSON mime mode keeps Gemini from wrapping output in prose; the
        // schema still travels in the prompt.
        let model = opts.model_override.as_deref().unwrap_or(&self.model).to_owned();
        let json_prompt = append_schema_instructions(prompt, schema);
        let result = self
            .retry
            .run(PROVIDER_NAME, || self.generate_once(&model, &json_prompt, opts, true))
            .await?;
        let value = parse_structured_body(PROVIDER_NAME, &result.content)?;
        Ok(StructuredResult { value, token_usage: result.token_usage })
    }

    async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{API_BASE}/models?key={key}", key = self.api_key);
        let response = self
            .client
            .get(&url)
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
        let parsed: ListModelsResponse = serde_json::from_str(&text).map_err(|e| {
            crate::errors::ClassifiedError::parse_failure(PROVIDER_NAME, e.to_string())
        })?;
        Ok(parsed
            .models
            .into_iter()
            .map(|m| m.name.trim_start_matches("models/").to_owned())
            .collect())
    }

    fn static_models(&self) -> Vec<String> {
        STATIC_MODELS.iter().map(|m| m.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_uses_camel_case() {
        let body = GenerateContentRequest {
            contents: vec![Content { parts: vec![Part { text: "hello" }] }],
            generation_config: GenerationConfig {
                temperature: 0.8,
                max_output_tokens: 1500,
                response_mime_type: Some("application/json"),
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1500);
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(value["contents"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn response_parses_with_usage() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "{\"a\": 1}"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 5}
        }"#;
        let parsed: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.usage_metadata.as_ref().unwrap().prompt_token_count, 12);
        assert_eq!(
            parsed.candidates[0].content.as_ref().unwrap().parts[0].text.as_deref(),
            Some("{\"a\": 1}")
        );
    }

    #[test]
    fn model_listing_strips_resource_prefix() {
        let parsed: ListModelsResponse = serde_json::from_str(
            r#"{"models": [{"name": "models/gemini-1.5-pro"}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.models[0].name.trim_start_matches("models/"),
            "gemini-1.5-pro"
        );
    }
}
