//! xAI (Grok) provider adapter.
//!
//! The xAI API is OpenAI-compatible, so this adapter reuses the OpenAI
//! client pointed at the xAI base URL. Structured output differs: Grok
//! models take JSON-object mode with the schema appended to the prompt.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, ResponseFormat,
    },
};

use crate::costs::{CompletionResult, StructuredResult, TokenUsage};
use crate::errors::{ClassifiedError, ProviderError, classify_openai};
use crate::prelude::*;
use crate::providers::{
    CompletionOpts, Provider, append_schema_instructions, estimate_usage,
    parse_structured_body,
};
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "grok-4";

const API_BASE: &str = "https://api.x.ai/v1";
const PROVIDER_NAME: &str = "xai";

/// Hard-coded model list, newest first.
const STATIC_MODELS: [&str; 2] = ["grok-4", "grok-beta"];

#[derive(Debug)]
pub struct XaiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    retry: RetryPolicy,
}

impl XaiProvider {
    pub fn new(api_key: &str, model: &str, retry: RetryPolicy) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key).with_api_base(API_BASE);
        Self { client: Client::with_config(config), model: model.to_owned(), retry }
    }

    fn build_request(
        &self,
        model: &str,
        prompt: &str,
        opts: &CompletionOpts,
        json_mode: bool,
    ) -> Result<Value, ProviderError> {
        let message = user_message(prompt).map_err(|e| classify_openai(PROVIDER_NAME, &e))?;
        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(model.to_owned())
            .messages(vec![message])
            .temperature(opts.temperature)
            .max_tokens(opts.max_tokens);
        if json_mode {
            req.response_format(ResponseFormat::JsonObject);
        }
        let req = req.build().map_err(|e| classify_openai(PROVIDER_NAME, &e))?;
        serde_json::to_value(req)
            .map_err(|e| ClassifiedError::parse_failure(PROVIDER_NAME, e.to_string()).into())
    }

    async fn chat_once(
        &self,
        model: &str,
        prompt: &str,
        req: &Value,
    ) -> Result<CompletionResult, ProviderError> {
        let raw: Value = self
            .client
            .chat()
            .create_byot(req.clone())
            .await
            .map_err(|e| classify_openai(PROVIDER_NAME, &e))?;
        trace!(%raw, "xAI response");

        let response: CreateChatCompletionResponse =
            serde_json::from_value(raw).map_err(|e| {
                ClassifiedError::parse_failure(
                    PROVIDER_NAME,
                    format!("error parsing xAI response: {e}"),
                )
            })?;
        let choice = response.choices.first().ok_or_else(|| {
            ClassifiedError::parse_failure(PROVIDER_NAME, "no choices in xAI response")
        })?;
        let content = choice.message.content.clone().unwrap_or_default();

        let token_usage = match response.usage {
            Some(usage) => Some(TokenUsage {
                input_tokens: u64::from(usage.prompt_tokens),
                output_tokens: u64::from(usage.completion_tokens),
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
impl Provider for XaiProvider {
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
        let req = self.build_request(&model, prompt, opts, false)?;
        self.retry
            .run(PROVIDER_NAME, || self.chat_once(&model, prompt, &req))
            .await
    }

    #[instrument(level = "debug", skip_all)]
    async fn generate_structured_completion_with_usage(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &CompletionOpts,
    ) -> Result<StructuredResult, ProviderError> {
        let model = opts.model_override.as_deref().unwrap_or(&self.model).to_owned();
        let json_prompt = append_schema_instructions(prompt, schema);
        let req = self.build_request(&model, &json_prompt, opts, true)?;
        let result = self
            .retry
            .run(PROVIDER_NAME, || self.chat_once(&model, &json_prompt, &req))
            .await?;
        let value = parse_structured_body(PROVIDER_NAME, &result.content)?;
        Ok(StructuredResult { value, token_usage: result.token_usage })
    }

    async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .models()
            .list()
            .await
            .map_err(|e| classify_openai(PROVIDER_NAME, &e))?;
        Ok(response.data.into_iter().map(|m| m.id).collect())
    }

    fn static_models(&self) -> Vec<String> {
        STATIC_MODELS.iter().map(|m| m.to_string()).collect()
    }
}

fn user_message(
    prompt: &str,
) -> Result<ChatCompletionRequestMessage, async_openai::error::OpenAIError> {
    Ok(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Text(prompt.to_owned()))
            .build()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_request_uses_json_object_mode() {
        let provider = XaiProvider::new(
            "xai-test",
            DEFAULT_MODEL,
            RetryPolicy::new(Default::default(), Default::default()),
        );
        let opts = CompletionOpts::default();
        let req = provider.build_request("grok-4", "hi", &opts, true).unwrap();
        assert_eq!(req["response_format"]["type"], "json_object");
        assert_eq!(req["model"], "grok-4");
    }

    #[test]
    fn static_models_are_newest_first() {
        let provider = XaiProvider::new(
            "xai-test",
            DEFAULT_MODEL,
            RetryPolicy::new(Default::default(), Default::default()),
        );
        assert_eq!(provider.static_models()[0], "grok-4");
    }
}
