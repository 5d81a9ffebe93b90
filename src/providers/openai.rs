//! OpenAI provider adapter.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, ResponseFormat, ResponseFormatJsonSchema,
    },
};

use crate::costs::{CompletionResult, StructuredResult, TokenUsage};
use crate::errors::{ClassifiedError, ProviderError, classify_openai};
use crate::prelude::*;
use crate::providers::{
    CompletionOpts, Provider, estimate_usage, parse_structured_body,
};
use crate::retry::RetryPolicy;
use crate::schema::schema_title;

pub const DEFAULT_MODEL: &str = "gpt-4-turbo-preview";

/// Model id prefixes that require `max_completion_tokens` instead of
/// `max_tokens`. These reasoning models burn completion budget on internal
/// chain-of-thought, so the requested limit is multiplied to leave room for
/// both reasoning and output.
const MAX_COMPLETION_TOKENS_PREFIXES: [&str; 4] = ["gpt-5", "o1", "o3", "o4"];
const REASONING_TOKEN_MULTIPLIER: u32 = 4;

/// Hard-coded model list, newest first.
const STATIC_MODELS: [&str; 8] = [
    "gpt-5.2",
    "gpt-5.1",
    "gpt-5",
    "o4-mini",
    "o3",
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4-turbo-preview",
];

#[derive(Debug)]
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: &str, retry: RetryPolicy) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self { client: Client::with_config(config), model: model.to_owned(), retry }
    }

    fn uses_max_completion_tokens(model: &str) -> bool {
        MAX_COMPLETION_TOKENS_PREFIXES.iter().any(|prefix| model.starts_with(prefix))
    }

    /// Build a chat request, picking the right token-limit parameter for the
    /// model.
    fn build_request(
        &self,
        model: &str,
        prompt: &str,
        opts: &CompletionOpts,
        response_format: Option<ResponseFormat>,
    ) -> Result<Value, ProviderError> {
        let message = user_message(prompt).map_err(|e| classify_openai(self.name(), &e))?;
        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(model.to_owned())
            .messages(vec![message])
            .temperature(opts.temperature);
        if Self::uses_max_completion_tokens(model) {
            req.max_completion_tokens(opts.max_tokens * REASONING_TOKEN_MULTIPLIER);
        } else {
            req.max_tokens(opts.max_tokens);
        }
        if let Some(format) = response_format {
            req.response_format(format);
        }
        let req = req.build().map_err(|e| classify_openai(self.name(), &e))?;
        serde_json::to_value(req)
            .map_err(|e| ClassifiedError::parse_failure(self.name(), e.to_string()).into())
    }

    /// Issue one chat call and pull out the first choice's content plus
    /// usage, substituting an estimate when usage is absent.
    async fn chat_once(
        &self,
        model: &str,
        prompt: &str,
        req: &Value,
    ) -> Result<CompletionResult, ProviderError> {
        let chat = self.client.chat();
        let raw: Value = chat
            .create_byot(req.clone())
            .await
            .map_err(|e| classify_openai(self.name(), &e))?;
        trace!(%raw, "OpenAI response");

        let response: CreateChatCompletionResponse = serde_json::from_value(raw)
            .map_err(|e| {
                ClassifiedError::parse_failure(
                    self.name(),
                    format!("error parsing OpenAI response: {e}"),
                )
            })?;

        let choice = response.choices.first().ok_or_else(|| {
            ClassifiedError::parse_failure(self.name(), "no choices in OpenAI response")
        })?;
        if choice.finish_reason == Some(async_openai::types::FinishReason::ContentFilter) {
            return Err(ClassifiedError::new(
                crate::errors::ErrorCategory::ContentFilter,
                self.name(),
                "content filter triggered",
            )
            .into());
        }
        let content = choice.message.content.clone().unwrap_or_default();

        let token_usage = match response.usage {
            Some(usage) => Some(TokenUsage {
                input_tokens: u64::from(usage.prompt_tokens),
                output_tokens: u64::from(usage.completion_tokens),
                model: model.to_owned(),
                provider: self.name().to_owned(),
                estimated: false,
            }),
            None => Some(estimate_usage(self.name(), model, prompt, &content)),
        };
        Ok(CompletionResult { content, token_usage })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
        let req = self.build_request(&model, prompt, opts, None)?;
        self.retry
            .run(self.name(), || self.chat_once(&model, prompt, &req))
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
        let json_schema = ResponseFormatJsonSchema {
            name: schema_title(schema),
            schema: Some(schema.clone()),
            strict: Some(true),
            description: None,
        };
        let req = self.build_request(
            &model,
            prompt,
            opts,
            Some(ResponseFormat::JsonSchema { json_schema }),
        )?;
        let result = self
            .retry
            .run(self.name(), || self.chat_once(&model, prompt, &req))
            .await?;
        let value = parse_structured_body(self.name(), &result.content)?;
        Ok(StructuredResult { value, token_usage: result.token_usage })
    }

    async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .models()
            .list()
            .await
            .map_err(|e| classify_openai(self.name(), &e))?;
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
    fn reasoning_models_use_alternate_token_param() {
        for model in ["gpt-5.1", "o1", "o3-mini", "o4-mini"] {
            assert!(OpenAiProvider::uses_max_completion_tokens(model), "{model}");
        }
        for model in ["gpt-4o", "gpt-4-turbo-preview", "gpt-3.5-turbo"] {
            assert!(!OpenAiProvider::uses_max_completion_tokens(model), "{model}");
        }
    }

    #[test]
    fn request_multiplies_reasoning_token_limit() {
        let provider = OpenAiProvider::new(
            "sk-test",
            "o3",
            RetryPolicy::new(Default::default(), Default::default()),
        );
        let opts = CompletionOpts { max_tokens: 500, ..Default::default() };
        let req = provider.build_request("o3", "hi", &opts, None).unwrap();
        assert_eq!(req["max_completion_tokens"], 2000);
        assert!(req.get("max_tokens").is_none());

        let req = provider.build_request("gpt-4o", "hi", &opts, None).unwrap();
        assert_eq!(req["max_tokens"], 500);
    }

    #[test]
    fn static_models_are_newest_first() {
        let provider = OpenAiProvider::new(
            "sk-test",
            DEFAULT_MODEL,
            RetryPolicy::new(Default::default(), Default::default()),
        );
        let models = provider.static_models();
        assert_eq!(models.first().map(String::as_str), Some("gpt-5.2"));
        assert!(models.contains(&DEFAULT_MODEL.to_owned()));
    }
}
