//! Question generation across multiple LLM providers.
//!
//! The generator fans requests out over every configured provider,
//! consulting circuit breakers before each call and falling back to another
//! provider when a circuit is open mid-batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::costs::CostTracker;
use crate::errors::ProviderError;
use crate::models::{
    DifficultyLevel, EvaluatedQuestion, GeneratedQuestion, GenerationBatch,
    QuestionResponse, QuestionType,
};
use crate::prelude::*;
use crate::prompts::{build_generation_prompt, build_regeneration_prompt};
use crate::providers::{CompletionOpts, PROVIDER_ORDER, Provider};
use crate::schema::schema_for;

/// Failures surfaced by the generator.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invalid question response: {0}")]
    InvalidResponse(String),

    #[error("no providers available (all circuits are open); configured: {0:?}")]
    NoProvidersAvailable(Vec<String>),

    #[error("provider '{0}' not configured")]
    UnknownProvider(String),
}

impl GeneratorError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GeneratorError::Provider(err) if err.is_circuit_open())
    }
}

/// Orchestrates question generation over the configured providers.
#[derive(Debug)]
pub struct QuestionGenerator {
    providers: HashMap<String, Arc<dyn Provider>>,

    /// Provider names in round-robin order. HashMap iteration order is
    /// unstable, so distribution walks this list.
    order: Vec<String>,

    breakers: Arc<CircuitBreakerRegistry>,
    costs: Arc<CostTracker>,
    question_schema: Value,
    question_validator: jsonschema::Validator,
}

impl QuestionGenerator {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        breakers: Arc<CircuitBreakerRegistry>,
        costs: Arc<CostTracker>,
    ) -> Result<Self> {
        if providers.is_empty() {
            return Err(anyhow!("at least one LLM provider must be configured"));
        }
        let order: Vec<String> = PROVIDER_ORDER
            .iter()
            .filter(|name| providers.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        for name in &order {
            breakers.get_or_create(name);
        }
        let question_schema = schema_for::<QuestionResponse>();
        let question_validator = crate::schema::validator_for(&question_schema)?;
        info!(providers = ?order, "question generator initialized");
        Ok(Self {
            providers,
            order,
            breakers,
            costs,
            question_schema,
            question_validator,
        })
    }

    /// Providers whose circuit currently admits calls.
    fn available_providers(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.breakers.get_or_create(name).is_available())
            .cloned()
            .collect()
    }

    fn first_available(&self) -> Option<String> {
        self.available_providers().into_iter().next()
    }

    /// Generate one question with a specific provider (or the first
    /// available one), inside that provider's circuit breaker.
    pub async fn generate_question(
        &self,
        question_type: QuestionType,
        difficulty: DifficultyLevel,
        provider_name: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<GeneratedQuestion, GeneratorError> {
        let provider_name = match provider_name {
            Some(name) => {
                if !self.providers.contains_key(name) {
                    return Err(GeneratorError::UnknownProvider(name.to_owned()));
                }
                name.to_owned()
            }
            None => self
                .first_available()
                .ok_or_else(|| GeneratorError::NoProvidersAvailable(self.order.clone()))?,
        };
        let provider = self.providers[&provider_name].clone();
        let breaker = self.breakers.get_or_create(&provider_name);

        info!(
            %question_type,
            %difficulty,
            provider = %provider_name,
            "generating question"
        );
        let prompt = build_generation_prompt(question_type, difficulty, 1);
        let opts = CompletionOpts { temperature, max_tokens, model_override: None };

        let result = breaker
            .execute(|| {
                provider.generate_structured_completion_with_usage(
                    &prompt,
                    &self.question_schema,
                    &opts,
                )
            })
            .await?;
        if let Some(usage) = &result.token_usage {
            self.costs.record_usage(usage);
        }

        let question = self.parse_generated(
            result.value,
            question_type,
            difficulty,
            &provider_name,
            provider.model(),
        )?;
        info!(text = %truncate(&question.question_text, 50), "generated question");
        Ok(question)
    }

    /// Generate a batch, distributing round-robin across available providers
    /// when `distribute` is set (and more than one provider is configured).
    ///
    /// The batch may come back short: individual failures are recorded and
    /// skipped rather than aborting the whole batch.
    #[instrument(level = "debug", skip(self))]
    pub async fn generate_batch(
        &self,
        question_type: QuestionType,
        difficulty: DifficultyLevel,
        count: usize,
        distribute: bool,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<GenerationBatch, GeneratorError> {
        info!(%question_type, %difficulty, count, "generating batch");

        let mut questions: Vec<GeneratedQuestion> = Vec::new();
        let mut skipped_providers: BTreeMap<String, usize> = BTreeMap::new();
        let mut failures = 0usize;

        if distribute && self.providers.len() > 1 {
            if self.available_providers().is_empty() {
                return Err(GeneratorError::NoProvidersAvailable(self.order.clone()));
            }
            for i in 0..count {
                // Availability can change as circuits open mid-batch.
                let available = self.available_providers();
                if available.is_empty() {
                    warn!(
                        completed = questions.len(),
                        requested = count,
                        "all providers became unavailable during batch"
                    );
                    break;
                }
                let provider_name = &available[i % available.len()];
                match self
                    .generate_question(
                        question_type,
                        difficulty,
                        Some(provider_name.as_str()),
                        temperature,
                        max_tokens,
                    )
                    .await
                {
                    Ok(question) => questions.push(question),
                    Err(err) if err.is_circuit_open() => {
                        *skipped_providers.entry(provider_name.clone()).or_insert(0) += 1;
                        warn!(
                            provider = %provider_name,
                            item = i + 1,
                            "skipped provider (circuit open)"
                        );
                        // One-shot fallback to any other available provider.
                        if let Some(fallback) = self
                            .available_providers()
                            .into_iter()
                            .find(|name| name != provider_name)
                        {
                            match self
                                .generate_question(
                                    question_type,
                                    difficulty,
                                    Some(fallback.as_str()),
                                    temperature,
                                    max_tokens,
                                )
                                .await
                            {
                                Ok(question) => questions.push(question),
                                Err(fallback_err) => {
                                    failures += 1;
                                    error!(
                                        provider = %fallback,
                                        %fallback_err,
                                        "fallback provider also failed"
                                    );
                                }
                            }
                        } else {
                            failures += 1;
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        error!(
                            provider = %provider_name,
                            item = i + 1,
                            %err,
                            "failed to generate question"
                        );
                    }
                }
            }
        } else {
            // Single-provider mode: stick with one provider until its
            // circuit opens, then move to the next available one. Errors out
            // up front when every circuit is already open.
            let mut current = self
                .first_available()
                .ok_or_else(|| GeneratorError::NoProvidersAvailable(self.order.clone()))?;
            for i in 0..count {
                match self
                    .generate_question(
                        question_type,
                        difficulty,
                        Some(current.as_str()),
                        temperature,
                        max_tokens,
                    )
                    .await
                {
                    Ok(question) => questions.push(question),
                    Err(err) if err.is_circuit_open() => {
                        *skipped_providers.entry(current.clone()).or_insert(0) += 1;
                        warn!(
                            provider = %current,
                            completed = questions.len(),
                            "circuit opened during batch"
                        );
                        match self.first_available() {
                            Some(next) => current = next,
                            None => {
                                warn!("no more providers available, stopping batch");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        error!(item = i + 1, %err, "failed to generate question");
                    }
                }
            }
        }

        let mut providers_used: Vec<String> =
            questions.iter().map(|q| q.source_llm.clone()).collect();
        providers_used.sort();
        providers_used.dedup();

        let batch = GenerationBatch {
            success_rate: if count > 0 {
                questions.len() as f64 / count as f64
            } else {
                0.0
            },
            question_type,
            target_difficulty: difficulty,
            batch_size: count,
            generated_at: chrono::Utc::now(),
            providers_used,
            skipped_providers,
            failures,
            circuit_breaker_states: self.breakers.all_states(),
            questions,
        };
        info!(
            generated = batch.questions.len(),
            requested = count,
            "batch generation complete"
        );
        Ok(batch)
    }

    /// Regenerate a rejected question: same type and difficulty, with the
    /// judge's feedback and weak scores folded into the prompt. Prefers the
    /// provider that produced the original; one attempt, no fallback.
    pub async fn regenerate_question(
        &self,
        rejected: &EvaluatedQuestion,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<GeneratedQuestion, GeneratorError> {
        let question = &rejected.question;
        let provider_name = if self.providers.contains_key(&question.source_llm)
            && self.breakers.get_or_create(&question.source_llm).is_available()
        {
            question.source_llm.clone()
        } else {
            self.first_available()
                .ok_or_else(|| GeneratorError::NoProvidersAvailable(self.order.clone()))?
        };
        let provider = self.providers[&provider_name].clone();
        let breaker = self.breakers.get_or_create(&provider_name);

        let evaluation = &rejected.evaluation;
        let scores = [
            ("clarity", evaluation.clarity_score),
            ("difficulty", evaluation.difficulty_score),
            ("validity", evaluation.validity_score),
            ("formatting", evaluation.formatting_score),
            ("creativity", evaluation.creativity_score),
        ];
        let prompt = build_regeneration_prompt(
            &question.question_text,
            &question.correct_answer,
            &question.answer_options,
            question.question_type,
            question.difficulty_level,
            evaluation
                .feedback
                .as_deref()
                .unwrap_or("No specific feedback was provided."),
            &scores,
        );
        let opts = CompletionOpts { temperature, max_tokens, model_override: None };

        info!(
            question_type = %question.question_type,
            provider = %provider_name,
            "regenerating rejected question"
        );
        let result = breaker
            .execute(|| {
                provider.generate_structured_completion_with_usage(
                    &prompt,
                    &self.question_schema,
                    &opts,
                )
            })
            .await?;
        if let Some(usage) = &result.token_usage {
            self.costs.record_usage(usage);
        }
        self.parse_generated(
            result.value,
            question.question_type,
            question.difficulty_level,
            &provider_name,
            provider.model(),
        )
    }

    fn parse_generated(
        &self,
        value: Value,
        question_type: QuestionType,
        difficulty: DifficultyLevel,
        provider_name: &str,
        model: &str,
    ) -> Result<GeneratedQuestion, GeneratorError> {
        // Some models return a single-element array even when asked for one
        // question.
        let value = match value {
            Value::Array(mut items) if !items.is_empty() => items.remove(0),
            other => other,
        };
        self.question_validator
            .validate(&value)
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;
        let response: QuestionResponse = serde_json::from_value(value)
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;
        let question = GeneratedQuestion::from_response(
            response,
            question_type,
            difficulty,
            provider_name,
            model,
        );
        question
            .validate()
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;
        Ok(question)
    }

    /// Per-provider model and breaker snapshot for diagnostics.
    pub fn provider_stats(&self) -> Value {
        let breaker_stats = self.breakers.all_stats();
        let mut stats = serde_json::Map::new();
        for name in &self.order {
            let provider = &self.providers[name];
            stats.insert(
                name.clone(),
                json!({
                    "model": provider.model(),
                    "circuit_breaker": breaker_stats.get(name),
                }),
            );
        }
        Value::Object(stats)
    }

    /// Release provider resources.
    pub async fn cleanup(&self) {
        for provider in self.providers.values() {
            provider.cleanup().await;
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::costs::{CompletionResult, StructuredResult};
    use crate::errors::{ClassifiedError, ErrorCategory};
    use crate::providers::CompletionOpts;

    /// Mock provider that fails a configurable number of times, then
    /// returns a fixed valid question.
    #[derive(Debug)]
    struct MockProvider {
        name: String,
        calls: AtomicU32,
        remaining_failures: AtomicU32,
    }

    impl MockProvider {
        fn new(name: &str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                calls: AtomicU32::new(0),
                remaining_failures: AtomicU32::new(failures),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "mock-model"
        }

        async fn generate_completion_with_usage(
            &self,
            _prompt: &str,
            _opts: &CompletionOpts,
        ) -> Result<CompletionResult, ProviderError> {
            unimplemented!("generator only issues structured calls")
        }

        async fn generate_structured_completion_with_usage(
            &self,
            _prompt: &str,
            _schema: &Value,
            _opts: &CompletionOpts,
        ) -> Result<StructuredResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ClassifiedError::new(
                    ErrorCategory::Server,
                    &self.name,
                    "503 from mock",
                )
                .into());
            }
            Ok(StructuredResult {
                value: json!({
                    "question_text": format!("question from {}", self.name),
                    "correct_answer": "38",
                    "answer_options": ["36", "38", "40", "42"],
                    "explanation": "sequence of odd increments",
                }),
                token_usage: None,
            })
        }

        async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![])
        }

        fn static_models(&self) -> Vec<String> {
            vec!["mock-model".into()]
        }
    }

    fn generator_with(
        providers: Vec<Arc<MockProvider>>,
        threshold: u32,
    ) -> (QuestionGenerator, Arc<CircuitBreakerRegistry>) {
        let map: HashMap<String, Arc<dyn Provider>> = providers
            .into_iter()
            .map(|p| (p.name.clone(), p as Arc<dyn Provider>))
            .collect();
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: std::time::Duration::from_secs(60),
            half_open_max_calls: 1,
        }));
        let generator =
            QuestionGenerator::new(map, breakers.clone(), Arc::new(CostTracker::new()))
                .unwrap();
        (generator, breakers)
    }

    #[tokio::test]
    async fn happy_path_batch() {
        let provider = MockProvider::new("openai", 0);
        let (generator, _) = generator_with(vec![provider.clone()], 5);
        let batch = generator
            .generate_batch(QuestionType::Pattern, DifficultyLevel::Easy, 2, true, 0.8, 1500)
            .await
            .unwrap();
        assert_eq!(batch.questions.len(), 2);
        assert_eq!(batch.success_rate, 1.0);
        assert_eq!(batch.providers_used, vec!["openai".to_owned()]);
        assert!(batch.skipped_providers.is_empty());
    }

    #[tokio::test]
    async fn circuit_opens_mid_batch_and_rotation_drops_the_provider() {
        // Provider A always fails; B always succeeds. A's breaker trips
        // open on its 5th consecutive failure, after which round-robin only
        // ever sees B.
        let a = MockProvider::new("openai", 1000);
        let b = MockProvider::new("anthropic", 0);
        let (generator, breakers) = generator_with(vec![a.clone(), b.clone()], 5);

        let batch = generator
            .generate_batch(QuestionType::Logic, DifficultyLevel::Medium, 10, true, 0.8, 1500)
            .await
            .unwrap();

        // A failed exactly 5 times, opening its circuit before a 6th call.
        assert_eq!(a.calls(), 5);
        assert_eq!(breakers.get_or_create("openai").state().as_str(), "open");
        assert_eq!(batch.failures, 5);
        // Every produced question came from B.
        assert_eq!(batch.questions.len(), 5);
        assert!(batch.questions.iter().all(|q| q.source_llm == "anthropic"));
        assert_eq!(batch.circuit_breaker_states["openai"], "open");
        assert_eq!(batch.circuit_breaker_states["anthropic"], "closed");
    }

    #[tokio::test]
    async fn explicit_call_to_open_provider_is_short_circuited() {
        let a = MockProvider::new("openai", 1000);
        let b = MockProvider::new("anthropic", 0);
        let (generator, _) = generator_with(vec![a.clone(), b], 1);

        // One failure trips the breaker at threshold 1.
        let _ = generator
            .generate_question(
                QuestionType::Math,
                DifficultyLevel::Easy,
                Some("openai"),
                0.8,
                1500,
            )
            .await;
        let calls_when_open = a.calls();

        let err = generator
            .generate_question(
                QuestionType::Math,
                DifficultyLevel::Easy,
                Some("openai"),
                0.8,
                1500,
            )
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        // The downstream was never invoked while the circuit was open.
        assert_eq!(a.calls(), calls_when_open);
    }

    #[tokio::test]
    async fn all_circuits_open_fails_the_batch() {
        let a = MockProvider::new("openai", 100);
        let (generator, breakers) = generator_with(vec![a], 1);
        // Trip the breaker.
        let _ = generator
            .generate_question(QuestionType::Math, DifficultyLevel::Easy, None, 0.8, 1500)
            .await;
        assert!(!breakers.get_or_create("openai").is_available());

        let result = generator
            .generate_batch(QuestionType::Math, DifficultyLevel::Easy, 3, true, 0.8, 1500)
            .await;
        // Single provider, so distribution is off; the batch errors out
        // before the first fallback.
        assert!(matches!(result, Err(GeneratorError::NoProvidersAvailable(_))));
    }

    #[tokio::test]
    async fn invalid_response_counts_as_failure() {
        /// Provider returning structurally invalid questions (3 options).
        #[derive(Debug)]
        struct BadProvider;

        #[async_trait]
        impl Provider for BadProvider {
            fn name(&self) -> &str {
                "openai"
            }
            fn model(&self) -> &str {
                "mock"
            }
            async fn generate_completion_with_usage(
                &self,
                _prompt: &str,
                _opts: &CompletionOpts,
            ) -> Result<CompletionResult, ProviderError> {
                unimplemented!()
            }
            async fn generate_structured_completion_with_usage(
                &self,
                _prompt: &str,
                _schema: &Value,
                _opts: &CompletionOpts,
            ) -> Result<StructuredResult, ProviderError> {
                Ok(StructuredResult {
                    value: json!({
                        "question_text": "q",
                        "correct_answer": "a",
                        "answer_options": ["a", "b", "c"],
                        "explanation": "e",
                    }),
                    token_usage: None,
                })
            }
            async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
                Ok(vec![])
            }
            fn static_models(&self) -> Vec<String> {
                vec![]
            }
        }

        let map: HashMap<String, Arc<dyn Provider>> =
            [("openai".to_owned(), Arc::new(BadProvider) as Arc<dyn Provider>)]
                .into_iter()
                .collect();
        let generator = QuestionGenerator::new(
            map,
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(CostTracker::new()),
        )
        .unwrap();

        let batch = generator
            .generate_batch(QuestionType::Verbal, DifficultyLevel::Hard, 2, false, 0.8, 1500)
            .await
            .unwrap();
        assert!(batch.questions.is_empty());
        assert_eq!(batch.failures, 2);
        assert_eq!(batch.success_rate, 0.0);
    }

    #[tokio::test]
    async fn single_element_array_responses_parse() {
        let (generator, _) = generator_with(vec![MockProvider::new("openai", 0)], 5);
        let parsed = generator.parse_generated(
            json!([{
                "question_text": "q?",
                "correct_answer": "a",
                "answer_options": ["a", "b", "c", "d"],
                "explanation": "e",
            }]),
            QuestionType::Logic,
            DifficultyLevel::Easy,
            "openai",
            "gpt-4o",
        );
        assert!(parsed.is_ok());
    }
}
