//! Asynchronous question evaluation.
//!
//! The judge scores candidates concurrently on one cooperative executor.
//! Concurrency is capped by a counting semaphore, every call carries a hard
//! timeout, and all calls flow through the judge-side circuit breakers.
//! Failed items are dropped (not retried here) and accounted by cause.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::JudgeConfig;
use crate::costs::CostTracker;
use crate::errors::{ClassifiedError, ErrorCategory, ProviderError};
use crate::models::{
    DifficultyLevel, EvaluatedQuestion, EvaluationResponse, EvaluationScore,
    GeneratedQuestion, QuestionType,
};
use crate::prelude::*;
use crate::prompts::build_judge_prompt;
use crate::providers::{CompletionOpts, Provider};
use crate::schema::schema_for;

/// Maximum concurrent judge API calls.
pub const DEFAULT_MAX_CONCURRENT_EVALUATIONS: usize = 10;

/// Hard per-call deadline for one evaluation, in seconds.
pub const DEFAULT_EVALUATION_TIMEOUT_SECS: u64 = 60;

/// Failures surfaced by the judge for one item.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("judge provider '{0}' not available and no fallback could be resolved")]
    NoJudgeAvailable(String),

    #[error("invalid evaluation response: {0}")]
    InvalidResponse(String),
}

impl JudgeError {
    fn is_circuit_open(&self) -> bool {
        matches!(self, JudgeError::Provider(err) if err.is_circuit_open())
    }

    fn is_timeout(&self) -> bool {
        matches!(
            self,
            JudgeError::Provider(err) if err.category() == Some(ErrorCategory::Timeout)
        )
    }
}

/// Result of evaluating a list, with the per-cause error taxonomy.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    /// Successfully evaluated questions only; dropped items are excluded.
    pub evaluated: Vec<EvaluatedQuestion>,
    pub circuit_breaker_skips: usize,
    pub timeout_errors: usize,
    pub other_errors: usize,
}

impl EvaluationOutcome {
    pub fn total_errors(&self) -> usize {
        self.circuit_breaker_skips + self.timeout_errors + self.other_errors
    }
}

/// Evaluates generated questions using the judge models from config.
#[derive(Debug)]
pub struct QuestionJudge {
    config: Arc<JudgeConfig>,
    providers: HashMap<String, Arc<dyn Provider>>,
    breakers: Arc<CircuitBreakerRegistry>,
    costs: Arc<CostTracker>,
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    evaluation_schema: Value,
}

impl QuestionJudge {
    pub fn new(
        config: Arc<JudgeConfig>,
        providers: HashMap<String, Arc<dyn Provider>>,
        breakers: Arc<CircuitBreakerRegistry>,
        costs: Arc<CostTracker>,
        max_concurrent_evaluations: usize,
        call_timeout: Duration,
    ) -> Result<Self> {
        if providers.is_empty() {
            return Err(anyhow!(
                "at least one LLM provider must be configured for the judge"
            ));
        }
        for name in providers.keys() {
            breakers.get_or_create(&judge_breaker_name(name));
        }
        info!(
            providers = providers.len(),
            max_concurrent = max_concurrent_evaluations,
            timeout_secs = call_timeout.as_secs(),
            "question judge initialized"
        );
        Ok(Self {
            config,
            providers,
            breakers,
            costs,
            semaphore: Arc::new(Semaphore::new(max_concurrent_evaluations)),
            call_timeout,
            evaluation_schema: schema_for::<EvaluationResponse>(),
        })
    }

    /// Resolve the judge (provider, model) for a question type.
    ///
    /// Chain: configured judge, then its configured fallback, then any
    /// provider whose judge circuit admits calls. Substitutions are logged
    /// loudly; acceptance thresholds never change with the substitution.
    fn resolve_judge(
        &self,
        question_type: QuestionType,
    ) -> Result<(String, String), JudgeError> {
        let judge = self.config.judge_for(question_type);

        let usable = |provider: &str| {
            self.providers.contains_key(provider)
                && self.breakers.get_or_create(&judge_breaker_name(provider)).is_available()
        };

        if usable(&judge.provider) {
            return Ok((judge.provider.clone(), judge.model.clone()));
        }

        if let Some(fallback) = &judge.fallback {
            if usable(fallback) {
                let model = judge
                    .fallback_model
                    .clone()
                    .unwrap_or_else(|| self.providers[fallback].model().to_owned());
                warn!(
                    %question_type,
                    primary = %judge.provider,
                    fallback = %fallback,
                    "primary judge unavailable, using configured fallback"
                );
                return Ok((fallback.clone(), model));
            }
        }

        for (name, provider) in &self.providers {
            if usable(name) {
                warn!(
                    %question_type,
                    primary = %judge.provider,
                    substitute = %name,
                    "no configured judge available, substituting provider"
                );
                return Ok((name.clone(), provider.model().to_owned()));
            }
        }

        // Nothing usable. If the primary is at least configured, route to it
        // anyway so its breaker fails fast and the drop is accounted as a
        // circuit-breaker skip rather than a config error.
        if self.providers.contains_key(&judge.provider) {
            return Ok((judge.provider.clone(), judge.model.clone()));
        }
        Err(JudgeError::NoJudgeAvailable(judge.provider.clone()))
    }

    /// Evaluate a single question: semaphore-bounded, timeout-guarded,
    /// breaker-protected.
    pub async fn evaluate_question(
        &self,
        question: &GeneratedQuestion,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EvaluatedQuestion, JudgeError> {
        let question_type = question.question_type;
        let (provider_name, model) = self.resolve_judge(question_type)?;
        let provider = self.providers[&provider_name].clone();
        let breaker = self.breakers.get_or_create(&judge_breaker_name(&provider_name));

        let prompt = build_judge_prompt(
            &question.question_text,
            &question.answer_options,
            &question.correct_answer,
            question_type,
            question.difficulty_level,
            question.stimulus.as_deref(),
        );
        let opts = CompletionOpts {
            temperature,
            max_tokens,
            model_override: Some(model.clone()),
        };
        debug!(%question_type, judge = %model, provider = %provider_name, "evaluating question");

        let result = breaker
            .execute(|| async {
                // The permit is released on every exit path, including
                // timeout and cancellation, when the guard drops.
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("evaluation semaphore closed");
                match tokio::time::timeout(
                    self.call_timeout,
                    provider.generate_structured_completion_with_usage(
                        &prompt,
                        &self.evaluation_schema,
                        &opts,
                    ),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(ClassifiedError::timeout(
                        &provider_name,
                        format!(
                            "evaluation timed out after {}s",
                            self.call_timeout.as_secs()
                        ),
                    )
                    .into()),
                }
            })
            .await?;
        if let Some(usage) = &result.token_usage {
            self.costs.record_usage(usage);
        }

        let response: EvaluationResponse = serde_json::from_value(result.value)
            .map_err(|err| JudgeError::InvalidResponse(err.to_string()))?;
        let mut evaluation = EvaluationScore::from_response(response);
        evaluation.overall_score = self.config.evaluation_criteria.overall(&evaluation);
        let approved = evaluation.overall_score >= self.config.min_judge_score;

        info!(
            overall = evaluation.overall_score,
            approved,
            threshold = self.config.min_judge_score,
            "question evaluated"
        );

        // Placement is separate from acceptance: re-level the question from
        // its difficulty score and feedback.
        let mut question = question.clone();
        let (placed, reason) = self.determine_difficulty_placement(
            question.difficulty_level,
            evaluation.difficulty_score,
            evaluation.feedback.as_deref(),
        );
        if let Some(reason) = reason {
            info!(
                from = %question.difficulty_level,
                to = %placed,
                %reason,
                "difficulty placement adjusted"
            );
            question
                .metadata
                .insert("placement_reason".to_owned(), Value::String(reason));
            question.difficulty_level = placed;
        }

        Ok(EvaluatedQuestion {
            question,
            evaluation,
            judge_model: format!("{provider_name}/{model}"),
            approved,
        })
    }

    /// Evaluate a list concurrently, gathering per-item results and
    /// accounting failures by cause. Dropped items are not retried.
    #[instrument(level = "debug", skip_all, fields(count = questions.len()))]
    pub async fn evaluate_questions_list(
        &self,
        questions: &[GeneratedQuestion],
        temperature: f32,
        max_tokens: u32,
    ) -> EvaluationOutcome {
        if questions.is_empty() {
            return EvaluationOutcome::default();
        }
        info!(count = questions.len(), "evaluating questions concurrently");

        let results = futures::future::join_all(
            questions
                .iter()
                .map(|q| self.evaluate_question(q, temperature, max_tokens)),
        )
        .await;

        let mut outcome = EvaluationOutcome::default();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(evaluated) => outcome.evaluated.push(evaluated),
                Err(err) if err.is_circuit_open() => {
                    outcome.circuit_breaker_skips += 1;
                    warn!(item = i + 1, "evaluation skipped (circuit breaker open)");
                }
                Err(err) if err.is_timeout() => {
                    outcome.timeout_errors += 1;
                    error!(item = i + 1, %err, "evaluation timed out");
                }
                Err(err) => {
                    outcome.other_errors += 1;
                    error!(item = i + 1, %err, "evaluation failed");
                }
            }
        }

        let approved = outcome.evaluated.iter().filter(|eq| eq.approved).count();
        let avg_score = if outcome.evaluated.is_empty() {
            0.0
        } else {
            outcome.evaluated.iter().map(|eq| eq.evaluation.overall_score).sum::<f64>()
                / outcome.evaluated.len() as f64
        };
        info!(
            evaluated = outcome.evaluated.len(),
            requested = questions.len(),
            approved,
            avg_score,
            circuit_breaker_skips = outcome.circuit_breaker_skips,
            timeout_errors = outcome.timeout_errors,
            other_errors = outcome.other_errors,
            "list evaluation complete"
        );
        outcome
    }

    /// Decide where a question belongs, given the judge's difficulty score
    /// and feedback. Returns the placed level and the reason for any change.
    pub fn determine_difficulty_placement(
        &self,
        current: DifficultyLevel,
        difficulty_score: f64,
        feedback: Option<&str>,
    ) -> (DifficultyLevel, Option<String>) {
        let placement = &self.config.difficulty_placement;
        let feedback_lower = feedback.map(str::to_lowercase).unwrap_or_default();

        if difficulty_score < placement.downgrade_threshold {
            if let Some(easier) = current.one_easier() {
                return (
                    easier,
                    Some(format!(
                        "downgraded from {current} to {easier} \
                         (difficulty_score={difficulty_score:.2} < {})",
                        placement.downgrade_threshold
                    )),
                );
            }
        } else if difficulty_score > placement.upgrade_threshold {
            if let Some(harder) = current.one_harder() {
                return (
                    harder,
                    Some(format!(
                        "upgraded from {current} to {harder} \
                         (difficulty_score={difficulty_score:.2} > {})",
                        placement.upgrade_threshold
                    )),
                );
            }
        } else if !feedback_lower.is_empty() {
            if placement.too_easy_patterns.iter().any(|p| feedback_lower.contains(p)) {
                if let Some(easier) = current.one_easier() {
                    return (
                        easier,
                        Some(format!(
                            "downgraded from {current} to {easier} (feedback indicates too easy)"
                        )),
                    );
                }
            } else if placement.too_hard_patterns.iter().any(|p| feedback_lower.contains(p))
            {
                if let Some(harder) = current.one_harder() {
                    return (
                        harder,
                        Some(format!(
                            "upgraded from {current} to {harder} (feedback indicates too hard)"
                        )),
                    );
                }
            }
        }
        (current, None)
    }

    /// Release provider resources.
    pub async fn cleanup(&self) {
        info!("cleaning up question judge resources");
        for provider in self.providers.values() {
            provider.cleanup().await;
        }
    }
}

fn judge_breaker_name(provider: &str) -> String {
    format!("judge-{provider}")
}
