//! Pipeline orchestration: generation, evaluation, deduplication, storage,
//! reporting, in that order. Each stage is timed and wrapped in a span.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;

use crate::dedup::{Deduplicator, DuplicateType};
use crate::errors::{ClassifiedError, ErrorCategory};
use crate::generator::QuestionGenerator;
use crate::judge::QuestionJudge;
use crate::metrics::MetricsTracker;
use crate::models::{DifficultyLevel, GeneratedQuestion, QuestionType};
use crate::observability::{MetricType, Observability, SignalLevel};
use crate::prelude::*;
use crate::prompts::PROMPT_VERSION;
use crate::reporter::{ReportContext, RunReporter};
use crate::storage::QuestionStore;

/// Process exit codes for a run.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const NO_QUESTIONS: i32 = 2;
    pub const PARTIAL_FAILURE: i32 = 3;
    pub const DATABASE_ERROR: i32 = 4;
    pub const UNKNOWN_ERROR: i32 = 5;
    pub const PIPELINE_ERROR: i32 = 6;
}

/// One cell of the requested distribution.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question_type: QuestionType,
    pub difficulty: DifficultyLevel,
    pub count: usize,
}

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub requests: Vec<GenerationRequest>,
    pub distribute: bool,
    pub generation_temperature: f32,
    pub generation_max_tokens: u32,
    pub judge_temperature: f32,
    pub judge_max_tokens: u32,

    /// How many recent questions to load as the dedup corpus.
    pub dedup_corpus_limit: i64,

    /// Give each rejected question one regeneration attempt with the
    /// judge's feedback folded into the prompt.
    pub regenerate_rejected: bool,

    /// POST a "running" record before the first stage.
    pub report_start: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            distribute: true,
            generation_temperature: 0.8,
            generation_max_tokens: 1500,
            judge_temperature: 0.3,
            judge_max_tokens: 500,
            dedup_corpus_limit: 500,
            regenerate_rejected: true,
            report_start: false,
        }
    }
}

/// The assembled pipeline. All shared state (metrics, breakers, costs,
/// observability) is injected by the composition root; nothing here is
/// ambient.
pub struct Pipeline {
    pub generator: QuestionGenerator,
    pub judge: QuestionJudge,
    pub dedup: Deduplicator,
    pub store: Option<QuestionStore>,
    pub reporter: Option<RunReporter>,
    pub metrics: Arc<MetricsTracker>,
    pub observability: Arc<Observability>,
    pub report_context: ReportContext,
}

impl Pipeline {
    /// Run the pipeline to completion and return the process exit code.
    pub async fn run(&self, options: &PipelineOptions) -> i32 {
        self.metrics.start_run();
        let run_span = self.observability.start_span("pipeline_run");

        let requested: usize = options.requests.iter().map(|r| r.count).sum();
        self.observability.record_metric(
            "questions_requested",
            MetricType::Gauge,
            requested as f64,
            &[],
        );
        self.observability
            .record_event("pipeline_started", json!({ "requested": requested }));
        if options.report_start {
            if let Some(reporter) = &self.reporter {
                reporter
                    .report_running(
                        chrono::Utc::now(),
                        requested as u64,
                        &self.report_context,
                    )
                    .await;
            }
        }

        // A panicking stage must still produce an exit code and a run
        // report, so the stages run behind an unwind guard.
        let exit_code = match AssertUnwindSafe(self.run_stages(options)).catch_unwind().await
        {
            Ok(Ok(code)) => code,
            Ok(Err(err)) => {
                self.observability.capture_error(&err, SignalLevel::Fatal, None);
                error!(%err, "pipeline failed");
                err.exit_code
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.observability.capture_error(&message, SignalLevel::Fatal, None);
                error!(message = %message, "pipeline stage panicked");
                exit_codes::UNKNOWN_ERROR
            }
        };
        match exit_code {
            exit_codes::SUCCESS => {
                self.observability
                    .capture_message("generation run completed", SignalLevel::Info);
            }
            exit_codes::PARTIAL_FAILURE => {
                self.observability
                    .capture_message("generation run partially failed", SignalLevel::Warning);
            }
            _ => {}
        }

        self.metrics.end_run();
        self.metrics
            .record_embedding_cache_stats(self.dedup.embeddings().cache_stats());

        let summary = self.metrics.get_summary();
        if let Some(reporter) = &self.reporter {
            reporter.report_run(&summary, exit_code, &self.report_context).await;
        }

        if exit_code == exit_codes::SUCCESS {
            run_span.set_status("ok");
        } else {
            run_span.set_status("error");
        }
        drop(run_span);

        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_owned())
        );
        info!(exit_code, "pipeline finished");
        exit_code
    }

    async fn run_stages(&self, options: &PipelineOptions) -> Result<i32, StageFailure> {
        let requested: usize = options.requests.iter().map(|r| r.count).sum();

        // Stage 1: generation.
        let candidates = self.generation_stage(options).await;
        if candidates.is_empty() {
            warn!("no questions generated at all");
            return Ok(exit_codes::NO_QUESTIONS);
        }

        // Stage 2: evaluation.
        let (mut approved, rejected) = self.evaluation_stage(options, &candidates).await?;

        // Rejected questions get one regeneration attempt each; recovered
        // ones replace their originals in the accounting.
        if options.regenerate_rejected && !rejected.is_empty() {
            approved.extend(self.regeneration_stage(options, &rejected).await);
        }

        // Stage 3: deduplication.
        let survivors = self.deduplication_stage(options, approved).await?;

        // Stage 4: storage.
        let inserted = self.storage_stage(&survivors).await?;

        Ok(if inserted == 0 {
            exit_codes::NO_QUESTIONS
        } else if inserted < requested {
            exit_codes::PARTIAL_FAILURE
        } else {
            exit_codes::SUCCESS
        })
    }

    async fn generation_stage(&self, options: &PipelineOptions) -> Vec<GeneratedQuestion> {
        let _timer = self.metrics.time_stage("generation");
        let _span = self.observability.start_span("generation");

        let mut candidates = Vec::new();
        for request in &options.requests {
            self.metrics.record_generation_request(request.count);
            match self
                .generator
                .generate_batch(
                    request.question_type,
                    request.difficulty,
                    request.count,
                    options.distribute,
                    options.generation_temperature,
                    options.generation_max_tokens,
                )
                .await
            {
                Ok(batch) => {
                    for question in &batch.questions {
                        self.metrics.record_generation_success(
                            &question.source_llm,
                            question.question_type.as_str(),
                            question.difficulty_level.as_str(),
                        );
                        self.metrics.record_api_call(&question.source_llm);
                    }
                    let shortfall =
                        request.count.saturating_sub(batch.questions.len()) as u64;
                    if shortfall > 0 {
                        self.metrics.record_generation_failure(shortfall, None);
                    }
                    candidates.extend(batch.questions);
                }
                Err(err) => {
                    self.metrics
                        .record_generation_failure(request.count as u64, Some(&err.to_string()));
                    self.observability.capture_error(&err, SignalLevel::Error, None);
                    error!(
                        question_type = %request.question_type,
                        difficulty = %request.difficulty,
                        %err,
                        "batch generation failed"
                    );
                }
            }
        }
        self.observability.record_metric(
            "questions_generated_total",
            MetricType::Counter,
            candidates.len() as f64,
            &[],
        );
        debug!(stats = %self.generator.provider_stats(), "provider stats after generation");
        info!(candidates = candidates.len(), "generation stage complete");
        candidates
    }

    #[allow(clippy::type_complexity)]
    async fn evaluation_stage(
        &self,
        options: &PipelineOptions,
        candidates: &[GeneratedQuestion],
    ) -> Result<
        (Vec<crate::models::EvaluatedQuestion>, Vec<crate::models::EvaluatedQuestion>),
        StageFailure,
    > {
        let _timer = self.metrics.time_stage("evaluation");
        let _span = self.observability.start_span("evaluation");

        self.observability.record_metric(
            "evaluations_in_flight",
            MetricType::UpdownCounter,
            candidates.len() as f64,
            &[],
        );
        let outcome = self
            .judge
            .evaluate_questions_list(
                candidates,
                options.judge_temperature,
                options.judge_max_tokens,
            )
            .await;
        self.observability.record_metric(
            "evaluations_in_flight",
            MetricType::UpdownCounter,
            -(candidates.len() as f64),
            &[],
        );

        for evaluated in &outcome.evaluated {
            self.metrics
                .record_evaluation(evaluated.evaluation.overall_score, evaluated.approved);
            let provider = evaluated
                .judge_model
                .split('/')
                .next()
                .unwrap_or("unknown")
                .to_owned();
            self.metrics.record_api_call(&provider);
        }
        if outcome.total_errors() > 0 {
            self.metrics.record_evaluation_failure(
                outcome.total_errors() as u64,
                Some(&format!(
                    "circuit_breaker={}, timeout={}, other={}",
                    outcome.circuit_breaker_skips,
                    outcome.timeout_errors,
                    outcome.other_errors
                )),
            );
        }
        for _ in 0..outcome.timeout_errors {
            self.metrics.record_classified_error(&ClassifiedError::new(
                ErrorCategory::Timeout,
                "judge",
                "evaluation timed out",
            ));
        }

        // Every single candidate failing is not "the models produced bad
        // questions" but the judge infrastructure failing wholesale; that
        // is a pipeline error, distinct from the no-questions path.
        if outcome.evaluated.is_empty() && outcome.total_errors() > 0 {
            return Err(StageFailure::pipeline(format!(
                "evaluation produced no results for {} candidates \
                 (circuit_breaker={}, timeout={}, other={})",
                candidates.len(),
                outcome.circuit_breaker_skips,
                outcome.timeout_errors,
                outcome.other_errors
            )));
        }

        let (approved, rejected): (Vec<_>, Vec<_>) =
            outcome.evaluated.into_iter().partition(|eq| eq.approved);
        info!(
            approved = approved.len(),
            rejected = rejected.len(),
            "evaluation stage complete"
        );
        Ok((approved, rejected))
    }

    /// One regeneration attempt per rejected question, re-judged with the
    /// usual acceptance rules. Recovered questions are counted as
    /// evaluations, not as new generations, so per-run totals stay
    /// consistent with the requested amount.
    async fn regeneration_stage(
        &self,
        options: &PipelineOptions,
        rejected: &[crate::models::EvaluatedQuestion],
    ) -> Vec<crate::models::EvaluatedQuestion> {
        let _span = self.observability.start_span("regeneration");

        let mut recovered = Vec::new();
        for evaluated in rejected {
            let question = match self
                .generator
                .regenerate_question(
                    evaluated,
                    options.generation_temperature,
                    options.generation_max_tokens,
                )
                .await
            {
                Ok(question) => question,
                Err(err) => {
                    debug!(%err, "regeneration attempt failed");
                    continue;
                }
            };
            match self
                .judge
                .evaluate_question(
                    &question,
                    options.judge_temperature,
                    options.judge_max_tokens,
                )
                .await
            {
                Ok(reevaluated) => {
                    self.metrics.record_evaluation(
                        reevaluated.evaluation.overall_score,
                        reevaluated.approved,
                    );
                    if reevaluated.approved {
                        recovered.push(reevaluated);
                    }
                }
                Err(err) => {
                    self.metrics.record_evaluation_failure(1, Some(&err.to_string()));
                }
            }
        }
        info!(
            attempted = rejected.len(),
            recovered = recovered.len(),
            "regeneration complete"
        );
        recovered
    }

    async fn deduplication_stage(
        &self,
        options: &PipelineOptions,
        approved: Vec<crate::models::EvaluatedQuestion>,
    ) -> Result<Vec<crate::models::EvaluatedQuestion>, StageFailure> {
        let _timer = self.metrics.time_stage("deduplication");
        let _span = self.observability.start_span("deduplication");

        let existing = match &self.store {
            Some(store) => store
                .fetch_existing_questions(options.dedup_corpus_limit)
                .await
                .map_err(|err| {
                    StageFailure::database(format!("failed to load dedup corpus: {err}"))
                })?,
            None => Vec::new(),
        };

        self.metrics.record_duplicate_check(approved.len() as u64);
        let questions: Vec<GeneratedQuestion> =
            approved.iter().map(|eq| eq.question.clone()).collect();
        let (unique, duplicates) = self.dedup.filter_duplicates(questions, &existing).await;

        for (_, result) in &duplicates {
            self.metrics
                .record_duplicate(result.duplicate_type == Some(DuplicateType::Exact));
        }

        // Reattach evaluations to the surviving questions by text.
        let survivors: Vec<_> = approved
            .into_iter()
            .filter(|eq| {
                unique.iter().any(|q| q.question_text == eq.question.question_text)
            })
            .collect();
        info!(
            unique = survivors.len(),
            duplicates = duplicates.len(),
            "deduplication stage complete"
        );
        Ok(survivors)
    }

    async fn storage_stage(
        &self,
        survivors: &[crate::models::EvaluatedQuestion],
    ) -> Result<usize, StageFailure> {
        let _timer = self.metrics.time_stage("storage");
        let _span = self.observability.start_span("storage");

        let Some(store) = &self.store else {
            info!(
                would_insert = survivors.len(),
                "no store configured; skipping insertion"
            );
            // Dry runs count survivors as the final output.
            return Ok(survivors.len());
        };

        match store
            .insert_evaluated_questions_batch(survivors, PROMPT_VERSION)
            .await
        {
            Ok(ids) => {
                self.metrics.record_insertion_success(ids.len() as u64);
                info!(inserted = ids.len(), "storage stage complete");
                Ok(ids.len())
            }
            Err(err) => {
                self.metrics
                    .record_insertion_failure(survivors.len() as u64, Some(&err.to_string()));
                Err(StageFailure::database(format!("batch insert failed: {err}")))
            }
        }
    }

    /// Release provider resources and flush observability.
    pub async fn cleanup(&self) {
        self.generator.cleanup().await;
        self.judge.cleanup().await;
        self.observability.flush(std::time::Duration::from_secs(5));
    }
}

/// A stage failure that maps to a specific exit code.
#[derive(Debug)]
struct StageFailure {
    exit_code: i32,
    message: String,
}

impl StageFailure {
    fn database(message: String) -> Self {
        Self { exit_code: exit_codes::DATABASE_ERROR, message }
    }

    fn pipeline(message: String) -> Self {
        Self { exit_code: exit_codes::PIPELINE_ERROR, message }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Best-effort description of a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "pipeline stage panicked".to_owned()
    }
}

/// Expand per-cell counts into the full request distribution.
pub fn build_requests(
    types: &[QuestionType],
    difficulties: &[DifficultyLevel],
    count_per_cell: usize,
) -> Vec<GenerationRequest> {
    let mut requests = Vec::new();
    for &question_type in types {
        for &difficulty in difficulties {
            if count_per_cell > 0 {
                requests.push(GenerationRequest {
                    question_type,
                    difficulty,
                    count: count_per_cell,
                });
            }
        }
    }
    requests
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::config::test_judge_config;
    use crate::costs::{CompletionResult, CostTracker, StructuredResult};
    use crate::dedup::DeduplicatorConfig;
    use crate::embedding::{DEFAULT_EMBEDDING_MODEL, EmbeddingService};
    use crate::errors::ProviderError;
    use crate::judge::QuestionJudge;
    use crate::providers::{CompletionOpts, Provider};
    use crate::retry::RetryMetrics;

    /// What the provider does when it receives a judge prompt. Generation
    /// prompts always succeed with unique valid questions.
    #[derive(Debug, Clone, Copy)]
    enum JudgeBehavior {
        Score,
        Invalid,
        Panic,
    }

    #[derive(Debug)]
    struct ScriptedProvider {
        judge_behavior: JudgeBehavior,
        generation_calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(judge_behavior: JudgeBehavior) -> Arc<Self> {
            Arc::new(Self { judge_behavior, generation_calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "openai"
        }
        fn model(&self) -> &str {
            "mock-model"
        }
        async fn generate_completion_with_usage(
            &self,
            _prompt: &str,
            _opts: &CompletionOpts,
        ) -> Result<CompletionResult, ProviderError> {
            unimplemented!("the pipeline only issues structured calls")
        }
        async fn generate_structured_completion_with_usage(
            &self,
            prompt: &str,
            _schema: &Value,
            _opts: &CompletionOpts,
        ) -> Result<StructuredResult, ProviderError> {
            // Judge prompts demand the rubric structure; generation prompts
            // never mention it.
            if prompt.contains("clarity_score") {
                match self.judge_behavior {
                    JudgeBehavior::Score => Ok(StructuredResult {
                        value: json!({
                            "clarity_score": 1.0,
                            "difficulty_score": 0.5,
                            "validity_score": 1.0,
                            "formatting_score": 1.0,
                            "creativity_score": 1.0,
                            "feedback": "excellent",
                        }),
                        token_usage: None,
                    }),
                    JudgeBehavior::Invalid => Ok(StructuredResult {
                        value: json!({ "unexpected": true }),
                        token_usage: None,
                    }),
                    JudgeBehavior::Panic => panic!("judge call exploded"),
                }
            } else {
                let n = self.generation_calls.fetch_add(1, Ordering::SeqCst);
                Ok(StructuredResult {
                    value: json!({
                        "question_text": format!("What comes next in test sequence {n}?"),
                        "correct_answer": "38",
                        "answer_options": ["36", "38", "40", "42"],
                        "explanation": "consecutive odd increments",
                    }),
                    token_usage: None,
                })
            }
        }
        async fn fetch_available_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![])
        }
        fn static_models(&self) -> Vec<String> {
            vec!["mock-model".into()]
        }
    }

    /// A dry-run pipeline (no store, no reporter) over one scripted
    /// provider.
    fn test_pipeline(judge_behavior: JudgeBehavior) -> Pipeline {
        let provider = ScriptedProvider::new(judge_behavior);
        let providers: HashMap<String, Arc<dyn Provider>> =
            [("openai".to_owned(), provider as Arc<dyn Provider>)]
                .into_iter()
                .collect();
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let costs = Arc::new(CostTracker::new());
        let metrics = Arc::new(MetricsTracker::new(
            Arc::new(RetryMetrics::new()),
            costs.clone(),
            breakers.clone(),
        ));
        let generator =
            QuestionGenerator::new(providers.clone(), breakers.clone(), costs.clone())
                .unwrap();
        let judge = QuestionJudge::new(
            Arc::new(test_judge_config()),
            providers,
            breakers,
            costs,
            10,
            Duration::from_secs(60),
        )
        .unwrap();
        let embeddings = Arc::new(EmbeddingService::new(None, DEFAULT_EMBEDDING_MODEL));
        let dedup = Deduplicator::new(embeddings, DeduplicatorConfig::default()).unwrap();
        Pipeline {
            generator,
            judge,
            dedup,
            store: None,
            reporter: None,
            metrics,
            observability: Arc::new(Observability::new()),
            report_context: ReportContext::default(),
        }
    }

    fn test_options(count: usize) -> PipelineOptions {
        PipelineOptions {
            requests: vec![GenerationRequest {
                question_type: QuestionType::Pattern,
                difficulty: DifficultyLevel::Easy,
                count,
            }],
            distribute: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_run_exits_success() {
        let pipeline = test_pipeline(JudgeBehavior::Score);
        let exit_code = pipeline.run(&test_options(2)).await;
        assert_eq!(exit_code, exit_codes::SUCCESS);

        let summary = pipeline.metrics.get_summary();
        assert_eq!(summary["generation"]["requested"], 2);
        assert_eq!(summary["generation"]["generated"], 2);
        assert_eq!(summary["evaluation"]["evaluated"], 2);
        assert_eq!(summary["evaluation"]["approved"], 2);
        assert_eq!(summary["deduplication"]["duplicates_found"], 0);
    }

    #[tokio::test]
    async fn wholesale_evaluation_failure_exits_pipeline_error() {
        // Generation succeeds but every judge response is unparseable, so
        // the evaluation stage completes with zero results.
        let pipeline = test_pipeline(JudgeBehavior::Invalid);
        let exit_code = pipeline.run(&test_options(2)).await;
        assert_eq!(exit_code, exit_codes::PIPELINE_ERROR);

        let summary = pipeline.metrics.get_summary();
        assert_eq!(summary["generation"]["generated"], 2);
        assert_eq!(summary["evaluation"]["evaluated"], 0);
        assert_eq!(summary["evaluation"]["failed"], 2);
    }

    #[tokio::test]
    async fn panicking_stage_exits_unknown_error() {
        let pipeline = test_pipeline(JudgeBehavior::Panic);
        let exit_code = pipeline.run(&test_options(1)).await;
        assert_eq!(exit_code, exit_codes::UNKNOWN_ERROR);
        // The run still closed out: end_run stamped the summary.
        let summary = pipeline.metrics.get_summary();
        assert!(summary["execution"]["end_time"].is_string());
    }

    #[test]
    fn build_requests_covers_the_grid() {
        let requests = build_requests(
            &QuestionType::ALL,
            &DifficultyLevel::ALL,
            2,
        );
        assert_eq!(requests.len(), 18);
        assert!(requests.iter().all(|r| r.count == 2));
        let memory_hard = requests.iter().any(|r| {
            r.question_type == QuestionType::Memory
                && r.difficulty == DifficultyLevel::Hard
        });
        assert!(memory_hard);
    }

    #[test]
    fn zero_count_produces_no_requests() {
        assert!(build_requests(&QuestionType::ALL, &DifficultyLevel::ALL, 0).is_empty());
    }
}
