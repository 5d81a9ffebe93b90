//! The `run` subcommand: execute one bounded generation run.
//!
//! This is the composition root. Every shared structure (retry metrics,
//! cost tracker, breaker registry, metrics tracker, observability façade)
//! is constructed here and passed down explicitly.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::config::JudgeConfig;
use crate::costs::CostTracker;
use crate::dedup::{Deduplicator, DeduplicatorConfig};
use crate::embedding::{DEFAULT_EMBEDDING_MODEL, EmbeddingService};
use crate::generator::QuestionGenerator;
use crate::judge::QuestionJudge;
use crate::metrics::MetricsTracker;
use crate::models::{DifficultyLevel, QuestionType};
use crate::observability::{Observability, ObservabilitySettings};
use crate::pipeline::{Pipeline, PipelineOptions, build_requests, exit_codes};
use crate::prelude::*;
use crate::prompts::PROMPT_VERSION;
use crate::providers::{ProviderSettings, build_providers};
use crate::reporter::{ReportContext, RunReporter};
use crate::retry::RetryMetrics;
use crate::storage::{QuestionStore, StorageConfig};

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Judge configuration file, in YAML format.
    #[clap(long = "judge-config", default_value = "config/judges.yaml")]
    pub judge_config_path: PathBuf,

    /// Observability configuration file, in YAML format.
    #[clap(long = "observability-config")]
    pub observability_config_path: Option<PathBuf>,

    /// Questions to generate per (type, difficulty) cell.
    #[clap(short = 'n', long = "count", default_value = "2")]
    pub count_per_cell: usize,

    /// Restrict generation to these question types (comma-separated).
    /// Defaults to all six.
    #[clap(long, value_delimiter = ',')]
    pub types: Vec<String>,

    /// Restrict generation to these difficulty levels (comma-separated).
    /// Defaults to all three.
    #[clap(long, value_delimiter = ',')]
    pub difficulties: Vec<String>,

    /// Use a single provider per batch instead of distributing across all
    /// available providers.
    #[clap(long)]
    pub no_distribute: bool,

    /// Sampling temperature for generation.
    #[clap(long, default_value = "0.8")]
    pub temperature: f32,

    /// Token limit for generation responses.
    #[clap(long, default_value = "1500")]
    pub max_tokens: u32,

    /// Maximum concurrent judge evaluations.
    #[clap(long, default_value_t = crate::judge::DEFAULT_MAX_CONCURRENT_EVALUATIONS)]
    pub max_concurrent_evaluations: usize,

    /// Per-call judge timeout, in seconds.
    #[clap(long, default_value_t = crate::judge::DEFAULT_EVALUATION_TIMEOUT_SECS)]
    pub evaluation_timeout: u64,

    /// Cosine similarity threshold for semantic duplicates.
    #[clap(long, default_value = "0.85")]
    pub similarity_threshold: f64,

    /// Skip the regeneration attempt for rejected questions.
    #[clap(long)]
    pub no_regenerate: bool,

    /// Skip storage and reporting; print the summary only.
    #[clap(long)]
    pub dry_run: bool,

    /// Environment tag for the run report (production, staging, ...).
    #[clap(long, env = "GENERATION_ENVIRONMENT")]
    pub environment: Option<String>,

    /// What triggered this run.
    #[clap(long, default_value = "scheduler")]
    pub triggered_by: String,

    /// Also report a "running" record when the run starts.
    #[clap(long)]
    pub report_start: bool,

    /// Override the default OpenAI model.
    #[clap(long)]
    pub openai_model: Option<String>,

    /// Override the default Anthropic model.
    #[clap(long)]
    pub anthropic_model: Option<String>,

    /// Override the default Google model.
    #[clap(long)]
    pub google_model: Option<String>,

    /// Override the default xAI model.
    #[clap(long)]
    pub xai_model: Option<String>,
}

/// Run the `run` subcommand, returning the process exit code.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(opts: &RunOpts) -> i32 {
    // Configuration first: anything wrong here is exit code 1.
    let judge_config = match JudgeConfig::load(&opts.judge_config_path) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(%err, "failed to load judge configuration");
            return exit_codes::CONFIG_ERROR;
        }
    };
    let observability_settings =
        match ObservabilitySettings::load(opts.observability_config_path.as_deref()) {
            Ok(settings) => settings,
            Err(err) => {
                error!(%err, "failed to load observability configuration");
                return exit_codes::CONFIG_ERROR;
            }
        };
    let (types, difficulties) = match parse_selection(opts) {
        Ok(selection) => selection,
        Err(err) => {
            error!(%err, "invalid type/difficulty selection");
            return exit_codes::CONFIG_ERROR;
        }
    };

    // Shared state, constructed once and passed down explicitly.
    let observability = Arc::new(Observability::init(observability_settings));
    observability.set_user(json!({ "id": "question-forge", "kind": "service" }));
    observability.set_tag("triggered_by", &opts.triggered_by);
    observability.set_context(
        "run",
        json!({
            "prompt_version": PROMPT_VERSION,
            "judge_config_version": &judge_config.version,
        }),
    );
    let retry_metrics = Arc::new(RetryMetrics::new());
    let costs = Arc::new(CostTracker::new());
    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
    let metrics =
        Arc::new(MetricsTracker::new(retry_metrics.clone(), costs.clone(), breakers.clone()));

    let provider_settings = ProviderSettings {
        openai_model: opts.openai_model.clone(),
        anthropic_model: opts.anthropic_model.clone(),
        google_model: opts.google_model.clone(),
        xai_model: opts.xai_model.clone(),
        ..ProviderSettings::from_env()
    };
    let providers = match build_providers(&provider_settings, retry_metrics.clone()) {
        Ok(providers) => providers,
        Err(err) => {
            error!(%err, "provider configuration failed");
            return exit_codes::CONFIG_ERROR;
        }
    };

    let generator =
        match QuestionGenerator::new(providers.clone(), breakers.clone(), costs.clone()) {
            Ok(generator) => generator,
            Err(err) => {
                error!(%err, "generator construction failed");
                return exit_codes::CONFIG_ERROR;
            }
        };
    let judge = match QuestionJudge::new(
        judge_config.clone(),
        providers,
        breakers.clone(),
        costs.clone(),
        opts.max_concurrent_evaluations,
        Duration::from_secs(opts.evaluation_timeout),
    ) {
        Ok(judge) => judge,
        Err(err) => {
            error!(%err, "judge construction failed");
            return exit_codes::CONFIG_ERROR;
        }
    };

    let embeddings = Arc::new(EmbeddingService::new(
        provider_settings.openai_api_key.as_deref(),
        DEFAULT_EMBEDDING_MODEL,
    ));
    let dedup = match Deduplicator::new(
        embeddings.clone(),
        DeduplicatorConfig {
            similarity_threshold: opts.similarity_threshold,
            ..Default::default()
        },
    ) {
        Ok(dedup) => dedup,
        Err(err) => {
            error!(%err, "deduplicator construction failed");
            return exit_codes::CONFIG_ERROR;
        }
    };

    let store = if opts.dry_run {
        None
    } else {
        match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => {
                match QuestionStore::connect(&StorageConfig::new(&url), embeddings.clone())
                    .await
                {
                    Ok(store) => Some(store),
                    Err(err) => {
                        error!(%err, "database connection failed");
                        return exit_codes::DATABASE_ERROR;
                    }
                }
            }
            _ => {
                warn!("DATABASE_URL not set; questions will not be persisted");
                None
            }
        }
    };

    let reporter = if opts.dry_run {
        None
    } else {
        match (std::env::var("BACKEND_API_URL"), std::env::var("SERVICE_KEY")) {
            (Ok(url), Ok(key)) if !url.is_empty() && !key.is_empty() => {
                Some(RunReporter::new(&url, &key))
            }
            _ => {
                warn!("BACKEND_API_URL/SERVICE_KEY not set; run will not be reported");
                None
            }
        }
    };

    let report_context = ReportContext {
        environment: opts.environment.clone(),
        triggered_by: Some(opts.triggered_by.clone()),
        prompt_version: Some(PROMPT_VERSION.to_owned()),
        arbiter_config_version: Some(judge_config.version.clone()),
        min_arbiter_score_threshold: Some(judge_config.min_judge_score),
    };

    let pipeline = Pipeline {
        generator,
        judge,
        dedup,
        store,
        reporter,
        metrics,
        observability: observability.clone(),
        report_context,
    };

    let options = PipelineOptions {
        requests: build_requests(&types, &difficulties, opts.count_per_cell),
        distribute: !opts.no_distribute,
        generation_temperature: opts.temperature,
        generation_max_tokens: opts.max_tokens,
        regenerate_rejected: !opts.no_regenerate,
        report_start: opts.report_start,
        ..Default::default()
    };

    let exit_code = pipeline.run(&options).await;
    info!(total_cost_usd = costs.total_cost(), "run API spend");
    pipeline.cleanup().await;
    observability.shutdown();
    exit_code
}

fn parse_selection(opts: &RunOpts) -> Result<(Vec<QuestionType>, Vec<DifficultyLevel>)> {
    let types = if opts.types.is_empty() {
        QuestionType::ALL.to_vec()
    } else {
        opts.types
            .iter()
            .map(|raw| {
                QuestionType::parse(raw)
                    .ok_or_else(|| anyhow!("unknown question type: {raw:?}"))
            })
            .collect::<Result<Vec<_>>>()?
    };
    let difficulties = if opts.difficulties.is_empty() {
        DifficultyLevel::ALL.to_vec()
    } else {
        opts.difficulties
            .iter()
            .map(|raw| {
                DifficultyLevel::parse(raw)
                    .ok_or_else(|| anyhow!("unknown difficulty level: {raw:?}"))
            })
            .collect::<Result<Vec<_>>>()?
    };
    Ok((types, difficulties))
}
