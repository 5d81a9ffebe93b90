//! Run metrics for the generation pipeline.
//!
//! One tracker instance lives for the duration of a run. Every update goes
//! through a single mutex; `get_summary` returns a deep snapshot that the
//! reporter serializes verbatim.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::costs::CostTracker;
use crate::embedding::CacheStats;
use crate::errors::ClassifiedError;
use crate::prelude::*;
use crate::retry::RetryMetrics;

/// Pipeline stages that are individually timed.
pub const STAGES: [&str; 4] = ["generation", "evaluation", "deduplication", "storage"];

/// How many recent errors each stage keeps for the summary.
const ERROR_BUFFER_CAP: usize = 20;

#[derive(Debug, Default)]
struct MetricsInner {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,

    // Generation
    questions_requested: u64,
    questions_generated: u64,
    generation_failures: u64,
    questions_by_provider: BTreeMap<String, u64>,
    questions_by_type: BTreeMap<String, u64>,
    questions_by_difficulty: BTreeMap<String, u64>,
    generation_errors: Vec<Value>,

    // Evaluation
    questions_evaluated: u64,
    questions_approved: u64,
    questions_rejected: u64,
    evaluation_failures: u64,
    evaluation_scores: Vec<f64>,
    evaluation_errors: Vec<Value>,

    // Deduplication
    questions_checked_for_duplicates: u64,
    duplicates_found: u64,
    exact_duplicates: u64,
    semantic_duplicates: u64,

    // Database
    questions_inserted: u64,
    insertion_failures: u64,
    insertion_errors: Vec<Value>,

    // API calls
    api_calls_by_provider: BTreeMap<String, u64>,
    total_api_calls: u64,

    // Error classification
    errors_by_category: BTreeMap<String, u64>,
    errors_by_severity: BTreeMap<String, u64>,
    critical_error_details: Vec<Value>,

    // Stage timing
    stage_durations: BTreeMap<String, f64>,

    // Embedding cache
    embedding_cache: Option<CacheStats>,
}

/// Thread-safe metrics for one pipeline run, with handles to the shared
/// retry, cost and breaker state so the summary covers everything.
#[derive(Debug)]
pub struct MetricsTracker {
    inner: Mutex<MetricsInner>,
    retry: Arc<RetryMetrics>,
    costs: Arc<CostTracker>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl MetricsTracker {
    pub fn new(
        retry: Arc<RetryMetrics>,
        costs: Arc<CostTracker>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let mut inner = MetricsInner::default();
        for stage in STAGES {
            inner.stage_durations.insert(stage.to_owned(), 0.0);
        }
        Self { inner: Mutex::new(inner), retry, costs, breakers }
    }

    pub fn start_run(&self) {
        self.lock().start_time = Some(Utc::now());
        info!("pipeline run started");
    }

    pub fn end_run(&self) {
        self.lock().end_time = Some(Utc::now());
        info!("pipeline run completed");
    }

    /// Time a pipeline stage with a scoped guard; the duration is recorded
    /// when the guard drops, on every exit path.
    pub fn time_stage(&self, stage: &'static str) -> StageTimer<'_> {
        if !STAGES.contains(&stage) {
            warn!(stage, "timing unknown stage");
        }
        debug!(stage, "stage started");
        StageTimer { tracker: self, stage, started: Instant::now() }
    }

    fn record_stage_duration(&self, stage: &str, seconds: f64) {
        let mut inner = self.lock();
        *inner.stage_durations.entry(stage.to_owned()).or_insert(0.0) += seconds;
        debug!(stage, seconds, "stage completed");
    }

    // Generation

    pub fn record_generation_request(&self, count: usize) {
        self.lock().questions_requested += count as u64;
    }

    pub fn record_generation_success(&self, provider: &str, question_type: &str, difficulty: &str) {
        let mut inner = self.lock();
        inner.questions_generated += 1;
        *inner.questions_by_provider.entry(provider.to_owned()).or_insert(0) += 1;
        *inner.questions_by_type.entry(question_type.to_owned()).or_insert(0) += 1;
        *inner.questions_by_difficulty.entry(difficulty.to_owned()).or_insert(0) += 1;
    }

    pub fn record_generation_failure(&self, count: u64, detail: Option<&str>) {
        let mut inner = self.lock();
        inner.generation_failures += count;
        if let Some(detail) = detail {
            push_bounded(&mut inner.generation_errors, json!({ "error": detail }));
        }
    }

    // Evaluation

    pub fn record_evaluation(&self, overall_score: f64, approved: bool) {
        let mut inner = self.lock();
        inner.questions_evaluated += 1;
        inner.evaluation_scores.push(overall_score);
        if approved {
            inner.questions_approved += 1;
        } else {
            inner.questions_rejected += 1;
        }
    }

    pub fn record_evaluation_failure(&self, count: u64, detail: Option<&str>) {
        let mut inner = self.lock();
        inner.evaluation_failures += count;
        if let Some(detail) = detail {
            push_bounded(&mut inner.evaluation_errors, json!({ "error": detail }));
        }
    }

    // Deduplication

    pub fn record_duplicate_check(&self, checked: u64) {
        self.lock().questions_checked_for_duplicates += checked;
    }

    pub fn record_duplicate(&self, exact: bool) {
        let mut inner = self.lock();
        inner.duplicates_found += 1;
        if exact {
            inner.exact_duplicates += 1;
        } else {
            inner.semantic_duplicates += 1;
        }
    }

    // Database

    pub fn record_insertion_success(&self, count: u64) {
        self.lock().questions_inserted += count;
    }

    pub fn record_insertion_failure(&self, count: u64, detail: Option<&str>) {
        let mut inner = self.lock();
        inner.insertion_failures += count;
        if let Some(detail) = detail {
            push_bounded(&mut inner.insertion_errors, json!({ "error": detail }));
        }
    }

    // API

    pub fn record_api_call(&self, provider: &str) {
        let mut inner = self.lock();
        inner.total_api_calls += 1;
        *inner.api_calls_by_provider.entry(provider.to_owned()).or_insert(0) += 1;
    }

    // Error classification

    pub fn record_classified_error(&self, error: &ClassifiedError) {
        let mut inner = self.lock();
        *inner
            .errors_by_category
            .entry(error.category.as_str().to_owned())
            .or_insert(0) += 1;
        *inner
            .errors_by_severity
            .entry(error.severity.as_str().to_owned())
            .or_insert(0) += 1;
        if error.severity == crate::errors::ErrorSeverity::Critical {
            push_bounded(
                &mut inner.critical_error_details,
                json!({
                    "category": error.category.as_str(),
                    "provider": error.provider,
                    "message": error.message,
                }),
            );
        }
    }

    // Embedding cache

    pub fn record_embedding_cache_stats(&self, stats: CacheStats) {
        self.lock().embedding_cache = Some(stats);
    }

    /// Deep snapshot of everything, shaped for the run reporter.
    pub fn get_summary(&self) -> Value {
        let inner = self.lock();

        let duration_seconds = match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };

        let generation_success_rate = rate(inner.questions_generated, inner.questions_requested);
        // The denominator here is completed evaluations only; items dropped
        // during evaluation do not count against the approval rate.
        let approval_rate = rate(inner.questions_approved, inner.questions_evaluated);
        let duplicate_rate =
            rate(inner.duplicates_found, inner.questions_checked_for_duplicates);
        let overall_success_rate = rate(inner.questions_inserted, inner.questions_requested);

        let (avg_score, min_score, max_score) = if inner.evaluation_scores.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = inner.evaluation_scores.iter().sum();
            let min = inner.evaluation_scores.iter().cloned().fold(f64::INFINITY, f64::min);
            let max =
                inner.evaluation_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (Some(sum / inner.evaluation_scores.len() as f64), Some(min), Some(max))
        };

        let total_errors = inner.generation_failures
            + inner.evaluation_failures
            + inner.insertion_failures;

        json!({
            "execution": {
                "start_time": inner.start_time.map(|t| t.to_rfc3339()),
                "end_time": inner.end_time.map(|t| t.to_rfc3339()),
                "duration_seconds": duration_seconds,
            },
            "generation": {
                "requested": inner.questions_requested,
                "generated": inner.questions_generated,
                "failed": inner.generation_failures,
                "success_rate": generation_success_rate,
                "by_provider": &inner.questions_by_provider,
                "by_type": &inner.questions_by_type,
                "by_difficulty": &inner.questions_by_difficulty,
                "recent_errors": &inner.generation_errors,
            },
            "evaluation": {
                "evaluated": inner.questions_evaluated,
                "approved": inner.questions_approved,
                "rejected": inner.questions_rejected,
                "failed": inner.evaluation_failures,
                "approval_rate": approval_rate,
                "average_score": avg_score,
                "min_score": min_score,
                "max_score": max_score,
                "recent_errors": &inner.evaluation_errors,
            },
            "deduplication": {
                "checked": inner.questions_checked_for_duplicates,
                "duplicates_found": inner.duplicates_found,
                "exact_duplicates": inner.exact_duplicates,
                "semantic_duplicates": inner.semantic_duplicates,
                "duplicate_rate": duplicate_rate,
            },
            "database": {
                "inserted": inner.questions_inserted,
                "failed": inner.insertion_failures,
                "recent_errors": &inner.insertion_errors,
            },
            "api": {
                "total_calls": inner.total_api_calls,
                "by_provider": &inner.api_calls_by_provider,
            },
            "cost": self.costs.summary(),
            "error_classification": {
                "by_category": &inner.errors_by_category,
                "by_severity": &inner.errors_by_severity,
                "critical_errors": inner.critical_error_details.len(),
                "critical_error_details": &inner.critical_error_details,
            },
            "retry": self.retry.summary(),
            "circuit_breaker": self.breakers.all_stats(),
            "stage_durations": &inner.stage_durations,
            "embedding_cache": inner.embedding_cache.map(|stats| json!({
                "hits": stats.hits,
                "misses": stats.misses,
                "size": stats.size,
                "hit_rate": stats.hit_rate(),
            })),
            "overall": {
                "questions_requested": inner.questions_requested,
                "questions_final_output": inner.questions_inserted,
                "overall_success_rate": overall_success_rate,
                "total_errors": total_errors,
            },
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics lock poisoned")
    }
}

/// Scoped stage timer; records on drop.
#[must_use = "the stage is timed until this guard drops"]
pub struct StageTimer<'a> {
    tracker: &'a MetricsTracker,
    stage: &'static str,
    started: Instant,
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.tracker
            .record_stage_duration(self.stage, self.started.elapsed().as_secs_f64());
    }
}

fn rate(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator > 0 {
        Some(numerator as f64 / denominator as f64)
    } else {
        None
    }
}

fn push_bounded(buffer: &mut Vec<Value>, value: Value) {
    if buffer.len() >= ERROR_BUFFER_CAP {
        buffer.remove(0);
    }
    buffer.push(value);
}
