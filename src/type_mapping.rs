//! Canonical enum normalisation for reporter breakdowns.
//!
//! Metrics keyed by question type or difficulty may carry legacy enum
//! values from older pipelines. The reporter normalises them to the
//! canonical backend values; unrecognised keys are preserved (not dropped)
//! so they surface downstream instead of silently disappearing.

use std::collections::BTreeMap;

use crate::models::{DifficultyLevel, QuestionType};

/// Map a question-type string (legacy or canonical) to the canonical value.
pub fn normalize_question_type(question_type: &str) -> Option<&'static str> {
    match question_type {
        "pattern_recognition" => Some(QuestionType::Pattern.as_str()),
        "logical_reasoning" => Some(QuestionType::Logic.as_str()),
        "spatial_reasoning" => Some(QuestionType::Spatial.as_str()),
        "mathematical" => Some(QuestionType::Math.as_str()),
        "verbal_reasoning" => Some(QuestionType::Verbal.as_str()),
        other => QuestionType::parse(other).map(|qt| qt.as_str()),
    }
}

/// Map a difficulty string to the canonical value. There are no legacy
/// difficulty aliases; the input must already be canonical.
pub fn normalize_difficulty(difficulty: &str) -> Option<&'static str> {
    DifficultyLevel::parse(difficulty).map(|dl| dl.as_str())
}

/// Normalise a type-keyed count map, summing counts that collapse onto the
/// same canonical key and preserving unknown keys as-is.
pub fn normalize_type_metrics(metrics: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    normalize_metrics(metrics, normalize_question_type)
}

/// Normalise a difficulty-keyed count map.
pub fn normalize_difficulty_metrics(
    metrics: &BTreeMap<String, u64>,
) -> BTreeMap<String, u64> {
    normalize_metrics(metrics, normalize_difficulty)
}

fn normalize_metrics(
    metrics: &BTreeMap<String, u64>,
    normalize: fn(&str) -> Option<&'static str>,
) -> BTreeMap<String, u64> {
    let mut normalized = BTreeMap::new();
    for (key, count) in metrics {
        let canonical = normalize(key).map(str::to_owned).unwrap_or_else(|| key.clone());
        *normalized.entry(canonical).or_insert(0) += count;
    }
    normalized
}
