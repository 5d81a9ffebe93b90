//! Judge configuration loaded from YAML.
//!
//! The judge config maps question types to judge models, carries the
//! acceptance criteria weights, and the difficulty-placement thresholds.

use std::collections::HashMap;

use crate::models::{EvaluationScore, QuestionType};
use crate::prelude::*;

/// Tolerance when checking that criteria weights sum to 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

const VALID_PROVIDERS: [&str; 4] = ["openai", "anthropic", "google", "xai"];

/// Configuration loading and validation failures. These are fatal: the
/// pipeline exits with the configuration error code.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One judge model assignment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeModel {
    pub model: String,
    pub provider: String,

    /// Why this model was chosen for the question type.
    pub rationale: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Provider to fall back to when the primary is unavailable.
    #[serde(default)]
    pub fallback: Option<String>,

    /// Model to use on the fallback provider. Requires `fallback`.
    #[serde(default)]
    pub fallback_model: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Weights for the ACCEPTANCE criteria. Difficulty is deliberately absent:
/// it determines placement, not acceptance. A high-quality question that is
/// "too easy for hard" is accepted and re-placed at the right level.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationCriteria {
    pub clarity: f64,
    pub validity: f64,
    pub formatting: f64,
    pub creativity: f64,
}

impl EvaluationCriteria {
    fn weight_sum(&self) -> f64 {
        self.clarity + self.validity + self.formatting + self.creativity
    }

    /// Weighted overall score of an evaluation, clamped into `[0, 1]` to
    /// absorb floating-point drift.
    pub fn overall(&self, score: &EvaluationScore) -> f64 {
        let overall = score.clarity_score * self.clarity
            + score.validity_score * self.validity
            + score.formatting_score * self.formatting
            + score.creativity_score * self.creativity;
        overall.clamp(0.0, 1.0)
    }
}

/// Thresholds and feedback phrases steering difficulty placement.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DifficultyPlacement {
    pub downgrade_threshold: f64,
    pub upgrade_threshold: f64,
    pub too_easy_patterns: Vec<String>,
    pub too_hard_patterns: Vec<String>,
}

impl Default for DifficultyPlacement {
    fn default() -> Self {
        Self {
            downgrade_threshold: 0.4,
            upgrade_threshold: 0.8,
            too_easy_patterns: vec!["too easy".into(), "straightforward".into()],
            too_hard_patterns: vec!["too hard".into(), "too difficult".into()],
        }
    }
}

/// Complete judge configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    pub version: String,
    pub min_judge_score: f64,
    pub evaluation_criteria: EvaluationCriteria,
    #[serde(default)]
    pub difficulty_placement: DifficultyPlacement,
    pub default_judge: JudgeModel,
    pub judges: HashMap<String, JudgeModel>,
}

impl JudgeConfig {
    /// Load and validate a judge configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_owned()));
        }
        info!(path = %path.display(), "loading judge configuration");
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        let config: JudgeConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        info!(version = %config.version, "judge configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_judge_score) {
            return Err(ConfigError::Invalid(format!(
                "min_judge_score must be in [0, 1], got {}",
                self.min_judge_score
            )));
        }

        let sum = self.evaluation_criteria.weight_sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "evaluation criteria weights must sum to 1.0 (±{WEIGHT_SUM_TOLERANCE}), got {sum}"
            )));
        }

        let missing: Vec<&str> = QuestionType::ALL
            .iter()
            .map(|qt| qt.as_str())
            .filter(|qt| !self.judges.contains_key(*qt))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "missing required question types in judge config: {missing:?}"
            )));
        }

        for (name, judge) in
            self.judges.iter().chain(std::iter::once((&"default".to_owned(), &self.default_judge)))
        {
            if !VALID_PROVIDERS.contains(&judge.provider.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "judge '{name}' has unknown provider '{}'",
                    judge.provider
                )));
            }
            if let Some(fallback) = &judge.fallback {
                if !VALID_PROVIDERS.contains(&fallback.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "judge '{name}' has unknown fallback provider '{fallback}'"
                    )));
                }
            }
            if judge.fallback_model.is_some() && judge.fallback.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "judge '{name}': fallback_model cannot be set without a fallback provider"
                )));
            }
        }

        let placement = &self.difficulty_placement;
        if placement.downgrade_threshold > placement.upgrade_threshold {
            return Err(ConfigError::Invalid(format!(
                "downgrade_threshold {} must not exceed upgrade_threshold {}",
                placement.downgrade_threshold, placement.upgrade_threshold
            )));
        }
        Ok(())
    }

    /// The judge model for a question type, falling back to the default
    /// judge when the type has no enabled assignment.
    pub fn judge_for(&self, question_type: QuestionType) -> &JudgeModel {
        match self.judges.get(question_type.as_str()) {
            Some(judge) if judge.enabled => judge,
            _ => &self.default_judge,
        }
    }

    /// Summary for logs and diagnostics.
    pub fn stats(&self) -> Value {
        json!({
            "config_version": &self.version,
            "min_judge_score": self.min_judge_score,
            "evaluation_criteria": &self.evaluation_criteria,
            "difficulty_placement": {
                "downgrade_threshold": self.difficulty_placement.downgrade_threshold,
                "upgrade_threshold": self.difficulty_placement.upgrade_threshold,
            },
            "judges": self.judges.iter().map(|(qt, judge)| {
                (qt.clone(), json!({
                    "model": judge.model,
                    "provider": judge.provider,
                    "enabled": judge.enabled,
                }))
            }).collect::<serde_json::Map<String, Value>>(),
        })
    }
}

/// Test config where every judge points at `primary` with a configured
/// fallback provider and model, for exercising the fallback chain.
#[cfg(test)]
pub(crate) fn test_judge_config_with_fallback(
    primary: &str,
    fallback: &str,
    fallback_model: &str,
) -> JudgeConfig {
    let mut config = test_judge_config();
    config.default_judge.provider = primary.to_owned();
    for judge in config.judges.values_mut() {
        judge.provider = primary.to_owned();
        judge.fallback = Some(fallback.to_owned());
        judge.fallback_model = Some(fallback_model.to_owned());
    }
    config
}

#[cfg(test)]
pub(crate) fn test_judge_config() -> JudgeConfig {
    let judge = |provider: &str, model: &str| JudgeModel {
        model: model.into(),
        provider: provider.into(),
        rationale: "test".into(),
        enabled: true,
        fallback: None,
        fallback_model: None,
    };
    let mut judges = HashMap::new();
    for qt in QuestionType::ALL {
        judges.insert(qt.as_str().to_owned(), judge("openai", "gpt-4-turbo-preview"));
    }
    JudgeConfig {
        version: "test-1".into(),
        min_judge_score: 0.7,
        evaluation_criteria: EvaluationCriteria {
            clarity: 0.3,
            validity: 0.3,
            formatting: 0.2,
            creativity: 0.2,
        },
        difficulty_placement: DifficultyPlacement::default(),
        default_judge: judge("openai", "gpt-4-turbo-preview"),
        judges,
    }
}
