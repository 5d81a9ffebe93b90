//! Core data model: question types, difficulty levels, generated and
//! evaluated questions, and the validation rules that gate what we accept
//! from an LLM.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;

use crate::prelude::*;

/// The cognitive ability a question measures.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Pattern,
    Logic,
    Spatial,
    Math,
    Verbal,
    Memory,
}

impl QuestionType {
    /// All question types, in canonical order.
    pub const ALL: [QuestionType; 6] = [
        QuestionType::Pattern,
        QuestionType::Logic,
        QuestionType::Spatial,
        QuestionType::Math,
        QuestionType::Verbal,
        QuestionType::Memory,
    ];

    /// The canonical string value, matching the backend API.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Pattern => "pattern",
            QuestionType::Logic => "logic",
            QuestionType::Spatial => "spatial",
            QuestionType::Math => "math",
            QuestionType::Verbal => "verbal",
            QuestionType::Memory => "memory",
        }
    }

    /// Parse a canonical string value.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|qt| qt.as_str() == s)
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The difficulty level a question is targeted (or placed) at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    Easy,
    Medium,
    Hard,
}

impl DifficultyLevel {
    /// All difficulty levels, easiest first.
    pub const ALL: [DifficultyLevel; 3] = [
        DifficultyLevel::Easy,
        DifficultyLevel::Medium,
        DifficultyLevel::Hard,
    ];

    /// The canonical string value, matching the backend API.
    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyLevel::Easy => "easy",
            DifficultyLevel::Medium => "medium",
            DifficultyLevel::Hard => "hard",
        }
    }

    /// Parse a canonical string value.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|dl| dl.as_str() == s)
    }

    /// The next level down, if any. Used for difficulty placement.
    pub fn one_easier(&self) -> Option<DifficultyLevel> {
        match self {
            DifficultyLevel::Easy => None,
            DifficultyLevel::Medium => Some(DifficultyLevel::Easy),
            DifficultyLevel::Hard => Some(DifficultyLevel::Medium),
        }
    }

    /// The next level up, if any. Used for difficulty placement.
    pub fn one_harder(&self) -> Option<DifficultyLevel> {
        match self {
            DifficultyLevel::Easy => Some(DifficultyLevel::Medium),
            DifficultyLevel::Medium => Some(DifficultyLevel::Hard),
            DifficultyLevel::Hard => None,
        }
    }
}

impl fmt::Display for DifficultyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON shape we ask generation models to produce. This is the schema
/// sent with every structured generation call, so field docs double as
/// instructions to the model.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QuestionResponse {
    /// The complete question text.
    pub question_text: String,

    /// The correct answer. Must be one of `answer_options`.
    pub correct_answer: String,

    /// Array of 4-6 answer options, including the correct answer.
    pub answer_options: Vec<String>,

    /// Detailed explanation of why the answer is correct.
    pub explanation: String,

    /// Content to memorize before answering. Required for memory questions
    /// only. The app shows this first, then hides it before the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus: Option<String>,
}

/// The JSON shape we ask judge models to produce.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvaluationResponse {
    /// How clear and unambiguous the question wording is, 0.0-1.0.
    pub clarity_score: f64,

    /// How well the difficulty matches the target level, 0.0-1.0.
    pub difficulty_score: f64,

    /// How valid the question is as a measure of the stated ability, 0.0-1.0.
    pub validity_score: f64,

    /// How well-formed the options and correct answer are, 0.0-1.0.
    pub formatting_score: f64,

    /// How original the question is, 0.0-1.0.
    pub creativity_score: f64,

    /// Brief explanation of the scores and any issues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// A candidate question produced by the generator, before judging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub question_text: String,
    pub question_type: QuestionType,
    pub difficulty_level: DifficultyLevel,
    pub correct_answer: String,
    pub answer_options: Vec<String>,
    pub explanation: Option<String>,

    /// Content shown to the test-taker before the question appears, then
    /// hidden. Required when `question_type` is `memory`.
    pub stimulus: Option<String>,

    /// Optional finer-grained tag within the question type.
    pub sub_type: Option<String>,

    /// Opaque key-value metadata carried through to the store.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,

    /// Provider that generated this question (e.g. "openai").
    pub source_llm: String,

    /// Model that generated this question.
    pub source_model: String,
}

/// Allowed bounds on the number of answer options.
pub const MIN_ANSWER_OPTIONS: usize = 4;
pub const MAX_ANSWER_OPTIONS: usize = 6;

/// Reasons a generated question can be rejected before judging.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("question_text must not be empty")]
    EmptyQuestionText,

    #[error("expected {MIN_ANSWER_OPTIONS}-{MAX_ANSWER_OPTIONS} answer options, got {0}")]
    OptionCount(usize),

    #[error("answer_options contains duplicate option {0:?}")]
    DuplicateOption(String),

    #[error("correct_answer {0:?} does not appear in answer_options")]
    CorrectAnswerMissing(String),

    #[error("memory questions require a non-empty stimulus")]
    MissingStimulus,

    #[error("stimulus must not be embedded in question_text")]
    StimulusEmbedded,
}

impl GeneratedQuestion {
    /// Build a question from a structured LLM response, tagging it with the
    /// generation context. The result is not yet validated.
    pub fn from_response(
        response: QuestionResponse,
        question_type: QuestionType,
        difficulty_level: DifficultyLevel,
        source_llm: &str,
        source_model: &str,
    ) -> Self {
        Self {
            question_text: response.question_text,
            question_type,
            difficulty_level,
            correct_answer: response.correct_answer,
            answer_options: response.answer_options,
            explanation: Some(response.explanation),
            stimulus: response.stimulus,
            sub_type: None,
            metadata: BTreeMap::new(),
            source_llm: source_llm.to_owned(),
            source_model: source_model.to_owned(),
        }
    }

    /// Check the structural invariants every question must satisfy before it
    /// is worth sending to the judge.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.question_text.trim().is_empty() {
            return Err(ValidationError::EmptyQuestionText);
        }
        let count = self.answer_options.len();
        if !(MIN_ANSWER_OPTIONS..=MAX_ANSWER_OPTIONS).contains(&count) {
            return Err(ValidationError::OptionCount(count));
        }
        for (i, option) in self.answer_options.iter().enumerate() {
            if self.answer_options[..i].contains(option) {
                return Err(ValidationError::DuplicateOption(option.clone()));
            }
        }
        if !self.answer_options.contains(&self.correct_answer) {
            return Err(ValidationError::CorrectAnswerMissing(
                self.correct_answer.clone(),
            ));
        }
        if self.question_type == QuestionType::Memory {
            let stimulus = self.stimulus.as_deref().unwrap_or("").trim().to_owned();
            if stimulus.is_empty() {
                return Err(ValidationError::MissingStimulus);
            }
            if self.question_text.contains(&stimulus) {
                return Err(ValidationError::StimulusEmbedded);
            }
        }
        Ok(())
    }
}

/// A judge's rubric scores for one question, with the computed overall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationScore {
    pub clarity_score: f64,
    pub difficulty_score: f64,
    pub validity_score: f64,
    pub formatting_score: f64,
    pub creativity_score: f64,

    /// Weighted sum of clarity, validity, formatting and creativity.
    /// Difficulty is placement-only and never contributes here.
    pub overall_score: f64,

    pub feedback: Option<String>,
}

impl EvaluationScore {
    /// Build from a parsed judge response, clamping every sub-score into
    /// `[0, 1]`. The overall score is filled in by the judge once the
    /// criteria weights are known.
    pub fn from_response(response: EvaluationResponse) -> Self {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        Self {
            clarity_score: clamp(response.clarity_score),
            difficulty_score: clamp(response.difficulty_score),
            validity_score: clamp(response.validity_score),
            formatting_score: clamp(response.formatting_score),
            creativity_score: clamp(response.creativity_score),
            overall_score: 0.0,
            feedback: response.feedback,
        }
    }
}

/// A question together with its evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatedQuestion {
    pub question: GeneratedQuestion,
    pub evaluation: EvaluationScore,

    /// "provider/model" of the judge that produced the evaluation.
    pub judge_model: String,

    /// Whether `overall_score` met the configured minimum.
    pub approved: bool,
}

/// The output of one `generate_batch` call.
#[derive(Debug, Serialize)]
pub struct GenerationBatch {
    pub questions: Vec<GeneratedQuestion>,
    pub question_type: QuestionType,
    pub target_difficulty: DifficultyLevel,

    /// How many questions were requested.
    pub batch_size: usize,

    pub generated_at: chrono::DateTime<chrono::Utc>,

    /// Providers that contributed at least one question.
    pub providers_used: Vec<String>,

    /// `questions.len() / batch_size`, or 0 for an empty request.
    pub success_rate: f64,

    /// Per-provider count of attempts skipped because the circuit was open.
    pub skipped_providers: BTreeMap<String, usize>,

    /// Number of attempts that failed for reasons other than an open circuit.
    pub failures: usize,

    /// Breaker state per provider at batch completion.
    pub circuit_breaker_states: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(options: &[&str], correct: &str) -> GeneratedQuestion {
        GeneratedQuestion {
            question_text: "What comes next in the sequence? 3, 6, 11, 18, 27, ?".into(),
            question_type: QuestionType::Pattern,
            difficulty_level: DifficultyLevel::Easy,
            correct_answer: correct.into(),
            answer_options: options.iter().map(|s| s.to_string()).collect(),
            explanation: Some("Each number increases by consecutive odd numbers.".into()),
            stimulus: None,
            sub_type: None,
            metadata: BTreeMap::new(),
            source_llm: "openai".into(),
            source_model: "gpt-4-turbo-preview".into(),
        }
    }

    #[test]
    fn accepts_four_and_six_options() {
        let q = question(&["36", "38", "40", "42"], "38");
        assert_eq!(q.validate(), Ok(()));
        let q = question(&["36", "38", "40", "42", "44", "46"], "38");
        assert_eq!(q.validate(), Ok(()));
    }

    #[test]
    fn rejects_three_and_seven_options() {
        let q = question(&["36", "38", "40"], "38");
        assert_eq!(q.validate(), Err(ValidationError::OptionCount(3)));
        let q = question(&["1", "2", "3", "4", "5", "6", "7"], "1");
        assert_eq!(q.validate(), Err(ValidationError::OptionCount(7)));
    }

    #[test]
    fn rejects_correct_answer_outside_options() {
        let q = question(&["36", "40", "42", "44"], "38");
        assert_eq!(
            q.validate(),
            Err(ValidationError::CorrectAnswerMissing("38".into()))
        );
    }

    #[test]
    fn rejects_duplicate_options() {
        let q = question(&["36", "38", "38", "42"], "38");
        assert_eq!(q.validate(), Err(ValidationError::DuplicateOption("38".into())));
    }

    #[test]
    fn memory_requires_stimulus() {
        let mut q = question(&["a", "b", "c", "d"], "a");
        q.question_type = QuestionType::Memory;
        assert_eq!(q.validate(), Err(ValidationError::MissingStimulus));

        q.stimulus = Some("maple, oak, dolphin, cherry".into());
        assert_eq!(q.validate(), Ok(()));
    }

    #[test]
    fn memory_stimulus_must_not_leak_into_question() {
        let mut q = question(&["a", "b", "c", "d"], "a");
        q.question_type = QuestionType::Memory;
        q.stimulus = Some("maple, oak, dolphin".into());
        q.question_text = "From the list maple, oak, dolphin, which is a mammal?".into();
        assert_eq!(q.validate(), Err(ValidationError::StimulusEmbedded));
    }

    #[test]
    fn sub_scores_are_clamped() {
        let score = EvaluationScore::from_response(EvaluationResponse {
            clarity_score: 1.2,
            difficulty_score: -0.1,
            validity_score: 0.5,
            formatting_score: 0.9,
            creativity_score: 2.0,
            feedback: None,
        });
        assert_eq!(score.clarity_score, 1.0);
        assert_eq!(score.difficulty_score, 0.0);
        assert_eq!(score.creativity_score, 1.0);
    }

    #[test]
    fn enum_round_trips() {
        for qt in QuestionType::ALL {
            assert_eq!(QuestionType::parse(qt.as_str()), Some(qt));
        }
        for dl in DifficultyLevel::ALL {
            assert_eq!(DifficultyLevel::parse(dl.as_str()), Some(dl));
        }
        assert_eq!(
            serde_json::to_value(QuestionType::Memory).unwrap(),
            json!("memory")
        );
    }

    #[test]
    fn difficulty_placement_neighbors() {
        assert_eq!(DifficultyLevel::Easy.one_easier(), None);
        assert_eq!(DifficultyLevel::Hard.one_harder(), None);
        assert_eq!(
            DifficultyLevel::Medium.one_harder(),
            Some(DifficultyLevel::Hard)
        );
        assert_eq!(
            DifficultyLevel::Medium.one_easier(),
            Some(DifficultyLevel::Easy)
        );
    }
}
