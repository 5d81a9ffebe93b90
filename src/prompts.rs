//! Prompt assembly for generation, judging and regeneration.
//!
//! Every prompt is composed from fixed fragments: a system preamble, a
//! type-specific block with a worked example, a difficulty calibration
//! block, and the JSON response contract. Building is pure and
//! deterministic; identical inputs always produce identical prompts.

use std::fmt::Write as _;

use crate::models::{DifficultyLevel, QuestionType};

/// Version tag recorded on every persisted question. Bump whenever any
/// fragment below changes in a way that could shift generation quality.
pub const PROMPT_VERSION: &str = "2.4.1";

/// Sub-scores below this value are called out explicitly in regeneration
/// prompts.
pub const WEAK_SCORE_THRESHOLD: f64 = 0.7;

const SYSTEM_PROMPT: &str = "\
You are an expert psychometrician and IQ test designer with deep knowledge of cognitive assessment.
Your task is to generate high-quality, scientifically valid IQ test questions.

CONTEXT: These questions are for a mobile IQ tracking app where users take tests every few months
to monitor cognitive performance over time. Questions must be:
- Suitable for repeated testing (highly original, not memorizable)
- Optimized for mobile display (concise, clear formatting)
- Aligned with established IQ testing principles (Wechsler, Stanford-Binet, Raven's Progressive Matrices)

KEY REQUIREMENTS:
- Clear, unambiguous wording with a single objectively correct answer
- Original and creative (avoid well-known puzzles like Monty Hall, Tower of Hanoi, common riddles)
- Appropriate difficulty calibration for the specified level
- Culturally neutral and globally accessible (no region-specific knowledge or idioms)
- Concise question text, ideally under 300 characters
- Plausible distractors that test understanding, not guessing
- EXACTLY ONE correct answer in answer_options; all other options definitively wrong
- The correct_answer must appear exactly once in answer_options

ANTI-PATTERNS TO AVOID:
- Ambiguous wording or multiple valid interpretations
- Questions requiring specialized knowledge
- Trick questions that test attention rather than reasoning
- Distractors that are obviously wrong or random
- Content that could be memorized and recognized on retesting";

fn type_block(question_type: QuestionType) -> &'static str {
    match question_type {
        QuestionType::Pattern => "\
Generate a pattern recognition question that tests the ability to identify visual or logical patterns.

Requirements:
- Present a sequence or pattern (numbers, letters, shapes, or symbols)
- The test-taker must identify the next or missing item
- The pattern should follow a clear logical rule
- Provide 4-6 answer options including distractors
- Include an explanation of the pattern rule

GOLD STANDARD EXAMPLE:
Question: \"What comes next in the sequence? 3, 6, 11, 18, 27, ?\"
Options: [\"36\", \"38\", \"40\", \"42\", \"44\"]
Answer: \"38\"
Explanation: \"Each number increases by consecutive odd numbers: +3, +5, +7, +9, +11. So 27 + 11 = 38.\"",
        QuestionType::Logic => "\
Generate a logical reasoning question that tests deductive or inductive reasoning.

Requirements:
- Present a logical scenario, syllogism, or reasoning puzzle
- The test-taker must draw a valid logical conclusion
- Avoid trick questions; focus on valid inference
- Provide 4-6 answer options with plausible distractors
- Include an explanation of the reasoning process

GOLD STANDARD EXAMPLE:
Question: \"All musicians can read sheet music. Some musicians are teachers. Which statement must be true?\"
Options: [\"All teachers can read sheet music\", \"Some teachers can read sheet music\", \"All people who read sheet music are musicians\", \"Some musicians who teach cannot read sheet music\"]
Answer: \"Some teachers can read sheet music\"
Explanation: \"Some musicians are teachers and all musicians read sheet music, so at least those teachers can. Nothing supports the universal claims.\"",
        QuestionType::Spatial => "\
Generate a spatial reasoning question that tests the ability to visualize and manipulate objects in space.

Requirements:
- Present a spatial transformation problem (rotations, folding, 3D visualization)
- Describe shapes and transformations clearly in text
- Provide 4-6 answer options including similar but incorrect options
- Include an explanation of the transformation

GOLD STANDARD EXAMPLE:
Question: \"A cube has a star on top, a circle on the bottom, a square on the front and a triangle on the back. After rotating the cube 90 degrees forward, which symbol faces up?\"
Options: [\"star\", \"circle\", \"square\", \"triangle\"]
Answer: \"triangle\"
Explanation: \"Rotating forward moves the top face to the front and the back face to the top, so the triangle faces up.\"",
        QuestionType::Math => "\
Generate a mathematical reasoning question that tests quantitative reasoning.

Requirements:
- Present a problem requiring reasoning, not just calculation
- Difficulty should come from the reasoning, not from arithmetic volume
- Provide 4-6 numerical answer options
- Include a step-by-step explanation

GOLD STANDARD EXAMPLE:
Question: \"A store sells apples in bags of 6 and oranges in bags of 8. If you buy the same number of apples and oranges, what is the minimum number of each fruit you must buy?\"
Options: [\"12\", \"16\", \"24\", \"32\", \"48\"]
Answer: \"24\"
Explanation: \"The least common multiple of 6 and 8 is 24: four bags of apples and three bags of oranges.\"",
        QuestionType::Verbal => "\
Generate a verbal reasoning question that tests language comprehension and reasoning.

Requirements:
- Present analogies, word relationships, or inference problems
- Test reasoning about conceptual connections, not vocabulary trivia
- Use common vocabulary
- Provide 4-6 answer options
- Include an explanation of the relationship

GOLD STANDARD EXAMPLE:
Question: \"Book is to Chapter as Building is to ____\"
Options: [\"Floor\", \"Brick\", \"Foundation\", \"Architect\", \"City\"]
Answer: \"Floor\"
Explanation: \"A book is divided into chapters; a building is divided into floors. The relationship is whole to major subdivision.\"",
        QuestionType::Memory => "\
Generate a memory-based question that tests working memory and recall.

CRITICAL: Memory questions MUST include a separate \"stimulus\" field containing the content to
memorize. The app displays the stimulus first, then hides it before showing the question.

Requirements:
- Provide a \"stimulus\" field with the content to memorize (list, sequence, or short passage)
- Provide a \"question_text\" answerable only by someone who memorized the stimulus
- The question_text must NOT repeat the stimulus content
- Memory load appropriate for the difficulty level
- Provide 4-6 answer options and an explanation referencing the stimulus

GOLD STANDARD EXAMPLE:
stimulus: \"maple, oak, dolphin, cherry, whale, birch, salmon\"
question_text: \"Which item from the list is a mammal that is NOT the fourth item?\"
Options: [\"dolphin\", \"whale\", \"salmon\", \"cherry\", \"oak\"]
Answer: \"whale\"
Explanation: \"The mammals are dolphin and whale; the fourth item is cherry, so the answer is whale.\"",
    }
}

fn difficulty_block(difficulty: DifficultyLevel) -> &'static str {
    match difficulty {
        DifficultyLevel::Easy => "\
Difficulty: EASY
- Suitable for most adults with average cognitive ability
- Single-step or simple two-step reasoning
- Distractors clearly wrong to someone who understands the concept
- Target success rate: ~70-80% of the general population",
        DifficultyLevel::Medium => "\
Difficulty: MEDIUM
- Suitable for above-average problem solvers
- Multi-step reasoning or non-obvious pattern identification
- Distractors plausible, testing partial understanding
- Target success rate: ~40-60% of the general population",
        DifficultyLevel::Hard => "\
Difficulty: HARD
- Suitable for high-performing individuals (top 10-15%)
- Complex patterns requiring abstract thinking or creative insight
- Distractors sophisticated, appealing to incomplete reasoning
- Target success rate: ~10-30% of the general population
- Difficulty must come from cognitive demand, never from obscurity",
    }
}

/// Build the full generation prompt for `count` questions of one type and
/// difficulty.
pub fn build_generation_prompt(
    question_type: QuestionType,
    difficulty: DifficultyLevel,
    count: usize,
) -> String {
    let stimulus_line = if question_type == QuestionType::Memory {
        "\n5. stimulus: The content to memorize (REQUIRED for memory questions; shown first, then hidden)"
    } else {
        ""
    };
    let shape = if count > 1 {
        "If generating multiple questions, return an array of question objects."
    } else {
        "Return a single question object."
    };
    format!(
        "{system}\n\n{type_block}\n\n{difficulty_block}\n\n\
Generate {count} unique, high-quality {noun} of type '{question_type}' at '{difficulty}' difficulty.\n\n\
IMPORTANT: Respond with valid JSON only. Do not include any text outside the JSON structure.\n\n\
For each question, provide:\n\
1. question_text: The complete question statement\n\
2. correct_answer: The correct answer (must be one of the answer_options)\n\
3. answer_options: An array of 4-6 options (must include correct_answer)\n\
4. explanation: A clear explanation of why the answer is correct{stimulus_line}\n\n\
{shape}",
        system = SYSTEM_PROMPT,
        type_block = type_block(question_type),
        difficulty_block = difficulty_block(difficulty),
        noun = if count == 1 { "question" } else { "questions" },
    )
}

/// Build the judge prompt scoring one question against the five rubric
/// criteria.
pub fn build_judge_prompt(
    question: &str,
    answer_options: &[String],
    correct_answer: &str,
    question_type: QuestionType,
    difficulty: DifficultyLevel,
    stimulus: Option<&str>,
) -> String {
    let memory_guidance = if question_type == QuestionType::Memory {
        "\nMEMORY QUESTION EVALUATION GUIDELINES:\n\
Memory questions use a two-phase delivery: the stimulus is shown first, then hidden before the\n\
question appears.\n\
- Do NOT penalize for the stimulus not being repeated in the question (this is intentional)\n\
- Do NOT penalize for UX concerns about cheating, screenshots, or stimulus visibility\n\
- DO evaluate whether the question genuinely tests memory of the stimulus and whether the\n\
  cognitive load matches the target difficulty\n"
    } else {
        ""
    };

    let mut options = String::new();
    for (i, option) in answer_options.iter().enumerate() {
        let _ = writeln!(options, "  {}. {}", i + 1, option);
    }

    let stimulus_block = match stimulus {
        Some(stimulus) => format!(
            "\nStimulus (shown first, then hidden before the question appears):\n{stimulus}\n"
        ),
        None => String::new(),
    };

    format!(
        "You are an expert psychometrician evaluating IQ test questions for a mobile app used for\n\
longitudinal cognitive tracking.\n\n\
IMPORTANT: Evaluate QUESTION CONTENT QUALITY only. Delivery mechanism concerns (screenshots,\n\
hiding sequences before recall, preventing cheating) are handled by the app; do NOT penalize\n\
validity for them.\n\
{memory_guidance}\n\
Evaluate the following question across these criteria:\n\n\
1. CLARITY (0.0-1.0): unambiguous wording, concise enough for mobile display.\n\
2. DIFFICULTY (0.0-1.0): appropriate for the {difficulty} level (easy ~70-80%, medium ~40-60%,\n\
   hard ~10-30% success rate).\n\
3. VALIDITY (0.0-1.0): genuinely measures {question_type} ability, one objectively correct\n\
   answer, culturally neutral.\n\
4. FORMATTING (0.0-1.0): 4-6 options, correct answer included, plausible distractors.\n\
5. CREATIVITY (0.0-1.0): original, unlikely to be recognized on retesting.\n\n\
Question to evaluate:\n\
---\n\
Type: {question_type}\n\
Difficulty: {difficulty}\n\
{stimulus_block}\
Question: {question}\n\n\
Answer Options:\n\
{options}\
Correct Answer: {correct_answer}\n\
---\n\n\
Respond with valid JSON matching this exact structure:\n\
{{\n\
    \"clarity_score\": <float 0.0-1.0>,\n\
    \"difficulty_score\": <float 0.0-1.0>,\n\
    \"validity_score\": <float 0.0-1.0>,\n\
    \"formatting_score\": <float 0.0-1.0>,\n\
    \"creativity_score\": <float 0.0-1.0>,\n\
    \"feedback\": \"<brief explanation of scores and any issues>\"\n\
}}\n\n\
Be rigorous. Questions must score above 0.7 in ALL categories to be acceptable."
    )
}

/// Build a regeneration prompt for a question the judge rejected.
pub fn build_regeneration_prompt(
    original_question: &str,
    original_answer: &str,
    original_options: &[String],
    question_type: QuestionType,
    difficulty: DifficultyLevel,
    judge_feedback: &str,
    scores: &[(&str, f64)],
) -> String {
    let mut weak_areas = String::new();
    for (name, value) in scores {
        if *value < WEAK_SCORE_THRESHOLD {
            let _ = writeln!(weak_areas, "- {}: {:.2}", name.to_uppercase(), value);
        }
    }
    if weak_areas.is_empty() {
        weak_areas.push_str("- Multiple areas need improvement\n");
    }

    let stimulus_field = if question_type == QuestionType::Memory {
        ", \"stimulus\": \"<content to memorize - REQUIRED for memory questions>\""
    } else {
        ""
    };

    format!(
        "{system}\n\n{type_block}\n\n{difficulty_block}\n\n\
---\n\n\
REGENERATION TASK: A previous question was rejected by our quality judge. Create a NEW, IMPROVED\n\
question that addresses the identified issues while keeping the same type and difficulty.\n\n\
ORIGINAL QUESTION (REJECTED):\n\
Question: {original_question}\n\
Correct Answer: {original_answer}\n\
Options: {original_options:?}\n\n\
JUDGE'S FEEDBACK:\n\
{judge_feedback}\n\n\
WEAK SCORES (below {threshold} threshold):\n\
{weak_areas}\n\
REGENERATION REQUIREMENTS:\n\
1. Create a COMPLETELY NEW question; do not rephrase the original\n\
2. Address ALL issues mentioned in the judge's feedback\n\
3. Ensure ONE definitively correct answer\n\
4. Calibrate appropriately for the {difficulty} level\n\
5. Maintain the question type: {question_type}\n\n\
Respond with valid JSON only:\n\
{{\n\
    \"question_text\": \"<your new question>\",\n\
    \"correct_answer\": \"<the one correct answer>\",\n\
    \"answer_options\": [\"<4-6 options including correct answer>\"],\n\
    \"explanation\": \"<clear explanation of why the answer is correct>\"{stimulus_field}\n\
}}",
        system = SYSTEM_PROMPT,
        type_block = type_block(question_type),
        difficulty_block = difficulty_block(difficulty),
        threshold = WEAK_SCORE_THRESHOLD,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_prompt_is_deterministic() {
        let a = build_generation_prompt(QuestionType::Pattern, DifficultyLevel::Easy, 1);
        let b = build_generation_prompt(QuestionType::Pattern, DifficultyLevel::Easy, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn generation_prompt_varies_by_inputs() {
        let easy = build_generation_prompt(QuestionType::Logic, DifficultyLevel::Easy, 1);
        let hard = build_generation_prompt(QuestionType::Logic, DifficultyLevel::Hard, 1);
        assert_ne!(easy, hard);
        assert!(easy.contains("EASY"));
        assert!(hard.contains("HARD"));
    }

    #[test]
    fn memory_generation_prompt_demands_stimulus() {
        let prompt = build_generation_prompt(QuestionType::Memory, DifficultyLevel::Medium, 1);
        assert!(prompt.contains("stimulus"));
        assert!(prompt.contains("shown first, then hidden"));
    }

    #[test]
    fn judge_prompt_includes_labeled_stimulus_block() {
        let options = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let prompt = build_judge_prompt(
            "Which item was third?",
            &options,
            "a",
            QuestionType::Memory,
            DifficultyLevel::Easy,
            Some("maple, oak, dolphin"),
        );
        assert!(prompt.contains("Stimulus (shown first, then hidden"));
        assert!(prompt.contains("maple, oak, dolphin"));
        assert!(prompt.contains("Do NOT penalize"));
    }

    #[test]
    fn judge_prompt_requires_all_five_scores() {
        let options = vec!["36".to_string(), "38".to_string(), "40".to_string(), "42".to_string()];
        let prompt = build_judge_prompt(
            "What comes next?",
            &options,
            "38",
            QuestionType::Pattern,
            DifficultyLevel::Easy,
            None,
        );
        for field in [
            "clarity_score",
            "difficulty_score",
            "validity_score",
            "formatting_score",
            "creativity_score",
            "feedback",
        ] {
            assert!(prompt.contains(field), "missing {field}");
        }
        assert!(!prompt.contains("Stimulus (shown first"));
    }

    #[test]
    fn regeneration_prompt_lists_weak_scores() {
        let options = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let prompt = build_regeneration_prompt(
            "old question",
            "a",
            &options,
            QuestionType::Verbal,
            DifficultyLevel::Medium,
            "ambiguous wording",
            &[("clarity", 0.4), ("validity", 0.9), ("creativity", 0.6)],
        );
        assert!(prompt.contains("CLARITY: 0.40"));
        assert!(prompt.contains("CREATIVITY: 0.60"));
        assert!(!prompt.contains("VALIDITY: 0.90"));
        assert!(prompt.contains("ambiguous wording"));
    }
}
