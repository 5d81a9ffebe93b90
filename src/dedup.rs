//! Duplicate detection over generated questions.
//!
//! Two checks run in order, short-circuiting on the first match: exact
//! (normalized text equality) and semantic (maximum cosine similarity over
//! embeddings against a threshold).

use std::sync::Arc;

use crate::embedding::{EmbeddingService, cosine_similarity};
use crate::errors::ProviderError;
use crate::models::GeneratedQuestion;
use crate::prelude::*;

/// Default maximum cosine similarity allowed before a candidate counts as a
/// semantic duplicate.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// How a duplicate was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateType {
    Exact,
    Semantic,
}

/// An already-persisted question the deduplicator compares against.
#[derive(Debug, Clone)]
pub struct ExistingQuestion {
    pub id: Option<i64>,
    pub question_text: String,
}

/// Result of one duplicate check.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCheckResult {
    pub is_duplicate: bool,
    pub duplicate_type: Option<DuplicateType>,

    /// 1.0 for exact matches, the maximum cosine similarity for semantic
    /// ones, 0.0 otherwise. Always within `[0, 1]`.
    pub similarity_score: f64,

    /// Text of the matched question, when a duplicate was found.
    pub matched_question_text: Option<String>,
}

impl DuplicateCheckResult {
    fn not_duplicate() -> Self {
        Self {
            is_duplicate: false,
            duplicate_type: None,
            similarity_score: 0.0,
            matched_question_text: None,
        }
    }
}

/// Configuration for the deduplicator.
#[derive(Debug, Clone)]
pub struct DeduplicatorConfig {
    pub similarity_threshold: f64,

    /// When true (the default), embedding failures during batch checks are
    /// treated as not-duplicate and logged, so a flaky embedding API never
    /// silently blocks generation.
    pub fail_open: bool,
}

impl Default for DeduplicatorConfig {
    fn default() -> Self {
        Self { similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD, fail_open: true }
    }
}

/// Exact plus semantic duplicate checking. Owns the embedding cache through
/// the embedding service.
#[derive(Debug)]
pub struct Deduplicator {
    embeddings: Arc<EmbeddingService>,
    config: DeduplicatorConfig,
}

impl Deduplicator {
    pub fn new(embeddings: Arc<EmbeddingService>, config: DeduplicatorConfig) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.similarity_threshold) {
            return Err(anyhow!(
                "similarity_threshold must be between 0.0 and 1.0, got {}",
                config.similarity_threshold
            ));
        }
        info!(
            threshold = config.similarity_threshold,
            model = embeddings.model(),
            "deduplicator initialized"
        );
        Ok(Self { embeddings, config })
    }

    /// Check one candidate against the existing corpus.
    pub async fn check_duplicate(
        &self,
        candidate: &GeneratedQuestion,
        existing: &[ExistingQuestion],
    ) -> Result<DuplicateCheckResult, ProviderError> {
        let candidate_text = normalize(&candidate.question_text);

        for question in existing {
            if candidate_text == normalize(&question.question_text) {
                info!(
                    text = %truncate(&candidate.question_text, 50),
                    "exact duplicate found"
                );
                return Ok(DuplicateCheckResult {
                    is_duplicate: true,
                    duplicate_type: Some(DuplicateType::Exact),
                    similarity_score: 1.0,
                    matched_question_text: Some(question.question_text.clone()),
                });
            }
        }

        if existing.is_empty() {
            return Ok(DuplicateCheckResult::not_duplicate());
        }
        self.check_semantic(&candidate_text, existing).await
    }

    async fn check_semantic(
        &self,
        candidate_text: &str,
        existing: &[ExistingQuestion],
    ) -> Result<DuplicateCheckResult, ProviderError> {
        let Some(candidate_embedding) = self.embeddings.embed(candidate_text).await? else {
            // No embedding client; exact matching above is all we can do.
            return Ok(DuplicateCheckResult::not_duplicate());
        };

        let mut max_similarity = 0.0_f64;
        let mut most_similar: Option<&ExistingQuestion> = None;
        for question in existing {
            if question.question_text.trim().is_empty() {
                continue;
            }
            let Some(embedding) = self.embeddings.embed(&question.question_text).await?
            else {
                continue;
            };
            let similarity = cosine_similarity(&candidate_embedding, &embedding);
            if similarity > max_similarity {
                max_similarity = similarity;
                most_similar = Some(question);
            }
        }

        if max_similarity >= self.config.similarity_threshold {
            info!(score = max_similarity, "semantic duplicate found");
            return Ok(DuplicateCheckResult {
                is_duplicate: true,
                duplicate_type: Some(DuplicateType::Semantic),
                similarity_score: max_similarity,
                matched_question_text: most_similar.map(|q| q.question_text.clone()),
            });
        }
        Ok(DuplicateCheckResult::not_duplicate())
    }

    /// Check many candidates independently. Failures follow the configured
    /// failure policy instead of aborting the batch.
    pub async fn check_duplicates_batch(
        &self,
        candidates: &[GeneratedQuestion],
        existing: &[ExistingQuestion],
    ) -> Vec<DuplicateCheckResult> {
        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.check_duplicate(candidate, existing).await {
                Ok(result) => results.push(result),
                Err(err) if self.config.fail_open => {
                    error!(%err, "duplicate check failed; treating as non-duplicate");
                    results.push(DuplicateCheckResult::not_duplicate());
                }
                Err(err) => {
                    error!(%err, "duplicate check failed; treating as duplicate");
                    results.push(DuplicateCheckResult {
                        is_duplicate: true,
                        duplicate_type: None,
                        similarity_score: 0.0,
                        matched_question_text: None,
                    });
                }
            }
        }
        let found = results.iter().filter(|r| r.is_duplicate).count();
        info!(
            checked = candidates.len(),
            duplicates = found,
            "duplicate check complete"
        );
        results
    }

    /// Split candidates into unique questions and detected duplicates. The
    /// check runs against the existing corpus and against earlier unique
    /// candidates within the same call, so a batch cannot insert two copies
    /// of itself.
    pub async fn filter_duplicates(
        &self,
        candidates: Vec<GeneratedQuestion>,
        existing: &[ExistingQuestion],
    ) -> (Vec<GeneratedQuestion>, Vec<(GeneratedQuestion, DuplicateCheckResult)>) {
        let mut corpus: Vec<ExistingQuestion> = existing.to_vec();
        let mut unique = Vec::new();
        let mut duplicates = Vec::new();

        for candidate in candidates {
            let result = match self.check_duplicate(&candidate, &corpus).await {
                Ok(result) => result,
                Err(err) if self.config.fail_open => {
                    error!(%err, "duplicate check failed; keeping question");
                    DuplicateCheckResult::not_duplicate()
                }
                Err(err) => {
                    error!(%err, "duplicate check failed; dropping question");
                    duplicates.push((
                        candidate,
                        DuplicateCheckResult {
                            is_duplicate: true,
                            duplicate_type: None,
                            similarity_score: 0.0,
                            matched_question_text: None,
                        },
                    ));
                    continue;
                }
            };
            if result.is_duplicate {
                duplicates.push((candidate, result));
            } else {
                corpus.push(ExistingQuestion {
                    id: None,
                    question_text: candidate.question_text.clone(),
                });
                unique.push(candidate);
            }
        }

        info!(
            unique = unique.len(),
            duplicates = duplicates.len(),
            "duplicate filtering complete"
        );
        (unique, duplicates)
    }

    /// Threshold, model and cache counters for the run summary.
    pub fn stats(&self) -> Value {
        let cache = self.embeddings.cache_stats();
        json!({
            "similarity_threshold": self.config.similarity_threshold,
            "embedding_model": self.embeddings.model(),
            "cache": { "hits": cache.hits, "misses": cache.misses, "size": cache.size },
        })
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
