//! PostgreSQL persistence for evaluated questions.
//!
//! Inserts happen in a transaction per call. The question embedding is
//! computed at insert time and stored alongside the row; a failed embedding
//! degrades to NULL rather than failing the insert. Duplicate prevention is
//! the deduplicator's job, not the store's.

use std::sync::Arc;

use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::dedup::ExistingQuestion;
use crate::embedding::EmbeddingService;
use crate::models::EvaluatedQuestion;
use crate::prelude::*;

/// Storage-layer failures. Fatal to the run: the pipeline exits with the
/// database error code.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("pool checkout failed: {0}")]
    Checkout(#[from] deadpool_postgres::PoolError),
}

/// Connection settings for the question store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub pool_size: usize,
}

impl StorageConfig {
    pub fn new(database_url: &str) -> Self {
        Self { database_url: database_url.to_owned(), pool_size: 4 }
    }
}

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS questions (
    id BIGSERIAL PRIMARY KEY,
    question_text TEXT NOT NULL,
    question_type TEXT NOT NULL,
    difficulty_level TEXT NOT NULL,
    correct_answer TEXT NOT NULL,
    answer_options TEXT[] NOT NULL,
    explanation TEXT,
    stimulus TEXT,
    sub_type TEXT,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    source_llm TEXT NOT NULL,
    source_model TEXT NOT NULL,
    judge_score DOUBLE PRECISION,
    prompt_version TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    question_embedding REAL[],
    distractor_stats JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)";

const INSERT_SQL: &str = "\
INSERT INTO questions (
    question_text, question_type, difficulty_level, correct_answer,
    answer_options, explanation, stimulus, sub_type, metadata,
    source_llm, source_model, judge_score, prompt_version, is_active,
    question_embedding
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
RETURNING id";

/// The questions store.
pub struct QuestionStore {
    pool: Pool,
    embeddings: Arc<EmbeddingService>,
}

impl QuestionStore {
    /// Connect, verify the connection, and ensure the schema exists.
    pub async fn connect(
        config: &StorageConfig,
        embeddings: Arc<EmbeddingService>,
    ) -> Result<Self, StorageError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.database_url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Pool(e.to_string()))?;

        let client = pool.get().await?;
        client.batch_execute(SCHEMA_SQL).await?;
        drop(client);

        info!("question store connected");
        Ok(Self { pool, embeddings })
    }

    /// Existing question texts for the deduplication corpus, most recent
    /// first.
    pub async fn fetch_existing_questions(
        &self,
        limit: i64,
    ) -> Result<Vec<ExistingQuestion>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, question_text FROM questions
                 WHERE is_active ORDER BY id DESC LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ExistingQuestion {
                id: Some(row.get(0)),
                question_text: row.get(1),
            })
            .collect())
    }

    /// Insert one evaluated question. Runs in its own transaction.
    pub async fn insert_evaluated_question(
        &self,
        evaluated: &EvaluatedQuestion,
        prompt_version: &str,
    ) -> Result<i64, StorageError> {
        let embedding = self.embed_or_null(&evaluated.question.question_text).await;
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        let id = insert_row(&transaction, evaluated, prompt_version, embedding).await?;
        transaction.commit().await?;
        debug!(id, "inserted question");
        Ok(id)
    }

    /// Insert a batch atomically: one batch embedding call, one
    /// transaction. Any row failure rolls the whole batch back.
    pub async fn insert_evaluated_questions_batch(
        &self,
        evaluated: &[EvaluatedQuestion],
        prompt_version: &str,
    ) -> Result<Vec<i64>, StorageError> {
        if evaluated.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> =
            evaluated.iter().map(|eq| eq.question.question_text.clone()).collect();
        let embeddings = match self.embeddings.embed_batch(&texts).await {
            Ok(embeddings) => embeddings,
            Err(err) => {
                warn!(%err, "batch embedding failed; storing questions without embeddings");
                vec![None; evaluated.len()]
            }
        };

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        let mut ids = Vec::with_capacity(evaluated.len());
        for (eq, embedding) in evaluated.iter().zip(embeddings) {
            let id = insert_row(&transaction, eq, prompt_version, embedding).await?;
            ids.push(id);
        }
        transaction.commit().await?;
        info!(inserted = ids.len(), "batch insert committed");
        Ok(ids)
    }

    async fn embed_or_null(&self, text: &str) -> Option<Vec<f32>> {
        match self.embeddings.embed(text).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(%err, "embedding failed; storing question without embedding");
                None
            }
        }
    }
}

async fn insert_row(
    transaction: &deadpool_postgres::Transaction<'_>,
    evaluated: &EvaluatedQuestion,
    prompt_version: &str,
    embedding: Option<Vec<f32>>,
) -> Result<i64, tokio_postgres::Error> {
    let question = &evaluated.question;
    let metadata = enriched_metadata(evaluated);
    let row = transaction
        .query_one(
            INSERT_SQL,
            &[
                &question.question_text,
                &question.question_type.as_str(),
                &question.difficulty_level.as_str(),
                &question.correct_answer,
                &question.answer_options,
                &question.explanation,
                &question.stimulus,
                &question.sub_type,
                &metadata,
                &question.source_llm,
                &question.source_model,
                &evaluated.evaluation.overall_score,
                &prompt_version,
                &true,
                &embedding,
            ],
        )
        .await?;
    Ok(row.get(0))
}

/// Merge the evaluation into the question metadata. The raw sub-scores are
/// persisted verbatim so a future judge-policy change can recompute the
/// overall score offline without re-invoking the judge.
fn enriched_metadata(evaluated: &EvaluatedQuestion) -> Value {
    let mut metadata = serde_json::Map::new();
    for (key, value) in &evaluated.question.metadata {
        metadata.insert(key.clone(), value.clone());
    }
    let evaluation = &evaluated.evaluation;
    metadata.insert(
        "evaluation_scores".to_owned(),
        json!({
            "clarity": evaluation.clarity_score,
            "difficulty": evaluation.difficulty_score,
            "validity": evaluation.validity_score,
            "formatting": evaluation.formatting_score,
            "creativity": evaluation.creativity_score,
            "feedback": &evaluation.feedback,
        }),
    );
    metadata.insert(
        "judge_model".to_owned(),
        Value::String(evaluated.judge_model.clone()),
    );
    Value::Object(metadata)
}
