//! Embedding service with an in-memory cache.
//!
//! Embeddings are deterministic for a given model, so cache entries have no
//! TTL. Keys are SHA-256 hashes of normalized (trimmed, lowercased) text,
//! which makes equal normalized texts share a single slot. The cache is
//! instance-scoped and dies with the deduplicator that owns it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_openai::{Client, config::OpenAIConfig, types::CreateEmbeddingRequestArgs};
use sha2::{Digest, Sha256};

use crate::errors::{ClassifiedError, ProviderError, classify_openai};
use crate::prelude::*;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

/// Maximum cached embeddings before least-recently-used eviction.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct CacheEntry {
    embedding: Vec<f32>,
    last_accessed: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Cache statistics for the run summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 { self.hits as f64 / total as f64 } else { 0.0 }
    }
}

/// Deterministic cache key: SHA-256 of the normalized text.
fn cache_key(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Wraps the embedding provider with the cache. When no API key is
/// configured every call returns `None` and semantic checks degrade to
/// exact-match only.
pub struct EmbeddingService {
    client: Option<Client<OpenAIConfig>>,
    model: String,
    dimension: usize,
    max_entries: usize,
    cache: Mutex<CacheInner>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("model", &self.model)
            .field("configured", &self.client.is_some())
            .finish()
    }
}

impl EmbeddingService {
    pub fn new(api_key: Option<&str>, model: &str) -> Self {
        let client = match api_key {
            Some(key) => Some(Client::with_config(OpenAIConfig::new().with_api_key(key))),
            None => {
                warn!("no embedding API key configured; semantic dedup disabled");
                None
            }
        };
        Self {
            client,
            model: model.to_owned(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            max_entries: DEFAULT_MAX_ENTRIES,
            cache: Mutex::new(CacheInner::default()),
        }
    }

    /// Whether an embedding client is configured.
    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed one text, serving from cache when possible. Returns `None` when
    /// no client is configured; API failures are errors so callers can
    /// choose their own failure policy.
    pub async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, ProviderError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let key = cache_key(text);
        if let Some(hit) = self.cache_get(&key) {
            return Ok(Some(hit));
        }

        let embedding = self.call_api(client, vec![text.to_owned()]).await?;
        let embedding = embedding.into_iter().next().ok_or_else(|| {
            ClassifiedError::parse_failure(
                "openai",
                "embedding response contained no vectors",
            )
        })?;
        self.cache_put(key, embedding.clone());
        Ok(Some(embedding))
    }

    /// Embed many texts, issuing a single API call for the cache misses.
    /// Result order matches input order.
    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Option<Vec<f32>>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let Some(client) = &self.client else {
            return Ok(vec![None; texts.len()]);
        };

        let keys: Vec<String> = texts.iter().map(|t| cache_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match self.cache_get(key) {
                Some(hit) => results[i] = Some(hit),
                None => miss_indices.push(i),
            }
        }
        if miss_indices.is_empty() {
            debug!(count = texts.len(), "embedding batch served entirely from cache");
            return Ok(results);
        }

        let miss_texts: Vec<String> =
            miss_indices.iter().map(|&i| texts[i].clone()).collect();
        let embeddings = self.call_api(client, miss_texts).await?;
        if embeddings.len() != miss_indices.len() {
            return Err(ClassifiedError::parse_failure(
                "openai",
                format!(
                    "embedding batch returned {} vectors, expected {}",
                    embeddings.len(),
                    miss_indices.len()
                ),
            )
            .into());
        }
        for (&i, embedding) in miss_indices.iter().zip(embeddings) {
            self.cache_put(keys[i].clone(), embedding.clone());
            results[i] = Some(embedding);
        }
        Ok(results)
    }

    pub fn cache_stats(&self) -> CacheStats {
        let inner = self.cache.lock().expect("embedding cache lock poisoned");
        CacheStats { hits: inner.hits, misses: inner.misses, size: inner.entries.len() }
    }

    async fn call_api(
        &self,
        client: &Client<OpenAIConfig>,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(texts)
            .build()
            .map_err(|e| classify_openai("openai", &e))?;
        let response = client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| classify_openai("openai", &e))?;
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn cache_get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.cache.lock().expect("embedding cache lock poisoned");
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                let embedding = entry.embedding.clone();
                inner.hits += 1;
                debug!(key = &key[..8], "embedding cache hit");
                Some(embedding)
            }
            None => {
                inner.misses += 1;
                debug!(key = &key[..8], "embedding cache miss");
                None
            }
        }
    }

    fn cache_put(&self, key: String, embedding: Vec<f32>) {
        let mut inner = self.cache.lock().expect("embedding cache lock poisoned");
        while inner.entries.len() >= self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                }
                None => break,
            }
        }
        inner.entries.insert(key, CacheEntry { embedding, last_accessed: Instant::now() });
    }

    /// Test hook: preload a cache entry without any API call.
    #[cfg(test)]
    pub(crate) fn preload(&self, text: &str, embedding: Vec<f32>) {
        self.cache_put(cache_key(text), embedding);
    }
}

/// Cosine similarity clamped into `[0, 1]`. Zero-norm inputs compare as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}
