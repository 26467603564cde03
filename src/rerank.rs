//! Second-stage rerankers.
//!
//! - **[`LexicalReranker`]**: query-term coverage; offline and deterministic.
//! - **`LocalReranker`**: fastembed cross-encoder (`bge-reranker-base` by
//!   default), behind the `local-models` feature.
//!
//! [`RetryingReranker`] retries transient failures. When re-ranking still
//! fails the retriever falls back to stage-1 order.

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;

use docent_core::rerank::Reranker;

use crate::config::RerankerConfig;
use crate::embedding::tokenize;
use crate::retry::{with_retry, RetryPolicy};

/// Scores each candidate by the fraction of distinct query terms it
/// contains, plus a small bonus for repeated matches.
pub struct LexicalReranker;

impl LexicalReranker {
    pub fn score_one(query_terms: &HashSet<String>, candidate: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let mut seen = HashSet::new();
        let mut hits = 0usize;
        for token in tokenize(candidate) {
            if query_terms.contains(&token) {
                hits += 1;
                seen.insert(token);
            }
        }
        let coverage = seen.len() as f32 / query_terms.len() as f32;
        let density = hits as f32 / (hits as f32 + 10.0);
        coverage + 0.1 * density
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let terms: HashSet<String> = tokenize(query).filter(|t| t.len() > 2).collect();
        Ok(candidates
            .iter()
            .map(|c| Self::score_one(&terms, c))
            .collect())
    }
}

#[cfg(feature = "local-models")]
pub struct LocalReranker {
    model_name: String,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextRerank>>>,
}

#[cfg(feature = "local-models")]
impl LocalReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-reranker-base".to_string());
        config_to_rerank_model(&model_name)?;
        Ok(Self {
            model_name,
            model: Default::default(),
        })
    }
}

#[cfg(feature = "local-models")]
fn config_to_rerank_model(name: &str) -> Result<fastembed::RerankerModel> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        other => bail!(
            "Unknown local reranker model: '{}'. Supported models: \
             bge-reranker-base, jina-reranker-v1-turbo-en",
            other
        ),
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Reranker for LocalReranker {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let rerank_model = config_to_rerank_model(&self.model_name)?;
        let slot = self.model.clone();
        let query = query.to_string();
        let documents = candidates.to_vec();
        let count = documents.len();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow::anyhow!("local reranker lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextRerank::try_new(
                    fastembed::RerankInitOptions::new(rerank_model)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local reranker: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local reranker not loaded"))?;
            let ranked = model
                .rerank(query, documents, false, None)
                .map_err(|e| anyhow::anyhow!("Local re-ranking failed: {}", e))?;

            // Results come back sorted by score; put them back in input order.
            let mut scores = vec![f32::NEG_INFINITY; count];
            for r in ranked {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = r.score;
                }
            }
            Ok(scores)
        })
        .await?
    }
}

pub struct RetryingReranker {
    inner: Box<dyn Reranker>,
    retry: RetryPolicy,
}

impl RetryingReranker {
    pub fn new(inner: Box<dyn Reranker>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl Reranker for RetryingReranker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        with_retry(self.retry, "re-ranking", || self.inner.score(query, candidates)).await
    }
}

/// Build the configured reranker. `None` when re-ranking is disabled.
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Box<dyn Reranker>>> {
    let inner: Box<dyn Reranker> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "lexical" => Box::new(LexicalReranker),
        #[cfg(feature = "local-models")]
        "local" => Box::new(LocalReranker::new(config)?),
        #[cfg(not(feature = "local-models"))]
        "local" => bail!("Local reranker requires --features local-models"),
        other => bail!("Unknown reranker provider: {}", other),
    };
    Ok(Some(Box::new(RetryingReranker::new(
        inner,
        RetryPolicy::new(config.max_retries, config.initial_backoff_ms),
    ))))
}
