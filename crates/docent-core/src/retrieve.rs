//! Two-stage retrieval.
//!
//! Stage 1 embeds the query and asks the [`Store`] for the `top_k_stage1`
//! nearest chunks. Stage 2, when requested and a [`Reranker`] is available,
//! re-scores those candidates jointly with the query and re-sorts them.
//! Either way the relevance threshold is applied last and the list is cut
//! to `rerank_top_k`.
//!
//! A re-ranker failure is not fatal: the stage-1 order is kept and the
//! outcome reports `reranked = false`.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::models::RetrievalResult;
use crate::rerank::{RerankAuditEntry, Reranker};
use crate::store::{compare_scored, Store};

/// Per-call retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalParams {
    pub top_k_stage1: usize,
    pub rerank_top_k: usize,
    /// Minimum score to keep a result. `None` keeps everything.
    pub relevance_threshold: Option<f32>,
    /// Replaces `relevance_threshold` when stage 2 actually ran.
    pub rerank_relevance_threshold: Option<f32>,
    pub use_reranking: bool,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k_stage1: 50,
            rerank_top_k: 5,
            relevance_threshold: None,
            rerank_relevance_threshold: None,
            use_reranking: false,
        }
    }
}

/// Result of one retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Retrieval {
    /// Sorted by descending `score`, no duplicate chunk ids.
    pub results: Vec<RetrievalResult>,
    pub reranked: bool,
    pub stage1_candidates: usize,
}

impl Retrieval {
    /// Initial and final rank for every returned passage.
    pub fn audit(&self) -> Vec<RerankAuditEntry> {
        self.results
            .iter()
            .enumerate()
            .map(|(i, r)| RerankAuditEntry {
                chunk_id: r.chunk_id.clone(),
                source_path: r.source_path.clone(),
                initial_rank: r.initial_rank,
                final_rank: i + 1,
                similarity: r.similarity,
                score: r.score,
            })
            .collect()
    }
}

/// Borrowing retriever over a store and capabilities.
pub struct Retriever<'a> {
    store: &'a dyn Store,
    embedder: &'a dyn EmbeddingProvider,
    reranker: Option<&'a dyn Reranker>,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a dyn Store, embedder: &'a dyn EmbeddingProvider) -> Self {
        Self {
            store,
            embedder,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Option<&'a dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    /// Run stage 1 and, if asked, stage 2.
    ///
    /// An empty or whitespace query returns an empty [`Retrieval`] without
    /// calling any capability. Embedding and store failures propagate;
    /// re-ranking failures fall back to stage-1 order.
    pub async fn retrieve(&self, query: &str, params: &RetrievalParams) -> Result<Retrieval> {
        let query = query.trim();
        if query.is_empty() || params.rerank_top_k == 0 || params.top_k_stage1 == 0 {
            return Ok(Retrieval::default());
        }

        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .context("embedding query")?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PipelineError::Validation("embedding provider returned no query vector".into())
            })?;

        let mut candidates = self.store.search(&query_vec, params.top_k_stage1).await?;
        dedup_by_chunk_id(&mut candidates);
        for (i, c) in candidates.iter_mut().enumerate() {
            c.initial_rank = i + 1;
            c.similarity = c.score;
        }
        let stage1_candidates = candidates.len();
        tracing::debug!(candidates = stage1_candidates, "stage 1 complete");

        if candidates.is_empty() {
            return Ok(Retrieval::default());
        }

        let mut reranked = false;
        if params.use_reranking {
            match self.reranker {
                None => tracing::warn!("re-ranking requested but no re-ranker is configured"),
                Some(reranker) => match rerank(reranker, query, &mut candidates).await {
                    Ok(()) => reranked = true,
                    Err(e) => tracing::warn!(
                        reranker = reranker.name(),
                        error = %format!("{:#}", e),
                        "re-ranking failed, keeping stage-1 order"
                    ),
                },
            }
        }

        let threshold = if reranked {
            params
                .rerank_relevance_threshold
                .or(params.relevance_threshold)
        } else {
            params.relevance_threshold
        };
        if let Some(t) = threshold {
            candidates.retain(|c| c.score >= t);
        }
        candidates.truncate(params.rerank_top_k);

        let retrieval = Retrieval {
            results: candidates,
            reranked,
            stage1_candidates,
        };
        if reranked {
            log_rerank_impact(&retrieval);
        }
        Ok(retrieval)
    }
}

async fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    candidates: &mut Vec<RetrievalResult>,
) -> Result<()> {
    let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
    let scores = reranker.score(query, &texts).await?;
    if scores.len() != candidates.len() {
        return Err(PipelineError::Validation(format!(
            "re-ranker returned {} scores for {} candidates",
            scores.len(),
            candidates.len()
        ))
        .into());
    }
    for (c, s) in candidates.iter_mut().zip(scores) {
        c.score = s;
    }
    candidates.sort_by(|a, b| compare_scored(a.score, &a.chunk_id, b.score, &b.chunk_id));
    Ok(())
}

fn dedup_by_chunk_id(results: &mut Vec<RetrievalResult>) {
    let mut seen = HashSet::new();
    results.retain(|r| seen.insert(r.chunk_id.clone()));
}

fn log_rerank_impact(retrieval: &Retrieval) {
    for entry in retrieval.audit() {
        tracing::info!(
            source = %entry.source_path,
            initial_rank = entry.initial_rank,
            final_rank = entry.final_rank,
            change = entry.rank_change(),
            score = entry.score,
            "re-rank"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, DocumentFingerprint, EmbeddedChunk};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use futures::executor::block_on;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps known texts to fixed vectors; anything else embeds to the x axis.
    struct TableEmbedder(HashMap<String, Vec<f32>>, AtomicUsize);

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        fn model_name(&self) -> &str {
            "table"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| self.0.get(t).cloned().unwrap_or(vec![1.0, 0.0]))
                .collect())
        }
    }

    struct FixedReranker(HashMap<String, f32>);

    #[async_trait]
    impl Reranker for FixedReranker {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn score(&self, _query: &str, candidates: &[String]) -> Result<Vec<f32>> {
            Ok(candidates.iter().map(|c| self.0[c]).collect())
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        fn name(&self) -> &str {
            "failing"
        }
        async fn score(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>> {
            Err(PipelineError::Transient("model unavailable".into()).into())
        }
    }

    /// A unit vector whose cosine with the x axis is `sim`.
    fn at_similarity(sim: f32) -> Vec<f32> {
        vec![sim, (1.0 - sim * sim).sqrt()]
    }

    /// Three single-chunk sources c1, c2, c3 with stage-1 similarities
    /// 0.9, 0.85 and 0.4 to the query.
    fn three_candidates() -> InMemoryStore {
        let store = InMemoryStore::new();
        block_on(async {
            for (name, sim) in [("c1", 0.9f32), ("c2", 0.85), ("c3", 0.4)] {
                let path = format!("{}.md", name);
                let chunk = EmbeddedChunk {
                    chunk: Chunk {
                        id: name.into(),
                        source_path: path.clone(),
                        ordinal: 0,
                        text: format!("text of {}", name),
                        start_char: 0,
                        end_char: 10,
                        hash: String::new(),
                    },
                    vector: at_similarity(sim),
                };
                let fp = DocumentFingerprint {
                    path,
                    content_hash: name.into(),
                    chunk_count: 1,
                    last_ingested_at: 0,
                };
                store.upsert_source(&fp, &[chunk]).await.unwrap();
            }
        });
        store
    }

    fn embedder() -> TableEmbedder {
        TableEmbedder(HashMap::new(), AtomicUsize::new(0))
    }

    fn rerank_scores() -> FixedReranker {
        FixedReranker(
            [("text of c1", 0.3), ("text of c2", 0.95), ("text of c3", 0.1)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn ids(r: &Retrieval) -> Vec<&str> {
        r.results.iter().map(|x| x.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_stage1_only_applies_threshold_and_limit() {
        let store = three_candidates();
        let emb = embedder();
        let retriever = Retriever::new(&store, &emb);
        let params = RetrievalParams {
            rerank_top_k: 2,
            relevance_threshold: Some(0.5),
            ..RetrievalParams::default()
        };
        let out = block_on(retriever.retrieve("question", &params)).unwrap();
        assert_eq!(ids(&out), vec!["c1", "c2"]);
        assert!(!out.reranked);
        assert_eq!(out.stage1_candidates, 3);
    }

    #[test]
    fn test_rerank_reorders_candidates() {
        let store = three_candidates();
        let emb = embedder();
        let reranker = rerank_scores();
        let retriever = Retriever::new(&store, &emb).with_reranker(Some(&reranker));
        let params = RetrievalParams {
            use_reranking: true,
            ..RetrievalParams::default()
        };
        let out = block_on(retriever.retrieve("question", &params)).unwrap();
        assert!(out.reranked);
        assert_eq!(ids(&out), vec!["c2", "c1", "c3"]);
        assert_eq!(out.results[0].initial_rank, 2);
        assert!((out.results[0].similarity - 0.85).abs() < 1e-4);
        assert!((out.results[0].score - 0.95).abs() < 1e-6);

        let audit = out.audit();
        assert_eq!(audit[0].rank_change(), 1);
        assert_eq!(audit[1].rank_change(), -1);
    }

    #[test]
    fn test_rerank_threshold_applies_to_rerank_scores() {
        let store = three_candidates();
        let emb = embedder();
        let reranker = rerank_scores();
        let retriever = Retriever::new(&store, &emb).with_reranker(Some(&reranker));
        let params = RetrievalParams {
            use_reranking: true,
            relevance_threshold: Some(0.2),
            ..RetrievalParams::default()
        };
        let out = block_on(retriever.retrieve("question", &params)).unwrap();
        assert_eq!(ids(&out), vec!["c2", "c1"]);
    }

    #[test]
    fn test_failing_or_missing_reranker_falls_back() {
        let store = three_candidates();
        let emb = embedder();
        let params = RetrievalParams {
            use_reranking: true,
            ..RetrievalParams::default()
        };

        let failing = FailingReranker;
        let retriever = Retriever::new(&store, &emb).with_reranker(Some(&failing));
        let out = block_on(retriever.retrieve("question", &params)).unwrap();
        assert!(!out.reranked);
        assert_eq!(ids(&out), vec!["c1", "c2", "c3"]);

        let retriever = Retriever::new(&store, &emb);
        let out = block_on(retriever.retrieve("question", &params)).unwrap();
        assert!(!out.reranked);
        assert_eq!(ids(&out), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_empty_query_and_empty_index() {
        let emb = embedder();
        let store = InMemoryStore::new();
        let retriever = Retriever::new(&store, &emb);
        let out = block_on(retriever.retrieve("   ", &RetrievalParams::default())).unwrap();
        assert!(out.results.is_empty());
        assert_eq!(emb.1.load(Ordering::SeqCst), 0);

        let out = block_on(retriever.retrieve("anything", &RetrievalParams::default())).unwrap();
        assert!(out.results.is_empty());
        assert_eq!(out.stage1_candidates, 0);
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mk = |id: &str, score: f32| RetrievalResult {
            chunk_id: id.into(),
            score,
            similarity: score,
            initial_rank: 0,
            text: String::new(),
            source_path: String::new(),
            ordinal: 0,
        };
        let mut v = vec![mk("a", 0.9), mk("b", 0.8), mk("a", 0.7)];
        dedup_by_chunk_id(&mut v);
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].score, 0.9);
    }
}
