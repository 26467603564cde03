//! Re-ranking capability and the re-ranking audit record.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A second-stage relevance scorer (e.g. a cross-encoder).
///
/// `score` returns one score per candidate, in candidate order. Higher is
/// more relevant. The scale is backend-specific.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Where one passage landed after re-ranking.
///
/// Stored as JSON on the assistant message so that re-ranking decisions can
/// be inspected after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankAuditEntry {
    pub chunk_id: String,
    pub source_path: String,
    pub initial_rank: usize,
    pub final_rank: usize,
    pub similarity: f32,
    pub score: f32,
}

impl RerankAuditEntry {
    /// Positive when the passage moved up.
    pub fn rank_change(&self) -> i64 {
        self.initial_rank as i64 - self.final_rank as i64
    }
}
