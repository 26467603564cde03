//! Storage abstraction for the vector index and fingerprint registry.
//!
//! The [`Store`] trait is the only persistent shared state of the
//! pipeline. Implementations must make [`upsert_source`](Store::upsert_source)
//! atomic per source path: a concurrent reader sees either the old chunk
//! set and fingerprint or the new ones, never a mix.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::cmp::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::cosine_similarity;
use crate::error::PipelineError;
use crate::models::{DocumentFingerprint, EmbeddedChunk, RetrievalResult};

/// Index totals for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub sources: usize,
    pub chunks: usize,
    pub dims: Option<usize>,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`dims`](Store::dims) | Index dimensionality, once known |
/// | [`get_fingerprint`](Store::get_fingerprint) | Stored fingerprint for a path |
/// | [`list_fingerprints`](Store::list_fingerprints) | All fingerprints, sorted by path |
/// | [`upsert_source`](Store::upsert_source) | Replace a path's chunks and commit its fingerprint |
/// | [`delete_by_source`](Store::delete_by_source) | Remove a path's chunks and fingerprint |
/// | [`search`](Store::search) | Top-k cosine similarity search |
/// | [`chunks_for_source`](Store::chunks_for_source) | A path's chunks in ordinal order |
/// | [`verify_integrity`](Store::verify_integrity) | Detect partial writes and dimension drift |
/// | [`stats`](Store::stats) | Totals for status output |
/// | [`clear`](Store::clear) | Drop every chunk and fingerprint |
#[async_trait]
pub trait Store: Send + Sync {
    /// Dimensionality of stored vectors, `None` while the index is empty
    /// and unconfigured.
    async fn dims(&self) -> Result<Option<usize>>;

    async fn get_fingerprint(&self, path: &str) -> Result<Option<DocumentFingerprint>>;

    async fn list_fingerprints(&self) -> Result<Vec<DocumentFingerprint>>;

    /// Atomically replace all chunks for `fingerprint.path` with `chunks`
    /// and record `fingerprint`.
    ///
    /// Fails with [`PipelineError::Consistency`] (writing nothing) if any
    /// vector's length differs from the index dimensionality or a chunk
    /// belongs to another path.
    async fn upsert_source(
        &self,
        fingerprint: &DocumentFingerprint,
        chunks: &[EmbeddedChunk],
    ) -> Result<()>;

    /// Remove a path's chunks and fingerprint. Returns the number of
    /// chunks removed.
    async fn delete_by_source(&self, path: &str) -> Result<usize>;

    /// At most `k` results by descending cosine similarity, ties broken by
    /// ascending chunk id.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>>;

    async fn chunks_for_source(&self, path: &str) -> Result<Vec<EmbeddedChunk>>;

    /// Fails with [`PipelineError::Consistency`] if a fingerprint's chunk
    /// count disagrees with its stored chunks, a chunk has no fingerprint,
    /// or a vector has the wrong dimensionality.
    async fn verify_integrity(&self) -> Result<()>;

    async fn stats(&self) -> Result<IndexStats>;

    async fn clear(&self) -> Result<()>;
}

/// Check a batch before it is written. Shared by every backend so that
/// they reject exactly the same inputs.
pub fn validate_upsert(
    fingerprint: &DocumentFingerprint,
    chunks: &[EmbeddedChunk],
    dims: Option<usize>,
) -> Result<()> {
    if fingerprint.chunk_count != chunks.len() as i64 {
        return Err(PipelineError::Consistency(format!(
            "{}: fingerprint records {} chunks but {} were supplied",
            fingerprint.path,
            fingerprint.chunk_count,
            chunks.len()
        ))
        .into());
    }
    let expected = dims.or_else(|| chunks.first().map(|c| c.vector.len()));
    for ec in chunks {
        if ec.chunk.source_path != fingerprint.path {
            return Err(PipelineError::Consistency(format!(
                "chunk {} belongs to {}, not {}",
                ec.chunk.id, ec.chunk.source_path, fingerprint.path
            ))
            .into());
        }
        if Some(ec.vector.len()) != expected || ec.vector.is_empty() {
            return Err(PipelineError::Consistency(format!(
                "{}: vector for chunk {} has {} dims, index expects {}",
                fingerprint.path,
                ec.chunk.ordinal,
                ec.vector.len(),
                expected.unwrap_or(0)
            ))
            .into());
        }
    }
    Ok(())
}

/// Check a query vector against the index dimensionality.
pub fn validate_query(query: &[f32], dims: Option<usize>) -> Result<()> {
    match dims {
        Some(d) if d != query.len() => Err(PipelineError::Consistency(format!(
            "query vector has {} dims, index expects {}",
            query.len(),
            d
        ))
        .into()),
        _ => Ok(()),
    }
}

/// Brute-force top-k over `(chunk, vector)` pairs.
///
/// Returns results with `score == similarity` and 1-based `initial_rank`.
pub fn rank_by_similarity<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<RetrievalResult>
where
    I: IntoIterator<Item = &'a EmbeddedChunk>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(f32, &EmbeddedChunk)> = candidates
        .into_iter()
        .map(|ec| (cosine_similarity(query, &ec.vector), ec))
        .collect();
    scored.sort_by(|a, b| compare_scored(a.0, &a.1.chunk.id, b.0, &b.1.chunk.id));
    scored.truncate(k);
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (sim, ec))| RetrievalResult {
            chunk_id: ec.chunk.id.clone(),
            score: sim,
            similarity: sim,
            initial_rank: i + 1,
            text: ec.chunk.text.clone(),
            source_path: ec.chunk.source_path.clone(),
            ordinal: ec.chunk.ordinal,
        })
        .collect()
}

/// Descending score, then ascending id. NaN sorts last.
pub fn compare_scored(score_a: f32, id_a: &str, score_b: f32, id_b: &str) -> Ordering {
    let by_score = match (score_a.is_nan(), score_b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => score_b.partial_cmp(&score_a).unwrap_or(Ordering::Equal),
    };
    by_score.then_with(|| id_a.cmp(id_b))
}
