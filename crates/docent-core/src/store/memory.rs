//! In-memory [`Store`] implementation for tests and embedding in other hosts.
//!
//! All state sits behind one `std::sync::RwLock`, so an upsert replaces a
//! path's chunks and fingerprint under a single write guard. No guard is
//! held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::error::PipelineError;
use crate::models::{DocumentFingerprint, EmbeddedChunk, RetrievalResult};

use super::{rank_by_similarity, validate_query, validate_upsert, IndexStats, Store};

#[derive(Default)]
struct State {
    dims: Option<usize>,
    fingerprints: BTreeMap<String, DocumentFingerprint>,
    chunks: BTreeMap<String, Vec<EmbeddedChunk>>,
}

/// In-memory store. Vector search is brute-force cosine similarity.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    /// A store whose dimensionality is fixed by the first upsert.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// A store that only accepts vectors of `dims` length.
    pub fn with_dims(dims: usize) -> Self {
        Self {
            state: RwLock::new(State {
                dims: Some(dims),
                ..State::default()
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn dims(&self) -> Result<Option<usize>> {
        Ok(self.read()?.dims)
    }

    async fn get_fingerprint(&self, path: &str) -> Result<Option<DocumentFingerprint>> {
        Ok(self.read()?.fingerprints.get(path).cloned())
    }

    async fn list_fingerprints(&self) -> Result<Vec<DocumentFingerprint>> {
        Ok(self.read()?.fingerprints.values().cloned().collect())
    }

    async fn upsert_source(
        &self,
        fingerprint: &DocumentFingerprint,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        let mut state = self.write()?;
        validate_upsert(fingerprint, chunks, state.dims)?;
        if state.dims.is_none() {
            state.dims = chunks.first().map(|c| c.vector.len());
        }
        state
            .chunks
            .insert(fingerprint.path.clone(), chunks.to_vec());
        state
            .fingerprints
            .insert(fingerprint.path.clone(), fingerprint.clone());
        Ok(())
    }

    async fn delete_by_source(&self, path: &str) -> Result<usize> {
        let mut state = self.write()?;
        state.fingerprints.remove(path);
        Ok(state.chunks.remove(path).map(|c| c.len()).unwrap_or(0))
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>> {
        let state = self.read()?;
        validate_query(query, state.dims)?;
        Ok(rank_by_similarity(query, state.chunks.values().flatten(), k))
    }

    async fn chunks_for_source(&self, path: &str) -> Result<Vec<EmbeddedChunk>> {
        let state = self.read()?;
        let mut chunks = state.chunks.get(path).cloned().unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk.ordinal);
        Ok(chunks)
    }

    async fn verify_integrity(&self) -> Result<()> {
        let state = self.read()?;
        for (path, fp) in &state.fingerprints {
            let stored = state.chunks.get(path).map(|c| c.len()).unwrap_or(0);
            if stored as i64 != fp.chunk_count {
                return Err(PipelineError::Consistency(format!(
                    "{}: fingerprint records {} chunks, index holds {}",
                    path, fp.chunk_count, stored
                ))
                .into());
            }
        }
        for (path, chunks) in &state.chunks {
            if !state.fingerprints.contains_key(path) {
                return Err(
                    PipelineError::Consistency(format!("{}: chunks without a fingerprint", path))
                        .into(),
                );
            }
            if let Some(d) = state.dims {
                if let Some(bad) = chunks.iter().find(|c| c.vector.len() != d) {
                    return Err(PipelineError::Consistency(format!(
                        "{}: chunk {} has {} dims, index expects {}",
                        path,
                        bad.chunk.id,
                        bad.vector.len(),
                        d
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.read()?;
        Ok(IndexStats {
            sources: state.fingerprints.len(),
            chunks: state.chunks.values().map(Vec::len).sum(),
            dims: state.dims,
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        state.fingerprints.clear();
        state.chunks.clear();
        Ok(())
    }
}
