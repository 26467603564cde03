//! Incremental ingestion.
//!
//! ```text
//! scan root ─▶ fingerprint ─▶ extract ─▶ chunk ─▶ embed ─▶ upsert_source
//!               (skip if unchanged)                       (one transaction:
//!                                                          chunks + fingerprint)
//! ```
//!
//! Files are processed by a bounded pool of tokio tasks. Each file is
//! bounded by `[ingest] file_timeout_secs` and fails on its own: its error
//! goes into the summary and the other files carry on. Because the
//! fingerprint is only committed together with the file's chunks, a file
//! that fails or times out keeps its previous chunks and previous hash and
//! is picked up again by the next run.
//!
//! Consistency failures (wrong dimensionality, partial writes) are not
//! isolated: they stop the run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use docent_core::chunk::chunk_document;
use docent_core::embedding::EmbeddingProvider;
use docent_core::error::{is_consistency, PipelineError};
use docent_core::fingerprint::FingerprintRegistry;
use docent_core::models::{EmbeddedChunk, FileStatus, IngestError, IngestionSummary};
use docent_core::store::Store;

use crate::config::{Config, IngestConfig};
use crate::extract::extract_text;
use crate::file_source::{scan, SourceFile};

/// Parameters of one ingestion run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOptions {
    pub source_root: PathBuf,
    pub chunk_size: usize,
    pub overlap: usize,
    pub top_k_stage1: usize,
    pub rerank_top_k: usize,
    pub max_memory_messages: usize,
    /// Treat every file as changed.
    pub full: bool,
    /// Report what would happen without embedding or writing.
    pub dry_run: bool,
    pub workers: usize,
}

impl IngestOptions {
    /// Options from configuration. `root` overrides `[ingest] root`.
    pub fn from_config(config: &Config, root: Option<PathBuf>) -> Result<Self> {
        let source_root = root.or_else(|| config.ingest.root.clone()).ok_or_else(|| {
            anyhow::anyhow!("No ingestion root: pass --root or set [ingest] root in the config")
        })?;
        Ok(Self {
            source_root,
            chunk_size: config.chunking.chunk_size,
            overlap: config.chunking.chunk_overlap,
            top_k_stage1: config.retrieval.top_k_stage1,
            rerank_top_k: config.retrieval.rerank_top_k,
            max_memory_messages: config.memory.max_memory_messages,
            full: false,
            dry_run: false,
            workers: config.ingest.workers,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(PipelineError::Validation(msg).into()) };
        if self.chunk_size == 0 {
            return invalid("chunk_size must be > 0".into());
        }
        if self.overlap >= self.chunk_size {
            return invalid(format!(
                "overlap ({}) must be less than chunk_size ({})",
                self.overlap, self.chunk_size
            ));
        }
        if self.rerank_top_k == 0 || self.top_k_stage1 < self.rerank_top_k {
            return invalid(format!(
                "need top_k_stage1 ({}) >= rerank_top_k ({}) >= 1",
                self.top_k_stage1, self.rerank_top_k
            ));
        }
        if self.max_memory_messages == 0 {
            return invalid("max_memory_messages must be >= 1".into());
        }
        if self.workers == 0 {
            return invalid("workers must be >= 1".into());
        }
        Ok(())
    }
}

/// Settings a run was performed with, echoed back in the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveSettings {
    pub source_root: String,
    pub chunk_size: usize,
    pub overlap: usize,
    pub top_k_stage1: usize,
    pub rerank_top_k: usize,
    pub max_memory_messages: usize,
    pub embedding_model: String,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    #[serde(flatten)]
    pub summary: IngestionSummary,
    pub settings: EffectiveSettings,
}

enum FileOutcome {
    Skipped,
    Processed { status: FileStatus, chunks: usize },
}

/// Run one ingestion over `options.source_root`.
pub async fn ingest(
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: &IngestOptions,
    ingest_config: &IngestConfig,
) -> Result<IngestReport> {
    options.validate()?;
    if !options.dry_run && embedder.dims() == 0 {
        bail!("Embeddings are disabled; set [embedding] provider to ingest documents");
    }
    if let Some(dims) = store.dims().await? {
        if !options.dry_run && dims != embedder.dims() {
            return Err(PipelineError::Consistency(format!(
                "index holds {}-dimensional vectors but {} produces {}",
                dims,
                embedder.model_name(),
                embedder.dims()
            ))
            .into());
        }
    }
    store
        .verify_integrity()
        .await
        .context("index failed integrity check; run `docent reset` to rebuild")?;

    let files = scan(&options.source_root, ingest_config)?;
    tracing::info!(
        root = %options.source_root.display(),
        files = files.len(),
        dry_run = options.dry_run,
        full = options.full,
        "starting ingestion"
    );

    let mut summary = IngestionSummary {
        total_files_scanned: files.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    let job = Arc::new(FileJob {
        chunk_size: options.chunk_size,
        overlap: options.overlap,
        full: options.full,
        dry_run: options.dry_run,
    });
    let timeout = Duration::from_secs(ingest_config.file_timeout_secs);
    let semaphore = Arc::new(Semaphore::new(options.workers));
    let mut tasks = JoinSet::new();

    for file in files.iter().cloned() {
        let store = store.clone();
        let embedder = embedder.clone();
        let job = job.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = match tokio::time::timeout(
                timeout,
                job.run(store.as_ref(), embedder.as_ref(), &file),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(timeout).into()),
            };
            (file.path, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (path, result) = joined.context("ingestion worker panicked")?;
        match result {
            Ok(FileOutcome::Skipped) => {
                tracing::debug!(path = %path, "unchanged, skipping");
                summary.skipped_files += 1;
                summary.skipped.push(path);
            }
            Ok(FileOutcome::Processed { status, chunks }) => {
                tracing::info!(path = %path, status = ?status, chunks, "ingested");
                match status {
                    FileStatus::New => summary.new_files_processed += 1,
                    _ => summary.changed_files_processed += 1,
                }
                summary.chunks_created += chunks;
                summary.processed.push(path);
            }
            Err(e) if is_consistency(&e) => {
                tracing::error!(path = %path, error = %format!("{:#}", e), "index consistency failure, aborting run");
                tasks.abort_all();
                return Err(e.context(format!("ingesting {}", path)));
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %format!("{:#}", e), "file failed");
                summary.errors.push(IngestError {
                    path,
                    message: format!("{:#}", e),
                });
            }
        }
    }

    let scanned: std::collections::HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
    for fp in store.list_fingerprints().await? {
        if scanned.contains(fp.path.as_str()) {
            continue;
        }
        if !ingest_config.prune_removed {
            tracing::warn!(path = %fp.path, "source file missing, keeping its chunks");
            summary.orphaned.push(fp.path);
            continue;
        }
        if !options.dry_run {
            let removed = store.delete_by_source(&fp.path).await?;
            tracing::info!(path = %fp.path, chunks = removed, "source file removed, pruned");
        }
        summary.removed_files += 1;
        summary.removed.push(fp.path);
    }

    summary.processed.sort();
    summary.skipped.sort();
    summary.errors.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::info!(
        scanned = summary.total_files_scanned,
        new = summary.new_files_processed,
        changed = summary.changed_files_processed,
        skipped = summary.skipped_files,
        removed = summary.removed_files,
        chunks = summary.chunks_created,
        errors = summary.errors.len(),
        "ingestion finished"
    );

    Ok(IngestReport {
        summary,
        settings: EffectiveSettings {
            source_root: options.source_root.display().to_string(),
            chunk_size: options.chunk_size,
            overlap: options.overlap,
            top_k_stage1: options.top_k_stage1,
            rerank_top_k: options.rerank_top_k,
            max_memory_messages: options.max_memory_messages,
            embedding_model: embedder.model_name().to_string(),
            workers: options.workers,
        },
    })
}

struct FileJob {
    chunk_size: usize,
    overlap: usize,
    full: bool,
    dry_run: bool,
}

impl FileJob {
    async fn run(
        &self,
        store: &dyn Store,
        embedder: &dyn EmbeddingProvider,
        file: &SourceFile,
    ) -> Result<FileOutcome> {
        let bytes = file.read().await?;
        let staged = FingerprintRegistry::new(store)
            .force_all(self.full)
            .check_and_record(&file.path, &bytes)
            .await?;
        if staged.is_unchanged() {
            return Ok(FileOutcome::Skipped);
        }

        let content_type = file.content_type;
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, content_type))
            .await?
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(PipelineError::Validation("document has no text".into()).into());
        }

        let chunks = chunk_document(&file.path, &text, self.chunk_size, self.overlap)?;
        let status = staged.status;
        if self.dry_run {
            return Ok(FileOutcome::Processed {
                status,
                chunks: chunks.len(),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await.context("embedding chunks")?;
        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();

        let count = embedded.len();
        let fingerprint = staged.into_fingerprint(count, chrono::Utc::now().timestamp());
        store.upsert_source(&fingerprint, &embedded).await?;
        Ok(FileOutcome::Processed {
            status,
            chunks: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(root: PathBuf) -> IngestOptions {
        IngestOptions {
            source_root: root,
            chunk_size: 1000,
            overlap: 200,
            top_k_stage1: 50,
            rerank_top_k: 5,
            max_memory_messages: 5,
            full: false,
            dry_run: false,
            workers: 2,
        }
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let base = options(PathBuf::from("."));
        assert!(base.validate().is_ok());

        let mut o = base.clone();
        o.overlap = 1000;
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.top_k_stage1 = 3;
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.workers = 0;
        assert!(o.validate().is_err());

        let mut o = base;
        o.max_memory_messages = 0;
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_from_config_requires_root() {
        let config = crate::config::parse_config("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert!(IngestOptions::from_config(&config, None).is_err());
        let o = IngestOptions::from_config(&config, Some(PathBuf::from("docs"))).unwrap();
        assert_eq!(o.chunk_size, 1000);
        assert_eq!(o.overlap, 200);
    }
}
