//! SQLite-backed [`Store`] implementation.
//!
//! Chunks and their vectors live in one `chunks` table (vector as a
//! little-endian f32 BLOB); fingerprints live in `fingerprints`. Every
//! `upsert_source` runs in a single transaction, so with WAL enabled a
//! concurrent search sees either the old or the new chunk set for a path.
//! Search is brute-force cosine similarity over all stored vectors.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docent_core::embedding::{blob_to_vec, vec_to_blob};
use docent_core::error::PipelineError;
use docent_core::models::{Chunk, DocumentFingerprint, EmbeddedChunk, RetrievalResult};
use docent_core::store::{
    rank_by_similarity, validate_query, validate_upsert, IndexStats, Store,
};

const META_DIMS: &str = "dims";
const META_MODEL: &str = "embedding_model";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the index for a given embedding configuration.
    ///
    /// Records `dims` and `model` on first use. Fails with
    /// [`PipelineError::Consistency`] if the index was built with a
    /// different dimensionality or model.
    pub async fn open(pool: SqlitePool, dims: Option<usize>, model: Option<&str>) -> Result<Self> {
        let store = Self::new(pool);
        if let Some(d) = dims {
            match store.meta(META_DIMS).await? {
                Some(stored) if stored != d.to_string() => {
                    return Err(PipelineError::Consistency(format!(
                        "index was built with {} dimensions but embedding.dims is {}; run `docent reset` to rebuild",
                        stored, d
                    ))
                    .into());
                }
                Some(_) => {}
                None => store.set_meta(META_DIMS, &d.to_string()).await?,
            }
        }
        if let Some(m) = model {
            match store.meta(META_MODEL).await? {
                Some(stored) if stored != m => {
                    return Err(PipelineError::Consistency(format!(
                        "index was built with embedding model '{}' but '{}' is configured; run `docent reset` to rebuild",
                        stored, m
                    ))
                    .into());
                }
                Some(_) => {}
                None => store.set_meta(META_MODEL, m).await?,
            }
        }
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Embedding model the index was built with, if recorded.
    pub async fn model(&self) -> Result<Option<String>> {
        self.meta(META_MODEL).await
    }

    async fn meta(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_fingerprint(row: &SqliteRow) -> DocumentFingerprint {
    DocumentFingerprint {
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        chunk_count: row.get("chunk_count"),
        last_ingested_at: row.get("last_ingested_at"),
    }
}

fn row_to_embedded_chunk(row: &SqliteRow) -> EmbeddedChunk {
    let blob: Vec<u8> = row.get("embedding");
    EmbeddedChunk {
        chunk: Chunk {
            id: row.get("id"),
            source_path: row.get("source_path"),
            ordinal: row.get("ordinal"),
            text: row.get("text"),
            start_char: row.get("start_char"),
            end_char: row.get("end_char"),
            hash: row.get("hash"),
        },
        vector: blob_to_vec(&blob),
    }
}

fn parse_dims(value: Option<String>) -> Result<Option<usize>> {
    value
        .map(|v| {
            v.parse::<usize>().map_err(|_| {
                anyhow::Error::from(PipelineError::Consistency(format!(
                    "index_meta dims is not a number: {}",
                    v
                )))
            })
        })
        .transpose()
}

#[async_trait]
impl Store for SqliteStore {
    async fn dims(&self) -> Result<Option<usize>> {
        parse_dims(self.meta(META_DIMS).await?)
    }

    async fn get_fingerprint(&self, path: &str) -> Result<Option<DocumentFingerprint>> {
        let row = sqlx::query(
            "SELECT path, content_hash, chunk_count, last_ingested_at FROM fingerprints WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_fingerprint))
    }

    async fn list_fingerprints(&self) -> Result<Vec<DocumentFingerprint>> {
        let rows = sqlx::query(
            "SELECT path, content_hash, chunk_count, last_ingested_at FROM fingerprints ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_fingerprint).collect())
    }

    async fn upsert_source(
        &self,
        fingerprint: &DocumentFingerprint,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Write first: a deferred transaction that reads before its first
        // write fails with SQLITE_BUSY when another writer commits in
        // between, and the busy handler does not retry that case.
        sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(&fingerprint.path)
            .execute(&mut *tx)
            .await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(META_DIMS)
                .fetch_optional(&mut *tx)
                .await?;
        let dims = parse_dims(stored)?;
        validate_upsert(fingerprint, chunks, dims)?;
        if dims.is_none() {
            if let Some(first) = chunks.first() {
                sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
                    .bind(META_DIMS)
                    .bind(first.vector.len().to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for ec in chunks {
            let c = &ec.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_path, ordinal, text, start_char, end_char, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.id)
            .bind(&c.source_path)
            .bind(c.ordinal)
            .bind(&c.text)
            .bind(c.start_char)
            .bind(c.end_char)
            .bind(&c.hash)
            .bind(vec_to_blob(&ec.vector))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO fingerprints (path, content_hash, chunk_count, last_ingested_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                last_ingested_at = excluded.last_ingested_at
            "#,
        )
        .bind(&fingerprint.path)
        .bind(&fingerprint.content_hash)
        .bind(fingerprint.chunk_count)
        .bind(fingerprint.last_ingested_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_source(&self, path: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM fingerprints WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>> {
        validate_query(query, self.dims().await?)?;
        let rows = sqlx::query(
            "SELECT id, source_path, ordinal, text, start_char, end_char, hash, embedding FROM chunks",
        )
        .fetch_all(&self.pool)
        .await?;
        let chunks: Vec<EmbeddedChunk> = rows.iter().map(row_to_embedded_chunk).collect();
        Ok(rank_by_similarity(query, &chunks, k))
    }

    async fn chunks_for_source(&self, path: &str) -> Result<Vec<EmbeddedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_path, ordinal, text, start_char, end_char, hash, embedding
            FROM chunks WHERE source_path = ? ORDER BY ordinal
            "#,
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_embedded_chunk).collect())
    }

    async fn verify_integrity(&self) -> Result<()> {
        let mismatched = sqlx::query(
            r#"
            SELECT f.path AS path, f.chunk_count AS expected, COUNT(c.id) AS actual
            FROM fingerprints f
            LEFT JOIN chunks c ON c.source_path = f.path
            GROUP BY f.path, f.chunk_count
            HAVING f.chunk_count != COUNT(c.id)
            ORDER BY f.path
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = mismatched {
            let path: String = row.get("path");
            let expected: i64 = row.get("expected");
            let actual: i64 = row.get("actual");
            return Err(PipelineError::Consistency(format!(
                "{}: fingerprint records {} chunks, index holds {}",
                path, expected, actual
            ))
            .into());
        }

        let orphan: Option<String> = sqlx::query_scalar(
            "SELECT source_path FROM chunks WHERE source_path NOT IN (SELECT path FROM fingerprints) LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some(path) = orphan {
            return Err(
                PipelineError::Consistency(format!("{}: chunks without a fingerprint", path)).into(),
            );
        }

        if let Some(d) = self.dims().await? {
            let bad: Option<String> =
                sqlx::query_scalar("SELECT id FROM chunks WHERE length(embedding) != ? LIMIT 1")
                    .bind((d * 4) as i64)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(id) = bad {
                return Err(PipelineError::Consistency(format!(
                    "chunk {} has a vector of the wrong length, index expects {} dims",
                    id, d
                ))
                .into());
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let sources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fingerprints")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexStats {
            sources: sources as usize,
            chunks: chunks as usize,
            dims: self.dims().await?,
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM fingerprints")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_meta").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
