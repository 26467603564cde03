//! Core data models shared across the pipeline.
//!
//! These types flow through every stage: the fingerprint registry tracks
//! [`DocumentFingerprint`]s, the chunker produces [`Chunk`]s, the vector
//! index returns [`RetrievalResult`]s, and the memory window holds
//! [`Turn`]s. An ingestion invocation produces one [`IngestionSummary`].

use serde::{Deserialize, Serialize};

/// Content hash record for one ingested file.
///
/// Unique key is `path` (relative to the ingestion root, forward slashes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub path: String,
    /// Lower-case hex SHA-256 over the raw file bytes.
    pub content_hash: String,
    pub chunk_count: i64,
    /// Unix timestamp (seconds) of the last successful ingestion.
    pub last_ingested_at: i64,
}

/// A bounded span of one document's text.
///
/// Immutable once created; a changed file gets a fresh set of chunks that
/// replaces the previous set as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic UUID v5 over `(source_path, ordinal, hash)`.
    pub id: String,
    pub source_path: String,
    /// Zero-based, contiguous position within the source.
    pub ordinal: i64,
    pub text: String,
    /// Character offset (not byte offset) of `text` in the extracted document.
    pub start_char: i64,
    pub end_char: i64,
    /// SHA-256 hex of `text`.
    pub hash: String,
}

/// A chunk together with its embedding, as handed to the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A retrieved passage.
///
/// `score` is the cosine similarity after stage 1, or the re-rank score if
/// stage 2 ran. The stage-1 values are kept for the re-ranking audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub score: f32,
    pub similarity: f32,
    /// 1-based rank after stage 1.
    pub initial_rank: usize,
    pub text: String,
    pub source_path: String,
    pub ordinal: i64,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a session. Append-only; never edited after it is logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    /// Ordered, deduplicated source paths. Empty for user turns.
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp(),
            sources: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp(),
            sources,
        }
    }
}

/// Fingerprint registry verdict for a scanned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    New,
    Changed,
    Unchanged,
}

/// Per-file failure recorded in an [`IngestionSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestError {
    pub path: String,
    pub message: String,
}

/// Result of one ingestion invocation. Built once, never mutated afterward.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionSummary {
    pub total_files_scanned: usize,
    pub new_files_processed: usize,
    pub changed_files_processed: usize,
    pub skipped_files: usize,
    pub removed_files: usize,
    pub chunks_created: usize,
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
    pub removed: Vec<String>,
    /// Indexed paths missing from the scan that were kept because pruning
    /// is disabled.
    pub orphaned: Vec<String>,
    pub errors: Vec<IngestError>,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_and_display() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("system"), None);
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_turn_serialization_uses_lowercase_role() {
        let t = Turn {
            role: Role::Assistant,
            content: "hi".into(),
            timestamp: 1,
            sources: vec!["a.md".into()],
        };
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["sources"][0], "a.md");
    }

    #[test]
    fn test_user_turn_has_no_sources() {
        assert!(Turn::user("q").sources.is_empty());
    }
}
