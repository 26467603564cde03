//! Content fingerprinting for incremental ingestion.
//!
//! [`FingerprintRegistry::check_and_record`] compares a file's SHA-256
//! against the fingerprint stored in the index and returns a [`Staged`]
//! verdict. Nothing is written here: a `New` or `Changed` verdict carries
//! the pending fingerprint, which only becomes durable when the caller
//! hands it to [`Store::upsert_source`] together with the file's new
//! chunks. A failure anywhere before that call leaves the old hash in
//! place, so the file is retried on the next run.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::models::{DocumentFingerprint, FileStatus};
use crate::store::Store;

/// Lower-case hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Verdict for one scanned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    pub status: FileStatus,
    pub path: String,
    pub content_hash: String,
    /// Fingerprint currently in the index, if any.
    pub previous: Option<DocumentFingerprint>,
}

impl Staged {
    pub fn is_unchanged(&self) -> bool {
        self.status == FileStatus::Unchanged
    }

    /// Build the fingerprint to commit once the file's chunks are embedded.
    pub fn into_fingerprint(self, chunk_count: usize, ingested_at: i64) -> DocumentFingerprint {
        DocumentFingerprint {
            path: self.path,
            content_hash: self.content_hash,
            chunk_count: chunk_count as i64,
            last_ingested_at: ingested_at,
        }
    }
}

/// Read side of the fingerprint registry, backed by a [`Store`].
pub struct FingerprintRegistry<'a> {
    store: &'a dyn Store,
    force: bool,
}

impl<'a> FingerprintRegistry<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store, force: false }
    }

    /// Report every previously seen file as `Changed` (full re-ingestion).
    pub fn force_all(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Hash `content` and compare it with the stored fingerprint for `path`.
    pub async fn check_and_record(&self, path: &str, content: &[u8]) -> Result<Staged> {
        let content_hash = sha256_hex(content);
        let previous = self.store.get_fingerprint(path).await?;
        let status = match &previous {
            None => FileStatus::New,
            Some(_) if self.force => FileStatus::Changed,
            Some(fp) if fp.content_hash == content_hash => FileStatus::Unchanged,
            Some(_) => FileStatus::Changed,
        };
        Ok(Staged {
            status,
            path: path.to_string(),
            content_hash,
            previous,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, EmbeddedChunk};
    use crate::store::memory::InMemoryStore;
    use futures::executor::block_on;

    fn one_chunk(path: &str) -> Vec<EmbeddedChunk> {
        vec![EmbeddedChunk {
            chunk: Chunk {
                id: format!("{}-0", path),
                source_path: path.to_string(),
                ordinal: 0,
                text: "body".into(),
                start_char: 0,
                end_char: 4,
                hash: sha256_hex(b"body"),
            },
            vector: vec![1.0, 0.0],
        }]
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_new_changed_unchanged() {
        block_on(async {
            let store = InMemoryStore::new();
            let registry = FingerprintRegistry::new(&store);

            let staged = registry.check_and_record("a.md", b"v1").await.unwrap();
            assert_eq!(staged.status, FileStatus::New);
            assert!(staged.previous.is_none());

            // Nothing is recorded until the upsert commits.
            let again = registry.check_and_record("a.md", b"v1").await.unwrap();
            assert_eq!(again.status, FileStatus::New);

            store
                .upsert_source(&staged.into_fingerprint(1, 10), &one_chunk("a.md"))
                .await
                .unwrap();

            let same = registry.check_and_record("a.md", b"v1").await.unwrap();
            assert!(same.is_unchanged());

            let changed = registry.check_and_record("a.md", b"v2").await.unwrap();
            assert_eq!(changed.status, FileStatus::Changed);
            assert_eq!(changed.previous.unwrap().chunk_count, 1);
        });
    }

    #[test]
    fn test_force_marks_known_files_changed() {
        block_on(async {
            let store = InMemoryStore::new();
            let staged = FingerprintRegistry::new(&store)
                .check_and_record("a.md", b"v1")
                .await
                .unwrap();
            store
                .upsert_source(&staged.into_fingerprint(1, 10), &one_chunk("a.md"))
                .await
                .unwrap();

            let forced = FingerprintRegistry::new(&store).force_all(true);
            let staged = forced.check_and_record("a.md", b"v1").await.unwrap();
            assert_eq!(staged.status, FileStatus::Changed);
            let fresh = forced.check_and_record("b.md", b"x").await.unwrap();
            assert_eq!(fresh.status, FileStatus::New);
        });
    }
}
