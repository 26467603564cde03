//! Enumerates the documents under an ingestion root.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::extract::content_type_for;

/// A document found under the ingestion root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the root, forward slashes. This is the key the
    /// fingerprint registry and the vector index use.
    pub path: String,
    pub abs_path: PathBuf,
    pub content_type: &'static str,
}

impl SourceFile {
    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.abs_path)
            .await
            .with_context(|| format!("reading {}", self.abs_path.display()))
    }
}

/// Walk `root`, keep files matching the include globs and none of the
/// exclude globs, and return them sorted by relative path. Files whose
/// extension has no extractor are skipped.
pub fn scan(root: &Path, config: &IngestConfig) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Ingestion root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let abs_path = entry.path();
        let relative = abs_path.strip_prefix(root).unwrap_or(abs_path);
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
            continue;
        }
        let Some(content_type) = content_type_for(abs_path) else {
            tracing::debug!(path = %rel, "no extractor for file type, skipping");
            continue;
        };
        files.push(SourceFile {
            path: rel,
            abs_path: abs_path.to_path_buf(),
            content_type,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}
