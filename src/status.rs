//! Ingestion status: what is indexed and when it was last ingested.
//!
//! Used by `docent status` to check that ingestion runs are picking up
//! the expected files.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use docent_core::models::DocumentFingerprint;
use docent_core::store::{IndexStats, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub size_bytes: u64,
    pub embedding_model: Option<String>,
    pub index: IndexStats,
    pub files: Vec<DocumentFingerprint>,
}

/// Collect the report. `model` is the embedding model recorded in the index.
pub async fn collect(
    db_path: &Path,
    store: &dyn Store,
    model: Option<String>,
) -> Result<StatusReport> {
    let size_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    Ok(StatusReport {
        database: db_path.display().to_string(),
        size_bytes,
        embedding_model: model,
        index: store.stats().await?,
        files: store.list_fingerprints().await?,
    })
}

pub fn print_report(report: &StatusReport) {
    println!("docent status");
    println!("=============");
    println!();
    println!("  Database:    {}", report.database);
    println!("  Size:        {}", format_bytes(report.size_bytes));
    println!(
        "  Model:       {}",
        report.embedding_model.as_deref().unwrap_or("(none yet)")
    );
    println!(
        "  Dimensions:  {}",
        report
            .index
            .dims
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  Files:       {}", report.index.sources);
    println!("  Chunks:      {}", report.index.chunks);

    if !report.files.is_empty() {
        println!();
        println!(
            "  {:<48} {:>12} {:>7}   {}",
            "PATH", "HASH", "CHUNKS", "INGESTED"
        );
        println!("  {}", "-".repeat(84));
        for fp in &report.files {
            println!(
                "  {:<48} {:>12} {:>7}   {}",
                fp.path,
                &fp.content_hash[..fp.content_hash.len().min(12)],
                fp.chunk_count,
                format_ts_relative(fp.last_ingested_at)
            );
        }
    }
    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style, falling back to a date after 30 days.
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts(ts)
    }
}

pub fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
