//! Generation capability and answer interpretation.
//!
//! The orchestrator never throws on "not enough context": a reply is
//! always classified into an [`Answer`], which is either grounded in the
//! supplied passages (with sources) or explicitly ungrounded (with a
//! reason and no sources).

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::error::PipelineError;
use crate::prompt::{Passage, PromptSections};

/// A text generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &PromptSections) -> Result<String>;
}

/// Why an answer carries no sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UngroundedReason {
    /// The caller turned retrieval off for this message.
    KnowledgeBaseDisabled,
    /// Retrieval ran but nothing cleared the relevance cutoff.
    NoRelevantContext,
    /// Passages were supplied but the model said they were insufficient.
    ModelDeclined,
}

/// Outcome of one orchestrated generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    Grounded {
        content: String,
        sources: Vec<String>,
    },
    Ungrounded {
        content: String,
        reason: UngroundedReason,
    },
}

impl Answer {
    pub fn content(&self) -> &str {
        match self {
            Answer::Grounded { content, .. } | Answer::Ungrounded { content, .. } => content,
        }
    }

    /// Source paths, empty unless grounded.
    pub fn sources(&self) -> &[String] {
        match self {
            Answer::Grounded { sources, .. } => sources,
            Answer::Ungrounded { .. } => &[],
        }
    }

    pub fn is_grounded(&self) -> bool {
        matches!(self, Answer::Grounded { .. })
    }
}

/// Passage numbers cited as `Source N` in `content`, in first-citation
/// order, deduplicated. Also returns cited numbers with no matching
/// passage.
pub fn cited_passages(content: &str, passage_count: usize) -> (Vec<usize>, Vec<usize>) {
    const MARKER: &str = "Source ";
    let mut cited = Vec::new();
    let mut out_of_range = Vec::new();
    let mut rest = content;
    while let Some(pos) = rest.find(MARKER) {
        rest = &rest[pos + MARKER.len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let Ok(n) = digits.parse::<usize>() else {
            continue;
        };
        let seen = if (1..=passage_count).contains(&n) {
            &mut cited
        } else {
            &mut out_of_range
        };
        if !seen.contains(&n) {
            seen.push(n);
        }
    }
    (cited, out_of_range)
}

fn dedup_paths<'a>(paths: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for p in paths {
        if !out.iter().any(|s| s == p) {
            out.push(p.to_string());
        }
    }
    out
}

fn is_decline(content: &str) -> bool {
    let normalized = content.replace('\u{2019}', "'").to_lowercase();
    normalized.contains("don't have enough information in my knowledge base")
}

/// Classify a raw model reply.
///
/// Fails with [`PipelineError::Validation`] if the reply is empty. The
/// reply text is returned trimmed but otherwise unaltered.
pub fn interpret_reply(raw: &str, prompt: &PromptSections) -> Result<Answer> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(PipelineError::Validation("generation returned an empty reply".into()).into());
    }
    let content = content.to_string();

    if !prompt.use_knowledge_base {
        return Ok(Answer::Ungrounded {
            content,
            reason: UngroundedReason::KnowledgeBaseDisabled,
        });
    }
    if prompt.passages.is_empty() {
        return Ok(Answer::Ungrounded {
            content,
            reason: UngroundedReason::NoRelevantContext,
        });
    }
    if is_decline(&content) {
        return Ok(Answer::Ungrounded {
            content,
            reason: UngroundedReason::ModelDeclined,
        });
    }

    let (cited, out_of_range) = cited_passages(&content, prompt.passages.len());
    if !out_of_range.is_empty() {
        tracing::warn!(
            markers = ?out_of_range,
            passages = prompt.passages.len(),
            "reply cites sources that were not supplied"
        );
    }
    let sources = if cited.is_empty() {
        dedup_paths(prompt.passages.iter().map(|p| p.source_path.as_str()))
    } else {
        let cited: Vec<&Passage> = cited.iter().filter_map(|n| prompt.passages.get(n - 1)).collect();
        dedup_paths(cited.iter().map(|p| p.source_path.as_str()))
    };
    Ok(Answer::Grounded { content, sources })
}
