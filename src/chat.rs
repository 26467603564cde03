//! The `chat` operation: [`RagEngine::answer`] with a deadline and a
//! fallback that never loses the user's turn.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use docent_core::error::PipelineError;
use docent_core::generation::{Answer, UngroundedReason};
use docent_core::memory::Exchange;
use docent_core::models::Turn;
use docent_core::rerank::RerankAuditEntry;

use crate::rag::{ChatOutcome, RagEngine};

/// Assistant turn recorded when a message could not be answered.
pub const APOLOGY_REPLY: &str =
    "Sorry, I ran into a problem while answering that. Please try again in a moment.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub content: String,
    pub sources: Vec<String>,
    pub grounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ungrounded_reason: Option<UngroundedReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rerank: Vec<RerankAuditEntry>,
    /// Why the apology was returned instead of an answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ChatOutcome> for ChatReply {
    fn from(outcome: ChatOutcome) -> Self {
        let (grounded, ungrounded_reason) = match &outcome.answer {
            Answer::Grounded { .. } => (true, None),
            Answer::Ungrounded { reason, .. } => (false, Some(*reason)),
        };
        Self {
            content: outcome.content().to_string(),
            sources: outcome.sources().to_vec(),
            grounded,
            ungrounded_reason,
            rerank: outcome.rerank,
            error: None,
        }
    }
}

/// Answer one message within `timeout`.
///
/// Any failure after the message was accepted degrades to an apology:
/// the user turn and an apology assistant turn (no sources) are appended
/// and the apology is returned. Errors are returned only when the message
/// is rejected outright (empty, unknown session) or the apology itself
/// cannot be saved.
pub async fn chat(
    engine: &RagEngine,
    session_id: &str,
    message: &str,
    use_knowledge_base: bool,
    use_reranking: bool,
    timeout: Duration,
) -> Result<ChatReply> {
    let message = message.trim();
    if message.is_empty() {
        return Err(PipelineError::Validation("message is empty".into()).into());
    }

    // The deadline stops before the exchange is saved, so a timeout can
    // never leave a half-recorded answer next to the apology.
    let error = match engine
        .answer_within(
            session_id,
            message,
            use_knowledge_base,
            use_reranking,
            Some(timeout),
        )
        .await
    {
        Ok(outcome) => return Ok(outcome.into()),
        Err(e) => e,
    };

    let mut session = match engine.windows().lock(session_id).await {
        Ok(session) => session,
        Err(_) => return Err(error),
    };
    tracing::error!(
        session = session_id,
        error = %format!("{:#}", error),
        "chat failed, replying with apology"
    );
    session
        .append_exchange(Exchange {
            user: Turn::user(message),
            assistant: Turn::assistant(APOLOGY_REPLY, Vec::new()),
            rerank: Vec::new(),
        })
        .await
        .map_err(|e| e.context(format!("saving apology after: {:#}", error)))?;

    Ok(ChatReply {
        content: APOLOGY_REPLY.to_string(),
        sources: Vec::new(),
        grounded: false,
        ungrounded_reason: None,
        rerank: Vec::new(),
        error: Some(format!("{:#}", error)),
    })
}
