//! The RAG orchestrator.
//!
//! [`RagEngine::answer`] runs one user message end to end while holding
//! the session's window guard:
//!
//! 1. read the memory window
//! 2. retrieve passages (if the knowledge base is on)
//! 3. build the prompt: grounding instruction, history, passages, question
//! 4. call the generation backend and classify the reply as
//!    [`Answer::Grounded`] or [`Answer::Ungrounded`]
//! 5. append the user and assistant turns to the session log and window
//!
//! Grounding is requested by the system prompt only. Nothing here checks
//! that the reply is actually supported by the passages; a reply that
//! ignores them is still returned as `Grounded` with the passages' paths.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::time::Instant;

use docent_core::embedding::EmbeddingProvider;
use docent_core::error::PipelineError;
use docent_core::generation::{interpret_reply, Answer, GenerationProvider};
use docent_core::memory::{Exchange, TurnLog};
use docent_core::models::Turn;
use docent_core::prompt::build_prompt;
use docent_core::rerank::{RerankAuditEntry, Reranker};
use docent_core::retrieve::{Retrieval, Retriever};
use docent_core::store::Store;

use crate::config::RetrievalConfig;
use crate::memory::SessionWindows;

/// What one message produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatOutcome {
    pub answer: Answer,
    /// Initial and final rank of each passage when re-ranking ran.
    pub rerank: Vec<RerankAuditEntry>,
    pub passages: usize,
}

impl ChatOutcome {
    pub fn content(&self) -> &str {
        self.answer.content()
    }

    pub fn sources(&self) -> &[String] {
        self.answer.sources()
    }
}

pub struct RagEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Arc<dyn GenerationProvider>,
    windows: SessionWindows,
    retrieval: RetrievalConfig,
}

impl RagEngine {
    /// `window_turns` is the memory window size in turns.
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        turn_log: Arc<dyn TurnLog>,
        window_turns: usize,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker: None,
            generator,
            windows: SessionWindows::new(turn_log, window_turns),
            retrieval,
        }
    }

    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn windows(&self) -> &SessionWindows {
        &self.windows
    }

    /// Delete a session and forget its memory window.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.windows.delete(session_id).await
    }

    pub async fn delete_all_sessions(&self) -> Result<usize> {
        self.windows.delete_all().await
    }

    /// Stage 1 and optional stage 2 retrieval with the configured limits.
    pub async fn retrieve(&self, query: &str, use_reranking: bool) -> Result<Retrieval> {
        Retriever::new(self.store.as_ref(), self.embedder.as_ref())
            .with_reranker(self.reranker.as_deref())
            .retrieve(query, &self.retrieval.params(use_reranking))
            .await
    }

    /// Answer `message` in the context of `session_id`.
    ///
    /// Fails (appending nothing) if retrieval, generation, or persisting
    /// the exchange fails. An empty message is a validation error.
    pub async fn answer(
        &self,
        session_id: &str,
        message: &str,
        use_knowledge_base: bool,
        use_reranking: bool,
    ) -> Result<ChatOutcome> {
        self.answer_within(session_id, message, use_knowledge_base, use_reranking, None)
            .await
    }

    /// [`answer`](Self::answer) with a deadline on waiting for the session
    /// and on retrieval plus generation. Persisting the exchange is never
    /// cut short: once generation finished the exchange is either fully
    /// saved or not saved at all.
    pub async fn answer_within(
        &self,
        session_id: &str,
        message: &str,
        use_knowledge_base: bool,
        use_reranking: bool,
        timeout: Option<Duration>,
    ) -> Result<ChatOutcome> {
        let message = message.trim();
        if message.is_empty() {
            return Err(PipelineError::Validation("message is empty".into()).into());
        }
        let deadline = timeout.map(|t| (Instant::now() + t, t));

        let mut session = within(deadline, self.windows.lock(session_id)).await?;
        let history = session.turns();

        let (retrieval, answer) = within(
            deadline,
            self.generate(session_id, &history, message, use_knowledge_base, use_reranking),
        )
        .await?;

        let rerank = if retrieval.reranked {
            retrieval.audit()
        } else {
            Vec::new()
        };
        session
            .append_exchange(Exchange {
                user: Turn::user(message),
                assistant: Turn::assistant(answer.content(), answer.sources().to_vec()),
                rerank: rerank.clone(),
            })
            .await
            .context("saving exchange")?;

        Ok(ChatOutcome {
            answer,
            rerank,
            passages: retrieval.results.len(),
        })
    }

    async fn generate(
        &self,
        session_id: &str,
        history: &[Turn],
        message: &str,
        use_knowledge_base: bool,
        use_reranking: bool,
    ) -> Result<(Retrieval, Answer)> {
        let retrieval = if use_knowledge_base {
            self.retrieve(message, use_reranking)
                .await
                .context("retrieving passages")?
        } else {
            Retrieval::default()
        };
        tracing::info!(
            session = session_id,
            history = history.len(),
            candidates = retrieval.stage1_candidates,
            passages = retrieval.results.len(),
            reranked = retrieval.reranked,
            "retrieved context"
        );

        let prompt = build_prompt(history, &retrieval.results, message, use_knowledge_base);
        let raw = self
            .generator
            .generate(&prompt)
            .await
            .with_context(|| format!("generating with {}", self.generator.model_name()))?;
        let answer = interpret_reply(&raw, &prompt)?;
        if let Answer::Ungrounded { reason, .. } = &answer {
            tracing::info!(session = session_id, reason = ?reason, "answer is not grounded");
        }
        Ok((retrieval, answer))
    }
}

async fn within<T>(
    deadline: Option<(Instant, Duration)>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some((at, budget)) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(budget).into()),
        },
        None => fut.await,
    }
}
