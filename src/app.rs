//! Wiring: builds the store, the capability backends, and the engine from
//! a [`Config`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use docent_core::embedding::EmbeddingProvider;
use docent_core::store::Store;

use crate::chat::{chat, ChatReply};
use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingGateway;
use crate::generation::create_generator;
use crate::ingest::{ingest, IngestOptions, IngestReport};
use crate::migrate::migrate;
use crate::rag::RagEngine;
use crate::rerank::create_reranker;
use crate::sessions::SessionStore;
use crate::sqlite_store::SqliteStore;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub sessions: Arc<SessionStore>,
    embedder: Arc<EmbeddingGateway>,
}

impl App {
    /// Open the database without checking it against the embedding
    /// configuration. Enough for session management, status, and reset.
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate(&pool).await?;
        let embedder = Arc::new(EmbeddingGateway::from_config(&config.embedding)?);
        Ok(Self {
            store: Arc::new(SqliteStore::new(pool.clone())),
            sessions: Arc::new(SessionStore::new(pool.clone())),
            pool,
            config,
            embedder,
        })
    }

    /// Open the index for querying or ingestion: the configured embedding
    /// model and dimensionality must match what the index was built with,
    /// and the index must pass its integrity check.
    pub async fn open(config: Config) -> Result<Self> {
        let mut app = Self::connect(config).await?;
        if app.embedder.is_enabled() {
            let store = SqliteStore::open(
                app.pool.clone(),
                Some(app.embedder.dims()),
                Some(app.embedder.model_name()),
            )
            .await?;
            app.store = Arc::new(store);
        }
        app.store
            .verify_integrity()
            .await
            .context("index failed integrity check; run `docent reset` to rebuild")?;
        Ok(app)
    }

    pub fn embedder(&self) -> Arc<EmbeddingGateway> {
        self.embedder.clone()
    }

    pub fn engine(&self) -> Result<RagEngine> {
        let generator = create_generator(&self.config.generation)?;
        let reranker = create_reranker(&self.config.reranker)?;
        Ok(RagEngine::new(
            self.store.clone(),
            self.embedder.clone(),
            Arc::from(generator),
            self.sessions.clone(),
            self.config.memory.window_turns(),
            self.config.retrieval.clone(),
        )
        .with_reranker(reranker.map(Arc::from)))
    }

    pub async fn ingest(&self, options: &IngestOptions) -> Result<IngestReport> {
        ingest(
            self.store.clone(),
            self.embedder.clone(),
            options,
            &self.config.ingest,
        )
        .await
    }

    pub fn ingest_options(&self, root: Option<PathBuf>) -> Result<IngestOptions> {
        IngestOptions::from_config(&self.config, root)
    }

    pub async fn chat(
        &self,
        engine: &RagEngine,
        session_id: &str,
        message: &str,
        use_knowledge_base: bool,
        use_reranking: bool,
    ) -> Result<ChatReply> {
        chat(
            engine,
            session_id,
            message,
            use_knowledge_base,
            use_reranking,
            Duration::from_secs(self.config.chat.timeout_secs),
        )
        .await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
