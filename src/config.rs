//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! [`load_config`] parses and validates; capability backends are then
//! selected from the provider names by the `create_*` factories.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docent_core::retrieve::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k_stage1")]
    pub top_k_stage1: usize,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    /// Minimum cosine similarity for a passage to be used.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: Option<f32>,
    /// Cutoff on re-ranker scores when stage 2 ran.
    #[serde(default)]
    pub rerank_relevance_threshold: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_stage1: default_top_k_stage1(),
            rerank_top_k: default_rerank_top_k(),
            relevance_threshold: default_relevance_threshold(),
            rerank_relevance_threshold: None,
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self, use_reranking: bool) -> RetrievalParams {
        RetrievalParams {
            top_k_stage1: self.top_k_stage1,
            rerank_top_k: self.rerank_top_k,
            relevance_threshold: self.relevance_threshold,
            rerank_relevance_threshold: self.rerank_relevance_threshold,
            use_reranking,
        }
    }
}

fn default_top_k_stage1() -> usize {
    50
}
fn default_rerank_top_k() -> usize {
    5
}
fn default_relevance_threshold() -> Option<f32> {
    Some(0.25)
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    /// Exchanges (user message plus reply) kept in the prompt history.
    #[serde(default = "default_max_memory_messages")]
    pub max_memory_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_messages: default_max_memory_messages(),
        }
    }
}

impl MemoryConfig {
    /// Window size in turns.
    pub fn window_turns(&self) -> usize {
        self.max_memory_messages * 2
    }
}

fn default_max_memory_messages() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama or an OpenAI-compatible server.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_retries() -> u32 {
    3
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_rerank_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rerank_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            max_retries: default_rerank_retries(),
            initial_backoff_ms: default_rerank_backoff_ms(),
        }
    }
}

fn default_rerank_retries() -> u32 {
    2
}
fn default_rerank_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Default source root when `--root` is not given.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    /// Delete indexed files that disappeared from the source root.
    #[serde(default = "default_true")]
    pub prune_removed: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            workers: default_workers(),
            file_timeout_secs: default_file_timeout_secs(),
            prune_removed: true,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    ["**/*.md", "**/*.markdown", "**/*.txt", "**/*.pdf", "**/*.docx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_workers() -> usize {
    4
}
fn default_file_timeout_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub use_knowledge_base: bool,
    #[serde(default)]
    pub use_reranking: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_chat_timeout_secs(),
            use_knowledge_base: true,
            use_reranking: false,
        }
    }
}

fn default_chat_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_size
        );
    }

    if config.retrieval.rerank_top_k < 1 {
        bail!("retrieval.rerank_top_k must be >= 1");
    }
    if config.retrieval.top_k_stage1 < config.retrieval.rerank_top_k {
        bail!(
            "retrieval.top_k_stage1 ({}) must be >= retrieval.rerank_top_k ({})",
            config.retrieval.top_k_stage1,
            config.retrieval.rerank_top_k
        );
    }

    if config.memory.max_memory_messages < 1 {
        bail!("memory.max_memory_messages must be >= 1");
    }
    if config.ingest.workers < 1 {
        bail!("ingest.workers must be >= 1");
    }
    if config.embedding.batch_size < 1 {
        bail!("embedding.batch_size must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or local.",
            other
        ),
    }
    if config.embedding.is_enabled()
        && config.embedding.provider != "local"
        && config.embedding.dims.unwrap_or(0) == 0
    {
        bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.generation.provider.as_str() {
        "disabled" | "extractive" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, ollama, or extractive.",
            other
        ),
    }

    match config.reranker.provider.as_str() {
        "disabled" | "lexical" | "local" => {}
        other => bail!(
            "Unknown reranker provider: '{}'. Must be disabled, lexical, or local.",
            other
        ),
    }

    Ok(())
}
