//! Library-level pipeline tests: ingestion against SQLite and in-memory
//! stores, and the chat path with deterministic fake backends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use docent::chat::{chat, APOLOGY_REPLY};
use docent::config::{parse_config, IngestConfig, RetrievalConfig};
use docent::embedding::{EmbeddingGateway, HashEmbedder};
use docent::generation::ExtractiveGenerator;
use docent::ingest::{ingest, IngestOptions};
use docent::rag::RagEngine;
use docent::rerank::LexicalReranker;
use docent::retry::RetryPolicy;
use docent::sessions::SessionStore;
use docent::sqlite_store::SqliteStore;
use docent::{db, migrate};
use docent_core::embedding::EmbeddingProvider;
use docent_core::error::{is_consistency, PipelineError};
use docent_core::generation::{Answer, GenerationProvider, UngroundedReason};
use docent_core::memory::{Exchange, InMemoryTurnLog, TurnLog};
use docent_core::models::{Role, Turn};
use docent_core::prompt::PromptSections;
use docent_core::store::memory::InMemoryStore;
use docent_core::store::Store;

const DIMS: usize = 1024;

const REFUNDS: &str = "# Refunds\n\nRefund requests must be made within 30 days of purchase. \
                       Refunds are paid to the original card.";
const SHIPPING: &str = "# Shipping\n\nOrders ship within two business days. \
                        Tracking numbers are emailed once the parcel leaves the warehouse.";

struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding service unavailable")
    }
}

/// Answers the first call like [`HashEmbedder`], then stalls.
struct StallingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for StallingEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        HashEmbedder::new(DIMS).embed(texts).await
    }
}

/// [`InMemoryTurnLog`] whose appends take a while to land.
struct SlowTurnLog {
    inner: InMemoryTurnLog,
    delay: Duration,
}

#[async_trait]
impl TurnLog for SlowTurnLog {
    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        self.inner.recent_turns(session_id, limit).await
    }
    async fn append_exchange(&self, session_id: &str, exchange: &Exchange) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_exchange(session_id, exchange).await
    }
    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.inner.delete_session(session_id).await
    }
    async fn delete_all_sessions(&self) -> Result<usize> {
        self.inner.delete_all_sessions().await
    }
}

/// Replies `echo: <question>` and records the history length it saw.
#[derive(Default)]
struct EchoGenerator {
    seen_history: Mutex<Vec<usize>>,
    delay: Option<Duration>,
}

#[async_trait]
impl GenerationProvider for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn generate(&self, prompt: &PromptSections) -> Result<String> {
        self.seen_history.lock().unwrap().push(prompt.history.len());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        Ok(format!("echo: {}", prompt.question))
    }
}

struct FailingGenerator;

#[async_trait]
impl GenerationProvider for FailingGenerator {
    fn model_name(&self) -> &str {
        "failing"
    }
    async fn generate(&self, _prompt: &PromptSections) -> Result<String> {
        anyhow::bail!("model overloaded")
    }
}

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

fn options(root: PathBuf) -> IngestOptions {
    IngestOptions {
        source_root: root,
        chunk_size: 1000,
        overlap: 200,
        top_k_stage1: 50,
        rerank_top_k: 5,
        max_memory_messages: 5,
        full: false,
        dry_run: false,
        workers: 2,
    }
}

fn no_threshold() -> RetrievalConfig {
    RetrievalConfig {
        relevance_threshold: None,
        ..RetrievalConfig::default()
    }
}

async fn sqlite_pool(dir: &Path) -> sqlx::SqlitePool {
    let cfg = parse_config(&format!(
        "[db]\npath = \"{}\"\n",
        dir.join("index.sqlite").display()
    ))
    .unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    pool
}

fn hash() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashEmbedder::new(DIMS))
}

#[tokio::test]
async fn rerun_on_unchanged_corpus_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);
    write(&docs, "b.md", SHIPPING);
    // Same bytes as a.md under another path: still a distinct document.
    write(&docs, "c.md", REFUNDS);

    let pool = sqlite_pool(tmp.path()).await;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    let config = IngestConfig::default();

    let first = ingest(store.clone(), hash(), &options(docs.clone()), &config)
        .await
        .unwrap();
    assert_eq!(first.summary.total_files_scanned, 3);
    assert_eq!(first.summary.new_files_processed, 3);
    assert_eq!(first.summary.skipped_files, 0);
    assert!(first.summary.errors.is_empty());

    let before_fps = store.list_fingerprints().await.unwrap();
    let before_chunks = store.chunks_for_source("a.md").await.unwrap();

    let second = ingest(store.clone(), hash(), &options(docs), &config)
        .await
        .unwrap();
    assert_eq!(second.summary.total_files_scanned, 3);
    assert_eq!(second.summary.new_files_processed, 0);
    assert_eq!(second.summary.changed_files_processed, 0);
    assert_eq!(second.summary.skipped_files, 3);
    assert_eq!(second.summary.chunks_created, 0);
    assert_eq!(second.summary.skipped, vec!["a.md", "b.md", "c.md"]);

    assert_eq!(store.list_fingerprints().await.unwrap(), before_fps);
    assert_eq!(store.chunks_for_source("a.md").await.unwrap(), before_chunks);
}

#[tokio::test]
async fn failed_embedding_keeps_previous_chunks_and_hash() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);
    write(&docs, "b.md", SHIPPING);

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(sqlite_pool(tmp.path()).await));
    let config = IngestConfig::default();
    ingest(store.clone(), hash(), &options(docs.clone()), &config)
        .await
        .unwrap();
    let old_chunks = store.chunks_for_source("a.md").await.unwrap();
    let old_fp = store.get_fingerprint("a.md").await.unwrap().unwrap();

    write(&docs, "a.md", "# Refunds\n\nRefunds now take 60 days.");
    let report = ingest(
        store.clone(),
        Arc::new(FailingEmbedder),
        &options(docs.clone()),
        &config,
    )
    .await
    .unwrap();
    assert_eq!(report.summary.changed_files_processed, 0);
    assert_eq!(report.summary.skipped_files, 1);
    assert_eq!(report.summary.errors.len(), 1);
    assert_eq!(report.summary.errors[0].path, "a.md");
    assert!(report.summary.errors[0].message.contains("unavailable"));

    assert_eq!(store.chunks_for_source("a.md").await.unwrap(), old_chunks);
    assert_eq!(store.get_fingerprint("a.md").await.unwrap().unwrap(), old_fp);
    store.verify_integrity().await.unwrap();

    // The file is still pending and is picked up by the next good run.
    let retry = ingest(store.clone(), hash(), &options(docs), &config)
        .await
        .unwrap();
    assert_eq!(retry.summary.changed_files_processed, 1);
    assert_eq!(retry.summary.processed, vec!["a.md"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_workers_do_not_fail_each_other() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    for n in 0..48 {
        write(
            &docs,
            &format!("notes/{:02}.md", n),
            &format!("# Note {}\n\nTopic {} covers item {} of the handbook.", n, n * 7, n),
        );
    }

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(sqlite_pool(tmp.path()).await));
    let mut opts = options(docs.clone());
    opts.workers = 8;
    let report = ingest(store.clone(), hash(), &opts, &IngestConfig::default())
        .await
        .unwrap();
    assert!(report.summary.errors.is_empty(), "{:?}", report.summary.errors);
    assert_eq!(report.summary.new_files_processed, 48);
    assert_eq!(store.stats().await.unwrap().sources, 48);
    store.verify_integrity().await.unwrap();

    // Change every file so each worker replaces existing chunks.
    for n in 0..48 {
        write(
            &docs,
            &format!("notes/{:02}.md", n),
            &format!("# Note {}\n\nRevised: topic {} now covers item {}.", n, n * 3, n),
        );
    }
    let again = ingest(store.clone(), hash(), &opts, &IngestConfig::default())
        .await
        .unwrap();
    assert!(again.summary.errors.is_empty(), "{:?}", again.summary.errors);
    assert_eq!(again.summary.changed_files_processed, 48);
    store.verify_integrity().await.unwrap();
}

#[tokio::test]
async fn timed_out_file_is_left_as_it_was_and_retried() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(sqlite_pool(tmp.path()).await));
    ingest(store.clone(), hash(), &options(docs.clone()), &IngestConfig::default())
        .await
        .unwrap();
    let old_chunks = store.chunks_for_source("a.md").await.unwrap();
    let old_fp = store.get_fingerprint("a.md").await.unwrap().unwrap();

    // Several chunks, one per batch: the first batch comes back, the
    // second never does.
    write(&docs, "a.md", &format!("# Refunds\n\n{}", "Refunds take 60 days now. ".repeat(20)));
    let stalling = EmbeddingGateway::new(
        Box::new(StallingEmbedder {
            calls: AtomicUsize::new(0),
        }),
        1,
        RetryPolicy::new(0, 1),
    );
    let mut opts = options(docs.clone());
    opts.chunk_size = 100;
    opts.overlap = 20;
    let config = IngestConfig {
        file_timeout_secs: 1,
        ..IngestConfig::default()
    };
    let report = ingest(store.clone(), Arc::new(stalling), &opts, &config)
        .await
        .unwrap();
    assert_eq!(report.summary.changed_files_processed, 0);
    assert_eq!(report.summary.errors.len(), 1);
    assert_eq!(report.summary.errors[0].path, "a.md");
    assert_eq!(
        report.summary.errors[0].message,
        PipelineError::Timeout(Duration::from_secs(1)).to_string()
    );

    assert_eq!(store.chunks_for_source("a.md").await.unwrap(), old_chunks);
    assert_eq!(store.get_fingerprint("a.md").await.unwrap().unwrap(), old_fp);
    store.verify_integrity().await.unwrap();

    let retry = ingest(store.clone(), hash(), &opts, &config).await.unwrap();
    assert!(retry.summary.errors.is_empty());
    assert_eq!(retry.summary.processed, vec!["a.md"]);
    assert!(store.chunks_for_source("a.md").await.unwrap().len() > 1);
}

#[tokio::test]
async fn empty_and_unreadable_files_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);
    write(&docs, "blank.txt", "   \n\n  ");
    write(&docs, "broken.pdf", "not really a pdf");

    let store = Arc::new(InMemoryStore::new());
    let report = ingest(
        store.clone(),
        hash(),
        &options(docs),
        &IngestConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(report.summary.new_files_processed, 1);
    let failed: Vec<&str> = report.summary.errors.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(failed, vec!["blank.txt", "broken.pdf"]);
    assert_eq!(store.list_fingerprints().await.unwrap().len(), 1);
}

#[tokio::test]
async fn removed_files_are_pruned_or_flagged() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);
    write(&docs, "b.md", SHIPPING);

    let store = Arc::new(InMemoryStore::new());
    let mut config = IngestConfig::default();
    ingest(store.clone(), hash(), &options(docs.clone()), &config)
        .await
        .unwrap();
    std::fs::remove_file(docs.join("b.md")).unwrap();

    config.prune_removed = false;
    let kept = ingest(store.clone(), hash(), &options(docs.clone()), &config)
        .await
        .unwrap();
    assert_eq!(kept.summary.orphaned, vec!["b.md"]);
    assert_eq!(kept.summary.removed_files, 0);
    assert!(store.get_fingerprint("b.md").await.unwrap().is_some());

    config.prune_removed = true;
    let pruned = ingest(store.clone(), hash(), &options(docs), &config)
        .await
        .unwrap();
    assert_eq!(pruned.summary.removed, vec!["b.md"]);
    assert!(store.get_fingerprint("b.md").await.unwrap().is_none());
    assert!(store.chunks_for_source("b.md").await.unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);

    let store = Arc::new(InMemoryStore::new());
    let mut opts = options(docs);
    opts.dry_run = true;
    let report = ingest(store.clone(), hash(), &opts, &IngestConfig::default())
        .await
        .unwrap();
    assert!(report.summary.dry_run);
    assert_eq!(report.summary.new_files_processed, 1);
    assert!(report.summary.chunks_created >= 1);
    assert!(store.list_fingerprints().await.unwrap().is_empty());
}

#[tokio::test]
async fn index_survives_reopen_and_rejects_other_dimensions() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "a.md", REFUNDS);
    write(&docs, "b.md", SHIPPING);

    let pool = sqlite_pool(tmp.path()).await;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    ingest(store.clone(), hash(), &options(docs.clone()), &IngestConfig::default())
        .await
        .unwrap();
    let query = HashEmbedder::new(DIMS).embed_one("refund requests");
    let before = store.search(&query, 5).await.unwrap();
    pool.close().await;

    let reopened = SqliteStore::open(sqlite_pool(tmp.path()).await, Some(DIMS), Some("hash"))
        .await
        .unwrap();
    reopened.verify_integrity().await.unwrap();
    assert_eq!(reopened.search(&query, 5).await.unwrap(), before);

    let err = SqliteStore::open(sqlite_pool(tmp.path()).await, Some(DIMS / 2), None)
        .await
        .err()
        .unwrap();
    assert!(is_consistency(&err));

    let err = ingest(
        Arc::new(reopened),
        Arc::new(HashEmbedder::new(DIMS / 2)),
        &options(docs),
        &IngestConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(is_consistency(&err));
}

#[tokio::test]
async fn answer_cites_the_retrieved_source() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "policies/refunds.md", REFUNDS);
    write(&docs, "policies/shipping.md", SHIPPING);

    let store = Arc::new(InMemoryStore::new());
    ingest(store.clone(), hash(), &options(docs), &IngestConfig::default())
        .await
        .unwrap();

    let engine = RagEngine::new(
        store,
        hash(),
        Arc::new(ExtractiveGenerator::default()),
        Arc::new(InMemoryTurnLog::new()),
        10,
        no_threshold(),
    );
    let outcome = engine
        .answer("s1", "How many days do I have to make refund requests?", true, false)
        .await
        .unwrap();
    assert!(outcome.answer.is_grounded());
    assert_eq!(outcome.sources(), &["policies/refunds.md".to_string()]);
    assert!(outcome.content().contains("30 days"));
    assert!(outcome.rerank.is_empty());
}

#[tokio::test]
async fn no_knowledge_base_or_empty_corpus_means_no_sources() {
    let engine = RagEngine::new(
        Arc::new(InMemoryStore::new()),
        hash(),
        Arc::new(ExtractiveGenerator::default()),
        Arc::new(InMemoryTurnLog::new()),
        10,
        no_threshold(),
    );

    let empty = engine.answer("s1", "What is the SLA?", true, false).await.unwrap();
    assert!(empty.sources().is_empty());
    assert!(matches!(
        empty.answer,
        Answer::Ungrounded {
            reason: UngroundedReason::NoRelevantContext,
            ..
        }
    ));

    let off = engine.answer("s1", "What is the SLA?", false, false).await.unwrap();
    assert!(off.sources().is_empty());
    assert!(matches!(
        off.answer,
        Answer::Ungrounded {
            reason: UngroundedReason::KnowledgeBaseDisabled,
            ..
        }
    ));
}

#[tokio::test]
async fn prompt_history_is_bounded_by_the_window() {
    let log = Arc::new(InMemoryTurnLog::new());
    let generator = Arc::new(EchoGenerator::default());
    let engine = RagEngine::new(
        Arc::new(InMemoryStore::new()),
        hash(),
        generator.clone(),
        log.clone(),
        4,
        no_threshold(),
    );
    for n in 0..4 {
        engine
            .answer("s1", &format!("question {}", n), false, false)
            .await
            .unwrap();
    }
    assert_eq!(*generator.seen_history.lock().unwrap(), vec![0, 2, 4, 4]);
    assert_eq!(log.history("s1").unwrap().len(), 8);
}

#[tokio::test]
async fn messages_on_one_session_are_serialized() {
    let log = Arc::new(InMemoryTurnLog::new());
    let generator = Arc::new(EchoGenerator {
        delay: Some(Duration::from_millis(30)),
        ..Default::default()
    });
    let engine = RagEngine::new(
        Arc::new(InMemoryStore::new()),
        hash(),
        generator.clone(),
        log.clone(),
        10,
        no_threshold(),
    );

    let (a, b) = tokio::join!(
        engine.answer("s1", "first", false, false),
        engine.answer("s1", "second", false, false),
    );
    a.unwrap();
    b.unwrap();

    // The second message saw the whole first exchange.
    assert_eq!(*generator.seen_history.lock().unwrap(), vec![0, 2]);
    let turns = log.history("s1").unwrap();
    assert_eq!(turns.len(), 4);
    for pair in turns.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
        assert_eq!(pair[1].content, format!("echo: {}", pair[0].content));
    }
}

#[tokio::test]
async fn chat_failure_keeps_the_user_turn() {
    let log = Arc::new(InMemoryTurnLog::new());
    let engine = RagEngine::new(
        Arc::new(InMemoryStore::new()),
        hash(),
        Arc::new(FailingGenerator),
        log.clone(),
        10,
        no_threshold(),
    );
    let reply = chat(&engine, "s1", "Is anyone there?", false, false, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.content, APOLOGY_REPLY);
    assert!(reply.sources.is_empty());
    assert!(reply.error.unwrap().contains("overloaded"));

    let turns = log.history("s1").unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "Is anyone there?");
    assert_eq!(turns[1].content, APOLOGY_REPLY);
}

#[tokio::test]
async fn chat_times_out_into_an_apology() {
    let log = Arc::new(InMemoryTurnLog::new());
    let engine = RagEngine::new(
        Arc::new(InMemoryStore::new()),
        hash(),
        Arc::new(EchoGenerator {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        }),
        log.clone(),
        10,
        no_threshold(),
    );
    let reply = chat(&engine, "s1", "slow question", false, false, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(reply.content, APOLOGY_REPLY);
    assert!(reply.error.unwrap().contains("timed out"));
    assert_eq!(log.history("s1").unwrap().len(), 2);
}

#[tokio::test]
async fn reranked_answer_is_audited_in_the_session_log() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    write(&docs, "refunds.md", REFUNDS);
    write(&docs, "shipping.md", SHIPPING);

    let pool = sqlite_pool(tmp.path()).await;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let sessions = Arc::new(SessionStore::new(pool));
    ingest(store.clone(), hash(), &options(docs), &IngestConfig::default())
        .await
        .unwrap();

    let engine = RagEngine::new(
        store,
        hash(),
        Arc::new(ExtractiveGenerator::default()),
        sessions.clone(),
        10,
        no_threshold(),
    )
    .with_reranker(Some(Arc::new(LexicalReranker)));

    let session = sessions.create(None).await.unwrap();
    let reply = chat(
        &engine,
        &session.id,
        "refund requests within 30 days",
        true,
        true,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(reply.grounded);
    assert_eq!(reply.sources, vec!["refunds.md".to_string()]);
    assert!(!reply.rerank.is_empty());
    assert_eq!(reply.rerank[0].source_path, "refunds.md");

    let messages = sessions.messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let audit = &messages[1].rerank;
    assert_eq!(audit.len(), reply.rerank.len());
    assert_eq!(audit[0].chunk_id, reply.rerank[0].chunk_id);
    assert_eq!(audit[0].final_rank, 1);

    let renamed = sessions.get(&session.id).await.unwrap().unwrap();
    assert_eq!(renamed.name, "refund requests within 30 days");
    assert_eq!(sessions.recent_turns(&session.id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn chat_rejects_unknown_sessions() {
    let tmp = TempDir::new().unwrap();
    let pool = sqlite_pool(tmp.path()).await;
    let engine = RagEngine::new(
        Arc::new(SqliteStore::new(pool.clone())),
        hash(),
        Arc::new(ExtractiveGenerator::default()),
        Arc::new(SessionStore::new(pool)),
        10,
        no_threshold(),
    );
    let err = chat(&engine, "missing", "hello", false, false, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Session not found"));
}

#[tokio::test]
async fn slow_save_is_not_cut_short_by_the_deadline() {
    let log = Arc::new(SlowTurnLog {
        inner: InMemoryTurnLog::new(),
        delay: Duration::from_millis(300),
    });
    let engine = RagEngine::new(
        Arc::new(InMemoryStore::new()),
        hash(),
        Arc::new(EchoGenerator::default()),
        log.clone(),
        10,
        no_threshold(),
    );
    let reply = chat(&engine, "s1", "quick question", false, false, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(reply.content, "echo: quick question");
    assert!(reply.error.is_none());

    let turns = log.inner.history("s1").unwrap();
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["quick question", "echo: quick question"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_append_in_parallel() {
    let tmp = TempDir::new().unwrap();
    let pool = sqlite_pool(tmp.path()).await;
    let sessions = Arc::new(SessionStore::new(pool.clone()));
    let engine = Arc::new(RagEngine::new(
        Arc::new(SqliteStore::new(pool)),
        hash(),
        Arc::new(EchoGenerator::default()),
        sessions.clone(),
        10,
        no_threshold(),
    ));

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(sessions.create(None).await.unwrap().id);
    }
    let mut tasks = tokio::task::JoinSet::new();
    for id in ids.iter().cloned() {
        let engine = engine.clone();
        tasks.spawn(async move {
            for n in 0..3 {
                let reply = chat(
                    &engine,
                    &id,
                    &format!("question {}", n),
                    false,
                    false,
                    Duration::from_secs(30),
                )
                .await
                .unwrap();
                assert!(reply.error.is_none(), "{:?}", reply.error);
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    for id in &ids {
        let info = sessions.get(id).await.unwrap().unwrap();
        assert_eq!(info.message_count, 6);
        assert_eq!(info.name, "question 0");
    }
}

#[tokio::test]
async fn deleting_a_session_forgets_its_window() {
    let tmp = TempDir::new().unwrap();
    let pool = sqlite_pool(tmp.path()).await;
    let sessions = Arc::new(SessionStore::new(pool.clone()));
    let engine = RagEngine::new(
        Arc::new(SqliteStore::new(pool)),
        hash(),
        Arc::new(EchoGenerator::default()),
        sessions.clone(),
        10,
        no_threshold(),
    );
    let session = sessions.create(None).await.unwrap();
    engine.answer(&session.id, "hello", false, false).await.unwrap();
    assert_eq!(engine.windows().cached_sessions(), 1);

    assert!(engine.delete_session(&session.id).await.unwrap());
    assert_eq!(engine.windows().cached_sessions(), 0);
    assert!(sessions.get(&session.id).await.unwrap().is_none());

    let err = engine
        .answer(&session.id, "still there?", false, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Validation(_))
    ));
}
