//! # docent CLI
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./config/docent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent init` | Create the SQLite database and run schema migrations |
//! | `docent ingest` | Ingest new and changed documents under the root |
//! | `docent ask "<msg>"` | Answer one question |
//! | `docent chat` | Interactive conversation over stdin |
//! | `docent search "<query>"` | Show the passages retrieval would use |
//! | `docent sessions ...` | Create, list, show, and delete sessions |
//! | `docent status` | Show what is indexed |
//! | `docent reset` | Clear the index (and optionally sessions) |

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use docent::app::App;
use docent::chat::ChatReply;
use docent::config;
use docent::ingest::IngestReport;
use docent::{logging, migrate, status};
use docent_core::store::Store;

/// docent: grounded question answering over a local document corpus.
#[derive(Parser)]
#[command(name = "docent", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docent.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Only log errors.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest new and changed documents.
    ///
    /// Unchanged files (same SHA-256 as last time) are skipped. Files
    /// that disappeared are pruned from the index unless
    /// `[ingest] prune_removed = false`.
    Ingest {
        /// Directory to ingest. Defaults to `[ingest] root`.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        overlap: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
        /// Re-ingest every file, changed or not.
        #[arg(long)]
        full: bool,
        /// Report what would be ingested without embedding or writing.
        #[arg(long)]
        dry_run: bool,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask one question.
    ///
    /// Without `--session` a new session is created and its id printed.
    Ask {
        message: String,
        #[arg(long)]
        session: Option<String>,
        /// Answer without consulting the knowledge base.
        #[arg(long)]
        no_kb: bool,
        /// Re-rank retrieved passages before answering.
        #[arg(long)]
        rerank: bool,
        #[arg(long)]
        json: bool,
    },

    /// Interactive conversation. Type `exit` or send EOF to stop.
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        no_kb: bool,
        #[arg(long)]
        rerank: bool,
    },

    /// Show the passages retrieval returns for a query.
    Search {
        query: String,
        #[arg(long)]
        rerank: bool,
        /// Number of passages (overrides `[retrieval] rerank_top_k`).
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Manage chat sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show indexed files and index totals.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Clear the vector index and fingerprints.
    Reset {
        /// Also delete every session and message.
        #[arg(long)]
        sessions: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session and print its id.
    New {
        #[arg(long)]
        name: Option<String>,
    },
    /// List sessions, most recently active first.
    List,
    /// Print a session's full history with sources.
    Show { id: String },
    /// Delete one session, or all with `--all`.
    Delete {
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging, cli.verbose, cli.quiet);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            root,
            chunk_size,
            overlap,
            workers,
            full,
            dry_run,
            json,
        } => {
            if let Some(n) = chunk_size {
                cfg.chunking.chunk_size = n;
            }
            if let Some(n) = overlap {
                cfg.chunking.chunk_overlap = n;
            }
            if let Some(n) = workers {
                cfg.ingest.workers = n;
            }
            let app = App::open(cfg).await?;
            let mut options = app.ingest_options(root)?;
            options.full = full;
            options.dry_run = dry_run;
            let report = app.ingest(&options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_ingest_report(&report);
            }
            app.close().await;
        }
        Commands::Ask {
            message,
            session,
            no_kb,
            rerank,
            json,
        } => {
            let use_kb = cfg.chat.use_knowledge_base && !no_kb;
            let use_rerank = rerank || cfg.chat.use_reranking;
            let app = App::open(cfg).await?;
            let session_id = match session {
                Some(id) => id,
                None => {
                    let created = app.sessions.create(None).await?;
                    eprintln!("session: {}", created.id);
                    created.id
                }
            };
            let engine = app.engine()?;
            let reply = app
                .chat(&engine, &session_id, &message, use_kb, use_rerank)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reply)?);
            } else {
                print_reply(&reply);
            }
            app.close().await;
        }
        Commands::Chat {
            session,
            no_kb,
            rerank,
        } => {
            let use_kb = cfg.chat.use_knowledge_base && !no_kb;
            let use_rerank = rerank || cfg.chat.use_reranking;
            let app = App::open(cfg).await?;
            let session_id = match session {
                Some(id) => id,
                None => app.sessions.create(None).await?.id,
            };
            let engine = app.engine()?;
            eprintln!("session {} (type `exit` to quit)", session_id);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                eprint!("> ");
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                let reply = app
                    .chat(&engine, &session_id, line, use_kb, use_rerank)
                    .await?;
                print_reply(&reply);
            }
            app.close().await;
        }
        Commands::Search {
            query,
            rerank,
            limit,
            json,
        } => {
            if let Some(n) = limit {
                if n == 0 {
                    bail!("--limit must be >= 1");
                }
                cfg.retrieval.rerank_top_k = n;
                cfg.retrieval.top_k_stage1 = cfg.retrieval.top_k_stage1.max(n);
            }
            let app = App::open(cfg).await?;
            let engine = app.engine()?;
            let retrieval = engine.retrieve(&query, rerank).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&retrieval)?);
            } else if retrieval.results.is_empty() {
                println!("No passages above the relevance threshold.");
            } else {
                for (i, r) in retrieval.results.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {} #{} (similarity {:.3}, stage-1 rank {})",
                        i + 1,
                        r.score,
                        r.source_path,
                        r.ordinal,
                        r.similarity,
                        r.initial_rank
                    );
                    println!("   {}", snippet(&r.text, 200));
                }
            }
            app.close().await;
        }
        Commands::Sessions { action } => {
            let app = App::connect(cfg).await?;
            run_sessions(&app, action).await?;
            app.close().await;
        }
        Commands::Status { json } => {
            let db_path = cfg.db.path.clone();
            let app = App::connect(cfg).await?;
            if let Err(e) = app.store.verify_integrity().await {
                eprintln!("warning: {:#}", e);
            }
            let model = app.store.model().await?;
            let report = status::collect(&db_path, app.store.as_ref(), model).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                status::print_report(&report);
            }
            app.close().await;
        }
        Commands::Reset { sessions } => {
            let app = App::connect(cfg).await?;
            app.store.clear().await?;
            println!("Index cleared.");
            if sessions {
                let n = app.sessions.delete_all().await?;
                println!("Deleted {} session(s).", n);
            }
            app.close().await;
        }
    }

    Ok(())
}

async fn run_sessions(app: &App, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::New { name } => {
            let s = app.sessions.create(name.as_deref()).await?;
            println!("{}", s.id);
        }
        SessionAction::List => {
            let sessions = app.sessions.list().await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{}  {:<40} {:>4} msgs  {}",
                    s.id,
                    s.name,
                    s.message_count,
                    status::format_ts_relative(s.updated_at)
                );
            }
        }
        SessionAction::Show { id } => {
            let Some(info) = app.sessions.get(&id).await? else {
                bail!("Session not found: {}", id);
            };
            println!("{} ({})", info.name, info.id);
            println!();
            for m in app.sessions.messages(&id).await? {
                println!("[{}] {}", m.role, status::format_ts(m.created_at));
                println!("{}", m.content);
                if !m.sources.is_empty() {
                    println!("  sources: {}", m.sources.join(", "));
                }
                for r in &m.rerank {
                    println!(
                        "  rerank: {} #{} -> #{} (similarity {:.3}, score {:.3})",
                        r.source_path, r.initial_rank, r.final_rank, r.similarity, r.score
                    );
                }
                println!();
            }
        }
        SessionAction::Delete { id, all } => match (id, all) {
            (_, true) => {
                let n = app.sessions.delete_all().await?;
                println!("Deleted {} session(s).", n);
            }
            (Some(id), false) => {
                if !app.sessions.delete(&id).await? {
                    bail!("Session not found: {}", id);
                }
                println!("Deleted session {}.", id);
            }
            (None, false) => bail!("Pass a session id or --all"),
        },
    }
    Ok(())
}

fn print_reply(reply: &ChatReply) {
    println!("{}", reply.content);
    if !reply.sources.is_empty() {
        println!();
        println!("Sources:");
        for s in &reply.sources {
            println!("  - {}", s);
        }
    }
}

fn print_ingest_report(report: &IngestReport) {
    let s = &report.summary;
    if s.dry_run {
        println!("Dry run: nothing was written.");
    }
    println!("Ingestion summary ({})", report.settings.source_root);
    println!("  files scanned:    {}", s.total_files_scanned);
    println!("  new:              {}", s.new_files_processed);
    println!("  changed:          {}", s.changed_files_processed);
    println!("  unchanged:        {}", s.skipped_files);
    println!("  removed:          {}", s.removed_files);
    println!("  chunks created:   {}", s.chunks_created);
    if !s.orphaned.is_empty() {
        println!("  missing (kept):   {}", s.orphaned.join(", "));
    }
    if !s.errors.is_empty() {
        println!("  errors:           {}", s.errors.len());
        for e in &s.errors {
            println!("    {}: {}", e.path, e.message);
        }
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    }
}
