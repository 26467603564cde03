//! # docent
//!
//! Grounded question answering over a local document corpus.
//!
//! docent ingests a directory of documents incrementally (content-hash
//! fingerprints, so unchanged files are skipped), chunks and embeds them
//! into a SQLite vector index, and answers questions by retrieving
//! passages, optionally re-ranking them, and asking a generation backend
//! to answer from those passages only, citing its sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ File source │──▶│ Fingerprint,     │──▶│  SQLite   │
//! │ md/txt/pdf  │   │ chunk, embed     │   │ vectors   │
//! └─────────────┘   └──────────────────┘   └────┬─────┘
//!                                                │
//!           ┌────────────────┐   ┌───────────────┤
//!           │ Memory window  │──▶│ RAG engine    │◀── question
//!           │ (per session)  │◀──│ retrieve,     │
//!           └────────────────┘   │ rerank, answer│
//!                                └───────────────┘
//! ```
//!
//! The runtime-independent pieces (chunker, fingerprints, retrieval,
//! prompt assembly, the memory window) live in `docent-core`; this crate
//! adds SQLite persistence, concrete backends, the worker pool, and the
//! CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! docent init
//! docent ingest --root ./docs
//! docent ask "What is the refund window?"
//! docent chat --rerank
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`app`] | Builds store, backends, and engine from config |
//! | [`file_source`] | Enumerates documents under the ingestion root |
//! | [`extract`] | Text extraction (PDF, DOCX, PPTX, XLSX) |
//! | [`ingest`] | Incremental ingestion worker pool |
//! | [`embedding`] | Embedding providers and gateway |
//! | [`rerank`] | Second-stage rerankers |
//! | [`generation`] | Generation backends |
//! | [`sqlite_store`] | SQLite vector index and fingerprint registry |
//! | [`sessions`] | Session and message persistence |
//! | [`memory`] | Per-session memory windows |
//! | [`rag`] | The RAG orchestrator |
//! | [`chat`] | The `chat` operation |
//! | [`status`] | Ingestion status report |

pub mod app;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod file_source;
pub mod generation;
pub mod ingest;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod rag;
pub mod rerank;
pub mod retry;
pub mod sessions;
pub mod sqlite_store;
pub mod status;
