//! # docent-core
//!
//! Runtime-agnostic logic for docent: data models, the error taxonomy,
//! chunking, content fingerprinting, capability traits (embedding,
//! re-ranking, generation), the [`store::Store`] abstraction, two-stage
//! retrieval, the per-session memory window, and prompt assembly.
//!
//! This crate contains no tokio, sqlx, filesystem, or network code. The
//! `docent` application crate supplies concrete backends.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod generation;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod rerank;
pub mod retrieve;
pub mod store;
