//! # RAG Harness Core
//!
//! Runtime-free building blocks for RAG Harness: the error taxonomy, data
//! models, prose/code/caption chunking, vector math, the HNSW graph, hybrid
//! scoring, retry backoff, and the [`store::VectorStore`] abstraction with an
//! in-memory backend.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! application crate supplies the SQLite store, embedding backends, model
//! lifecycle, and the indexing orchestrator on top of it.

pub mod chunk;
pub mod code_chunk;
pub mod embedding;
pub mod error;
pub mod hnsw;
pub mod models;
pub mod retry;
pub mod scoring;
pub mod store;

pub use error::{ErrorBody, ErrorKind, RagError, RagResult};
