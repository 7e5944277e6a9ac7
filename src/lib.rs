//! # RAG Harness
//!
//! Retrieval-augmented-generation ingestion and retrieval core: chunking,
//! embedding-model lifecycle, vector storage with an HNSW index, and
//! change-aware incremental indexing, served over a CLI and an HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Chunker    │──▶│  Embedding   │──▶│ Vector Store │◀──│  RAG Facade  │
//! │ prose/code  │   │ client + LRU │   │ SQLite+HNSW  │   │ ingest/query │
//! └─────────────┘   └──────┬───────┘   └──────────────┘   └──────┬───────┘
//!                          │                                     │
//!                   ┌──────▼───────┐                     ┌───────▼──────┐
//!                   │ Model manager│                     │ Orchestrator │
//!                   │ load/evict   │                     │ scan + queue │
//!                   └──────────────┘                     └──────────────┘
//! ```
//!
//! Pure algorithms (chunking, vector math, HNSW, scoring, the error taxonomy,
//! and the store trait) live in the `rag-harness-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! rag init
//! rag index --root ./docs
//! rag query "how does eviction work" --modality docs
//! rag serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Embedding model registry |
//! | [`db`] / [`migrate`] | SQLite pool and schema migrations |
//! | [`embedding`] | Backends and the caching embedding client |
//! | [`model_manager`] | Model load, offload, and eviction |
//! | [`sqlite_store`] | SQLite-backed [`VectorStore`](rag_harness_core::store::VectorStore) |
//! | [`pipeline`] | Chunk, embed, and store one document |
//! | [`orchestrator`] | Incremental directory indexing and the ingestion queue |
//! | [`events`] | Progress events and reporters |
//! | [`facade`] | The service used by the CLI and server |
//! | [`server`] | HTTP API |
//! | [`redact`] | Redaction of sensitive text |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod db;
pub mod embedding;
pub mod events;
pub mod facade;
pub mod logging;
pub mod migrate;
pub mod model_manager;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod redact;
pub mod server;
pub mod sqlite_store;
