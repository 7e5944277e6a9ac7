//! Storage abstraction for RAG Harness.
//!
//! The [`VectorStore`] trait covers everything the ingestion pipeline and the
//! query path need from persistence: atomic document-plus-chunks inserts,
//! embedding rows, approximate similarity search, hybrid scoring, and
//! maintenance. Backends: [`memory::InMemoryStore`] here and the SQLite store
//! in the application crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod ann;
pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};
use crate::models::{Chunk, DocumentEmbeddings, EmbeddingRow, InsertedDocument, Metric, Modality, NewDocument, ScoredChunk};
use crate::scoring::{rerank, HybridWeights, TextRanker};

/// Declared vector shape of a modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorColumn {
    pub modality: Modality,
    pub dim: usize,
    pub metric: Metric,
    pub model_id: String,
}

impl VectorColumn {
    /// Reject a vector that does not fit this column.
    pub fn check(&self, vector: &[f32], metric: Metric) -> RagResult<()> {
        if vector.len() != self.dim {
            return Err(RagError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if metric != self.metric {
            return Err(RagError::validation(format!(
                "metric {} does not match {} column metric {}",
                metric.as_str(),
                self.modality,
                self.metric.as_str()
            )));
        }
        if let Some(i) = vector.iter().position(|x| !x.is_finite()) {
            return Err(RagError::validation(format!(
                "vector component {} is not finite",
                i
            )));
        }
        Ok(())
    }

    /// Check a whole document's vectors against this column before anything
    /// is written.
    pub fn check_document(&self, chunk_count: usize, embeddings: &DocumentEmbeddings) -> RagResult<()> {
        if embeddings.vectors.len() != chunk_count || embeddings.fallback.len() != chunk_count {
            return Err(RagError::validation(format!(
                "{} vectors for {} chunks",
                embeddings.vectors.len(),
                chunk_count
            )));
        }
        for vector in &embeddings.vectors {
            self.check(vector, embeddings.metric)?;
        }
        Ok(())
    }
}

/// A similarity query against one modality and model.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub top_k: usize,
    pub modality: Modality,
    pub model_id: String,
    /// How many candidates per requested hit hybrid search pulls before reranking.
    pub candidate_multiplier: usize,
}

impl VectorQuery {
    pub fn new(vector: Vec<f32>, top_k: usize, modality: Modality, model_id: impl Into<String>) -> Self {
        Self {
            vector,
            top_k,
            modality,
            model_id: model_id.into(),
            candidate_multiplier: 3,
        }
    }
}

/// Store-level counters and row counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    pub embeddings: u64,
    pub queries: u64,
    pub inserts: u64,
    pub errors: u64,
    pub ef_search: usize,
}

/// Lock-free counters kept by every backend.
#[derive(Debug, Default)]
pub struct StoreCounters {
    queries: AtomicU64,
    inserts: AtomicU64,
    errors: AtomicU64,
}

impl StoreCounters {
    pub fn query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn insert(&self, n: u64) {
        self.inserts.fetch_add(n, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error result on the way out.
    pub fn track<T>(&self, result: RagResult<T>) -> RagResult<T> {
        if result.is_err() {
            self.error();
        }
        result
    }

    /// Copy the counters into `stats`.
    pub fn fill(&self, stats: &mut StoreStats) {
        stats.queries = self.queries.load(Ordering::Relaxed);
        stats.inserts = self.inserts.load(Ordering::Relaxed);
        stats.errors = self.errors.load(Ordering::Relaxed);
    }
}

/// Abstract vector storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document_with_chunks`](VectorStore::insert_document_with_chunks) | Atomic document + chunks insert, idempotent by key |
/// | [`insert_embeddings`](VectorStore::insert_embeddings) | Persist vectors, rejecting dimension mismatches |
/// | [`insert_document_with_embeddings`](VectorStore::insert_document_with_embeddings) | Document, chunks and vectors in one transaction |
/// | [`similar_chunks`](VectorStore::similar_chunks) | Approximate cosine search |
/// | [`hybrid_search`](VectorStore::hybrid_search) | Vector search reranked with a text ranker |
/// | [`delete_source`](VectorStore::delete_source) | Remove every document for a source |
/// | [`analyze`](VectorStore::analyze) / [`vacuum`](VectorStore::vacuum) | Maintenance |
/// | [`set_search_quality`](VectorStore::set_search_quality) | Tune `ef_search` at runtime |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert a document and its chunks in one transaction.
    ///
    /// A known idempotency key returns the existing ids with `created: false`
    /// and writes nothing.
    async fn insert_document_with_chunks(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
    ) -> RagResult<InsertedDocument>;

    /// Persist embedding rows. All rows are validated before any is written.
    async fn insert_embeddings(&self, rows: &[EmbeddingRow]) -> RagResult<usize>;

    /// Write a document, its chunks and one vector per chunk atomically.
    ///
    /// A known idempotency key is reused unless the stored copy holds more
    /// fallback vectors than `embeddings`; then it is rewritten. On any error
    /// the previous version of the source is left untouched.
    async fn insert_document_with_embeddings(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
        embeddings: &DocumentEmbeddings,
    ) -> RagResult<InsertedDocument>;

    /// Nearest chunks by cosine distance, scored `1 - distance`.
    async fn similar_chunks(&self, query: &VectorQuery) -> RagResult<Vec<ScoredChunk>>;

    /// Remove every document stored under `source`. Returns the number removed.
    async fn delete_source(&self, source: &str) -> RagResult<u64>;

    async fn analyze(&self) -> RagResult<()>;

    async fn vacuum(&self) -> RagResult<()>;

    async fn set_search_quality(&self, ef_search: usize) -> RagResult<()>;

    async fn health_check(&self) -> RagResult<()>;

    async fn stats(&self) -> RagResult<StoreStats>;

    fn text_ranker(&self) -> &dyn TextRanker;

    /// `w_vec * (1 - distance) + w_text * text_rank` over an enlarged candidate set.
    async fn hybrid_search(
        &self,
        query: &VectorQuery,
        text: &str,
        weights: HybridWeights,
    ) -> RagResult<Vec<ScoredChunk>> {
        let mut wide = query.clone();
        wide.top_k = query.top_k.saturating_mul(query.candidate_multiplier.max(1));
        let mut hits = self.similar_chunks(&wide).await?;
        rerank(&mut hits, text, self.text_ranker(), weights);
        hits.truncate(query.top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_check() {
        let col = VectorColumn {
            modality: Modality::Docs,
            dim: 3,
            metric: Metric::Cosine,
            model_id: "m".into(),
        };
        assert!(col.check(&[0.1, 0.2, 0.3], Metric::Cosine).is_ok());
        let err = col.check(&[0.1, 0.2], Metric::Cosine).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DimensionMismatch);
        assert!(col.check(&[0.1, f32::INFINITY, 0.3], Metric::Cosine).is_err());
    }
}
