//! Core data models shared by the chunker, the store, and the facade.

use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// Which vector column a piece of content lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Docs,
    Code,
    Captions,
    Images,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Docs,
        Modality::Code,
        Modality::Captions,
        Modality::Images,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Docs => "docs",
            Modality::Code => "code",
            Modality::Captions => "captions",
            Modality::Images => "images",
        }
    }

    /// Whether the modality is embedded with a vision model.
    pub fn is_visual(&self) -> bool {
        matches!(self, Modality::Images)
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Modality {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docs" => Ok(Modality::Docs),
            "code" => Ok(Modality::Code),
            "captions" => Ok(Modality::Captions),
            "images" => Ok(Modality::Images),
            other => Err(RagError::validation(format!(
                "unknown modality '{}': use docs, code, captions, or images",
                other
            ))),
        }
    }
}

/// Distance metric a model's vectors are compared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
        }
    }
}

/// How a chunk was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMethod {
    Semantic,
    CharacterFallback,
    Code,
    Caption,
}

/// Per-chunk metadata, stored as JSON next to the chunk text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub method: ChunkMethod,
    /// First source line (1-based, inclusive). Code chunks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    /// Last source line (1-based, inclusive). Code chunks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    /// Set when the chunker had to give up on structure and window by characters.
    #[serde(default)]
    pub degraded: bool,
    /// Set when the chunk is allowed to fall outside `min_tokens..=max_tokens`.
    #[serde(default)]
    pub overshoot: bool,
    /// Byte span of the chunk in the source text, when it is an exact slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ChunkMetadata {
    pub fn new(method: ChunkMethod) -> Self {
        Self {
            method,
            start_line: None,
            end_line: None,
            degraded: false,
            overshoot: false,
            byte_start: None,
            byte_end: None,
            caption_id: None,
            language: None,
        }
    }
}

/// A chunk as produced by the chunker, before it has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_index: usize,
    pub text: String,
    pub token_estimate: usize,
    pub metadata: ChunkMetadata,
}

/// A persisted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: usize,
    pub text: String,
    pub token_estimate: usize,
    pub metadata: ChunkMetadata,
}

/// A persisted document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub source: String,
    pub content: String,
    pub modality: Modality,
    pub content_hash: String,
    pub idempotency_key: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Input to [`Store::insert_document_with_chunks`](crate::store::VectorStore::insert_document_with_chunks).
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source: String,
    pub content: String,
    pub modality: Modality,
    pub idempotency_key: String,
    /// Delete earlier documents with the same `source` in the same transaction.
    pub replace_source: bool,
}

/// Result of a document insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertedDocument {
    pub document_id: i64,
    /// Chunk ids, ordered by `chunk_index`.
    pub chunk_ids: Vec<i64>,
    /// False when the idempotency key was already present and nothing was written.
    pub created: bool,
    /// Stored embeddings of this document that hold fallback vectors.
    pub fallbacks: usize,
}

/// One embedding row to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    pub chunk_id: i64,
    pub model_id: String,
    pub vector: Vec<f32>,
    pub metric: Metric,
    /// Synthesized after a backend failure rather than produced by the model.
    pub fallback: bool,
}

/// One vector per chunk of a document, in chunk order.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEmbeddings {
    pub model_id: String,
    pub metric: Metric,
    pub vectors: Vec<Vec<f32>>,
    /// `fallback[i]` marks `vectors[i]` as synthesized.
    pub fallback: Vec<bool>,
}

impl DocumentEmbeddings {
    pub fn fallback_count(&self) -> usize {
        self.fallback.iter().filter(|f| **f).count()
    }

    /// Rows for the chunk ids of a freshly written document.
    pub fn rows(&self, chunk_ids: &[i64]) -> Vec<EmbeddingRow> {
        chunk_ids
            .iter()
            .zip(&self.vectors)
            .zip(&self.fallback)
            .map(|((&chunk_id, vector), &fallback)| EmbeddingRow {
                chunk_id,
                model_id: self.model_id.clone(),
                vector: vector.clone(),
                metric: self.metric,
                fallback,
            })
            .collect()
    }
}

/// A caption to be chunked and indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionItem {
    pub id: String,
    pub caption: String,
}

/// Kind of an entry in a code symbol map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Import,
}

/// A declaration or import found while chunking code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based line number.
    pub line: usize,
    /// Index of the first chunk that contains the line.
    pub chunk_index: usize,
}

pub type SymbolMap = Vec<Symbol>;

/// A scored retrieval hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub source: String,
    /// Raw cosine distance from the query.
    pub distance: f32,
    /// Combined score in `[0, 1]`.
    pub score: f64,
}
