//! Single-item ingestion: chunk, fit to the model, embed, store.
//!
//! Shared by the facade's `ingest_stream` and the indexing orchestrator.
//! Embedding happens before anything is written, and the document, its
//! chunks and its vectors land in one store transaction. A failure at any
//! step leaves the previous version of the source in place.

use std::path::Path;
use std::sync::Arc;

use rag_harness_core::chunk::{chunk_captions, chunk_document};
use rag_harness_core::code_chunk::{chunk_code_as, Language};
use rag_harness_core::embedding::sha256_hex;
use rag_harness_core::models::{CaptionItem, Chunk, DocumentEmbeddings, Modality, NewDocument, SymbolMap};
use rag_harness_core::store::VectorStore;
use rag_harness_core::{RagError, RagResult};
use sha2::{Digest, Sha256};

use crate::config::{ChunkingConfig, Config};
use crate::embedding::EmbeddingClient;

/// Content ready for chunking.
#[derive(Debug, Clone)]
pub struct PreparedDoc {
    pub source: String,
    pub modality: Modality,
    pub content: String,
    /// Caption items; when set, `content` is their joined text.
    pub captions: Option<Vec<CaptionItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub document_id: i64,
    pub chunks: usize,
    pub created: bool,
    /// Stored chunks that hold fallback vectors.
    pub fallbacks: usize,
    /// Fallback vectors from an enabled backend that failed. The document
    /// is rewritten by a later ingest once real vectors are available.
    pub degraded: bool,
    pub symbols: usize,
}

/// SHA-256 over `(source, content, model_id)`.
pub fn idempotency_key(source: &str, content: &str, model_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [source, content, model_id] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub struct Pipeline {
    store: Arc<dyn VectorStore>,
    client: Arc<EmbeddingClient>,
    chunking: ChunkingConfig,
    models: [(Modality, String); 4],
}

impl Pipeline {
    pub fn new(config: &Config, store: Arc<dyn VectorStore>, client: Arc<EmbeddingClient>) -> Self {
        let models = Modality::ALL.map(|m| (m, config.model_for(m).to_string()));
        Self {
            store,
            client,
            chunking: config.chunking.clone(),
            models,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<EmbeddingClient> {
        &self.client
    }

    pub fn model_for(&self, modality: Modality) -> &str {
        self.models
            .iter()
            .find(|(m, _)| *m == modality)
            .map(|(_, id)| id.as_str())
            .unwrap_or_default()
    }

    /// Split content the way its modality calls for.
    pub fn chunk(&self, doc: &PreparedDoc) -> (Vec<Chunk>, SymbolMap) {
        let c = &self.chunking;
        match (doc.modality, &doc.captions) {
            (_, Some(items)) => (chunk_captions(items, c.caption_summary), Vec::new()),
            (Modality::Code, None) => chunk_code_as(
                &doc.content,
                Language::from_path(Path::new(&doc.source)),
                c.code_min_loc,
                c.code_max_loc,
                c.code_overlap_loc,
            ),
            (Modality::Images, None) => {
                let item = CaptionItem {
                    id: doc.source.clone(),
                    caption: doc.content.clone(),
                };
                (chunk_captions(&[item], false), Vec::new())
            }
            (Modality::Docs | Modality::Captions, None) => (
                chunk_document(
                    &doc.content,
                    c.target_tokens,
                    c.min_tokens,
                    c.max_tokens,
                    c.overlap_ratio,
                ),
                Vec::new(),
            ),
        }
    }

    /// Ingest one document, replacing anything stored under its source.
    ///
    /// Idempotent: the same `(source, content, model)` adds no rows.
    pub async fn ingest(&self, doc: &PreparedDoc) -> RagResult<IngestOutcome> {
        let model_id = self.model_for(doc.modality).to_string();
        if doc.content.trim().is_empty() && doc.captions.as_ref().map_or(true, |c| c.is_empty()) {
            return Err(RagError::validation(format!("{} has no content", doc.source)));
        }

        let (chunks, symbols) = self.chunk(doc);
        let chunks = self.client.fit_chunks(&model_id, chunks)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = self.client.embed(&model_id, &texts).await?;

        let new_doc = NewDocument {
            source: doc.source.clone(),
            content: doc.content.clone(),
            modality: doc.modality,
            idempotency_key: idempotency_key(&doc.source, &doc.content, &model_id),
            replace_source: true,
        };
        let embeddings = DocumentEmbeddings {
            metric: self.client.registry().require(&model_id)?.metric,
            model_id,
            vectors: embedded.vectors,
            fallback: embedded.fallback,
        };
        let inserted = self
            .store
            .insert_document_with_embeddings(&new_doc, &chunks, &embeddings)
            .await?;
        let degraded = inserted.fallbacks > 0 && self.client.backend_enabled();

        tracing::debug!(
            source = %doc.source,
            modality = %doc.modality,
            chunks = chunks.len(),
            created = inserted.created,
            fallbacks = inserted.fallbacks,
            "ingested"
        );

        Ok(IngestOutcome {
            document_id: inserted.document_id,
            chunks: chunks.len(),
            created: inserted.created,
            fallbacks: inserted.fallbacks,
            degraded,
            symbols: symbols.len(),
        })
    }

    /// Content fingerprint used by file tracking.
    pub fn content_hash(content: &[u8]) -> String {
        sha256_hex(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validate;
    use crate::embedding::testing::ToggleBackend;
    use crate::embedding::DisabledBackend;
    use rag_harness_core::store::memory::InMemoryStore;
    use rag_harness_core::store::VectorQuery;

    fn pipeline() -> Pipeline {
        let config: Config = toml::from_str(
            "[db]\npath = \"x\"\n[embedding]\ntext_model = \"tiny\"\n[[models]]\nid = \"tiny\"\ndims = 8\nmax_tokens = 64\n",
        )
        .unwrap();
        validate(&config).unwrap();
        let store = Arc::new(InMemoryStore::new(config.vector_columns().unwrap()));
        let client = Arc::new(EmbeddingClient::from_config(&config, Arc::new(DisabledBackend), None));
        Pipeline::new(&config, store, client)
    }

    fn doc(source: &str, modality: Modality, content: &str) -> PreparedDoc {
        PreparedDoc {
            source: source.into(),
            modality,
            content: content.into(),
            captions: None,
        }
    }

    #[test]
    fn test_idempotency_key_separates_fields() {
        let a = idempotency_key("ab", "c", "m");
        let b = idempotency_key("a", "bc", "m");
        assert_ne!(a, b);
        assert_eq!(a, idempotency_key("ab", "c", "m"));
        assert_ne!(a, idempotency_key("ab", "c", "other"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_reingest_adds_no_rows() {
        let p = pipeline();
        let d = doc("notes.md", Modality::Docs, "# Notes\n\nThe cache is warm. The queue is empty.");
        let first = p.ingest(&d).await.unwrap();
        let second = p.ingest(&d).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.document_id, second.document_id);
        assert!(first.fallbacks > 0, "disabled provider falls back");
        assert!(!first.degraded, "a disabled provider is not a degraded one");

        let stats = p.store().stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.embeddings, stats.chunks);
    }

    #[tokio::test]
    async fn test_reingest_after_backend_recovery_replaces_fallback_vectors() {
        let config: Config = toml::from_str(
            "[db]\npath = \"x\"\n[embedding]\ntext_model = \"tiny\"\n[[models]]\nid = \"tiny\"\ndims = 8\nmax_tokens = 64\n",
        )
        .unwrap();
        validate(&config).unwrap();
        let backend = ToggleBackend::new(8, false);
        let store = Arc::new(InMemoryStore::new(config.vector_columns().unwrap()));
        let client = Arc::new(EmbeddingClient::from_config(&config, backend.clone(), None));
        let p = Pipeline::new(&config, store, client);
        let text = "Written while the embedding server was down.";
        let d = doc("outage.md", Modality::Docs, text);

        let first = p.ingest(&d).await.unwrap();
        assert!(first.created);
        assert!(first.degraded);
        assert_eq!(first.fallbacks, first.chunks);

        backend.set_up(true);
        let second = p.ingest(&d).await.unwrap();
        assert!(second.created, "fallback copy is rewritten");
        assert!(!second.degraded);
        assert_eq!(second.fallbacks, 0);

        let stats = p.store().stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.embeddings, stats.chunks);

        let (chunks, _) = p.chunk(&d);
        let q = VectorQuery::new(backend.vector_for(&chunks[0].text), 1, Modality::Docs, "tiny");
        let hits = p.store().similar_chunks(&q).await.unwrap();
        assert!(hits[0].score > 0.99, "real vectors are searchable");

        let third = p.ingest(&d).await.unwrap();
        assert!(!third.created);
        assert_eq!(third.document_id, second.document_id);
    }

    #[tokio::test]
    async fn test_code_emits_symbols() {
        let p = pipeline();
        let code = "import os\n\ndef main():\n    return os.getcwd()\n\nclass Runner:\n    pass\n";
        let out = p.ingest(&doc("tool.py", Modality::Code, code)).await.unwrap();
        assert!(out.symbols >= 2);
        assert!(out.chunks >= 1);
    }

    #[tokio::test]
    async fn test_empty_content_is_validation() {
        let p = pipeline();
        let err = p.ingest(&doc("blank.md", Modality::Docs, "  \n")).await.unwrap_err();
        assert_eq!(err.kind(), rag_harness_core::ErrorKind::Validation);
    }

    #[test]
    fn test_captions_become_caption_chunks() {
        let p = pipeline();
        let d = PreparedDoc {
            source: "album".into(),
            modality: Modality::Captions,
            content: "a dog\na cat".into(),
            captions: Some(vec![
                CaptionItem { id: "1".into(), caption: "a dog".into() },
                CaptionItem { id: "2".into(), caption: "a cat".into() },
            ]),
        };
        let (chunks, _) = p.chunk(&d);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].metadata.caption_id.as_deref(), Some("2"));
    }
}
