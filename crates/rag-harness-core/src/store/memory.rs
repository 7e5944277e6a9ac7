//! In-memory [`VectorStore`] implementation for tests and embedded use.
//!
//! Rows live in `BTreeMap`s behind one `std::sync::RwLock`; similarity search
//! goes through the same [`AnnIndexes`] the SQLite store uses. Analyze and
//! vacuum are no-ops.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::{score_from_distance, sha256_hex};
use crate::error::{RagError, RagResult};
use crate::hnsw::HnswParams;
use crate::models::{
    Chunk, ChunkRecord, Document, DocumentEmbeddings, EmbeddingRow, InsertedDocument, Modality,
    NewDocument, ScoredChunk,
};
use crate::scoring::{TextRanker, ZeroRanker};

use super::ann::AnnIndexes;
use super::{StoreCounters, StoreStats, VectorColumn, VectorQuery, VectorStore};

#[derive(Default)]
struct Inner {
    next_doc_id: i64,
    next_chunk_id: i64,
    documents: BTreeMap<i64, Document>,
    chunks: BTreeMap<i64, ChunkRecord>,
    embeddings: HashMap<(i64, String), EmbeddingRow>,
    keys: HashMap<String, i64>,
}

impl Inner {
    fn chunk_ids_of(&self, document_id: i64) -> Vec<i64> {
        let mut ids: Vec<(usize, i64)> = self
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .map(|c| (c.chunk_index, c.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn fallbacks_of(&self, document_id: i64) -> usize {
        let chunk_ids = self.chunk_ids_of(document_id);
        self.embeddings
            .values()
            .filter(|row| row.fallback && chunk_ids.contains(&row.chunk_id))
            .count()
    }

    fn existing(&self, document_id: i64) -> InsertedDocument {
        InsertedDocument {
            document_id,
            chunk_ids: self.chunk_ids_of(document_id),
            created: false,
            fallbacks: self.fallbacks_of(document_id),
        }
    }

    fn remove_document(&mut self, document_id: i64, ann: &AnnIndexes) {
        if let Some(doc) = self.documents.remove(&document_id) {
            self.keys.remove(&doc.idempotency_key);
        }
        for chunk_id in self.chunk_ids_of(document_id) {
            self.chunks.remove(&chunk_id);
            self.embeddings.retain(|(cid, _), _| *cid != chunk_id);
            ann.remove(chunk_id);
        }
    }
}

/// In-memory store with a declared vector column per modality.
pub struct InMemoryStore {
    columns: HashMap<Modality, VectorColumn>,
    inner: RwLock<Inner>,
    ann: AnnIndexes,
    counters: StoreCounters,
    ranker: Box<dyn TextRanker>,
}

impl InMemoryStore {
    pub fn new(columns: Vec<VectorColumn>) -> Self {
        Self::with_params(columns, HnswParams::default(), 64)
    }

    pub fn with_params(columns: Vec<VectorColumn>, params: HnswParams, ef_search: usize) -> Self {
        Self {
            columns: columns.into_iter().map(|c| (c.modality, c)).collect(),
            inner: RwLock::new(Inner {
                next_doc_id: 1,
                next_chunk_id: 1,
                ..Inner::default()
            }),
            ann: AnnIndexes::new(params, ef_search),
            counters: StoreCounters::default(),
            ranker: Box::new(ZeroRanker),
        }
    }

    pub fn with_ranker(mut self, ranker: Box<dyn TextRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn document(&self, id: i64) -> Option<Document> {
        self.read().documents.get(&id).cloned()
    }

    fn column(&self, modality: Modality) -> RagResult<&VectorColumn> {
        self.columns
            .get(&modality)
            .ok_or_else(|| RagError::validation(format!("no vector column declared for {}", modality)))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn do_insert_embeddings(&self, rows: &[EmbeddingRow]) -> RagResult<usize> {
        let mut inner = self.write();
        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk = inner
                .chunks
                .get(&row.chunk_id)
                .ok_or_else(|| RagError::validation(format!("unknown chunk {}", row.chunk_id)))?;
            let modality = inner
                .documents
                .get(&chunk.document_id)
                .map(|d| d.modality)
                .ok_or_else(|| RagError::unexpected(format!("orphan chunk {}", row.chunk_id)))?;
            self.column(modality)?.check(&row.vector, row.metric)?;
            targets.push(modality);
        }
        for (row, modality) in rows.iter().zip(targets) {
            self.put_embedding(&mut inner, modality, row)?;
        }
        Ok(rows.len())
    }

    /// Store one already validated row.
    fn put_embedding(&self, inner: &mut Inner, modality: Modality, row: &EmbeddingRow) -> RagResult<()> {
        self.ann
            .insert(modality, &row.model_id, row.chunk_id, row.vector.clone())?;
        inner
            .embeddings
            .insert((row.chunk_id, row.model_id.clone()), row.clone());
        Ok(())
    }

    /// Write a new document version. The caller has handled idempotency.
    fn write_document(&self, inner: &mut Inner, doc: &NewDocument, chunks: &[Chunk]) -> InsertedDocument {
        if doc.replace_source {
            let stale: Vec<i64> = inner
                .documents
                .values()
                .filter(|d| d.source == doc.source)
                .map(|d| d.id)
                .collect();
            for id in stale {
                inner.remove_document(id, &self.ann);
            }
        }

        let document_id = inner.next_doc_id;
        inner.next_doc_id += 1;
        inner.documents.insert(
            document_id,
            Document {
                id: document_id,
                source: doc.source.clone(),
                content: doc.content.clone(),
                modality: doc.modality,
                content_hash: sha256_hex(doc.content.as_bytes()),
                idempotency_key: doc.idempotency_key.clone(),
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        inner.keys.insert(doc.idempotency_key.clone(), document_id);

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = inner.next_chunk_id;
            inner.next_chunk_id += 1;
            inner.chunks.insert(
                id,
                ChunkRecord {
                    id,
                    document_id,
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    token_estimate: chunk.token_estimate,
                    metadata: chunk.metadata.clone(),
                },
            );
            chunk_ids.push(id);
        }
        self.counters.insert(1);

        InsertedDocument {
            document_id,
            chunk_ids,
            created: true,
            fallbacks: 0,
        }
    }

    fn do_insert_with_embeddings(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
        embeddings: &DocumentEmbeddings,
    ) -> RagResult<InsertedDocument> {
        self.column(doc.modality)?.check_document(chunks.len(), embeddings)?;
        let incoming = embeddings.fallback_count();
        let mut inner = self.write();

        if let Some(&existing) = inner.keys.get(&doc.idempotency_key) {
            let found = inner.existing(existing);
            if found.fallbacks <= incoming {
                return Ok(found);
            }
            inner.remove_document(existing, &self.ann);
        }

        let mut inserted = self.write_document(&mut inner, doc, chunks);
        let rows = embeddings.rows(&inserted.chunk_ids);
        for row in &rows {
            self.put_embedding(&mut inner, doc.modality, row)?;
        }
        self.counters.insert(rows.len() as u64);
        inserted.fallbacks = incoming;
        Ok(inserted)
    }

    fn do_similar(&self, query: &VectorQuery) -> RagResult<Vec<ScoredChunk>> {
        let column = self.column(query.modality)?;
        if query.vector.len() != column.dim {
            return Err(RagError::DimensionMismatch {
                expected: column.dim,
                actual: query.vector.len(),
            });
        }
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        let found = self
            .ann
            .search(query.modality, &query.model_id, &query.vector, query.top_k);
        let inner = self.read();
        Ok(found
            .into_iter()
            .filter_map(|(id, distance)| {
                let chunk = inner.chunks.get(&id)?;
                let source = inner.documents.get(&chunk.document_id)?.source.clone();
                Some(ScoredChunk {
                    chunk: chunk.clone(),
                    source,
                    distance,
                    score: score_from_distance(distance),
                })
            })
            .collect())
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn insert_document_with_chunks(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
    ) -> RagResult<InsertedDocument> {
        self.column(doc.modality)?;
        let mut inner = self.write();
        if let Some(&existing) = inner.keys.get(&doc.idempotency_key) {
            return Ok(inner.existing(existing));
        }
        Ok(self.write_document(&mut inner, doc, chunks))
    }

    async fn insert_embeddings(&self, rows: &[EmbeddingRow]) -> RagResult<usize> {
        let n = self.counters.track(self.do_insert_embeddings(rows))?;
        self.counters.insert(n as u64);
        Ok(n)
    }

    async fn insert_document_with_embeddings(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
        embeddings: &DocumentEmbeddings,
    ) -> RagResult<InsertedDocument> {
        self.counters
            .track(self.do_insert_with_embeddings(doc, chunks, embeddings))
    }

    async fn similar_chunks(&self, query: &VectorQuery) -> RagResult<Vec<ScoredChunk>> {
        self.counters.query();
        self.counters.track(self.do_similar(query))
    }

    async fn delete_source(&self, source: &str) -> RagResult<u64> {
        let mut inner = self.write();
        let ids: Vec<i64> = inner
            .documents
            .values()
            .filter(|d| d.source == source)
            .map(|d| d.id)
            .collect();
        for id in &ids {
            inner.remove_document(*id, &self.ann);
        }
        Ok(ids.len() as u64)
    }

    async fn analyze(&self) -> RagResult<()> {
        Ok(())
    }

    async fn vacuum(&self) -> RagResult<()> {
        Ok(())
    }

    async fn set_search_quality(&self, ef_search: usize) -> RagResult<()> {
        if ef_search == 0 {
            return Err(RagError::validation("ef_search must be at least 1"));
        }
        self.ann.set_ef_search(ef_search);
        Ok(())
    }

    async fn health_check(&self) -> RagResult<()> {
        Ok(())
    }

    async fn stats(&self) -> RagResult<StoreStats> {
        let inner = self.read();
        let mut stats = StoreStats {
            documents: inner.documents.len() as u64,
            chunks: inner.chunks.len() as u64,
            embeddings: inner.embeddings.len() as u64,
            ef_search: self.ann.ef_search(),
            ..StoreStats::default()
        };
        self.counters.fill(&mut stats);
        Ok(stats)
    }

    fn text_ranker(&self) -> &dyn TextRanker {
        self.ranker.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_document;
    use crate::models::Metric;
    use crate::scoring::{HybridWeights, TermOverlapRanker};

    fn store() -> InMemoryStore {
        InMemoryStore::new(vec![VectorColumn {
            modality: Modality::Docs,
            dim: 3,
            metric: Metric::Cosine,
            model_id: "m".into(),
        }])
    }

    fn new_doc(source: &str, content: &str, key: &str) -> NewDocument {
        NewDocument {
            source: source.into(),
            content: content.into(),
            modality: Modality::Docs,
            idempotency_key: key.into(),
            replace_source: true,
        }
    }

    fn row(chunk_id: i64, vector: Vec<f32>) -> EmbeddingRow {
        EmbeddingRow {
            chunk_id,
            model_id: "m".into(),
            vector,
            metric: Metric::Cosine,
            fallback: false,
        }
    }

    fn embeddings_for(chunks: &[Chunk], vector: Vec<f32>, fallback: bool) -> DocumentEmbeddings {
        DocumentEmbeddings {
            model_id: "m".into(),
            metric: Metric::Cosine,
            vectors: vec![vector; chunks.len()],
            fallback: vec![fallback; chunks.len()],
        }
    }

    #[tokio::test]
    async fn test_idempotent_insert() {
        let s = store();
        let text = "# Notes\n\nFirst sentence here. Second sentence there.";
        let chunks = chunk_document(text, 50, 1, 80, 0.1);
        let first = s
            .insert_document_with_chunks(&new_doc("a.md", text, "k1"), &chunks)
            .await
            .unwrap();
        assert!(first.created);
        let again = s
            .insert_document_with_chunks(&new_doc("a.md", text, "k1"), &chunks)
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.document_id, first.document_id);
        assert_eq!(again.chunk_ids, first.chunk_ids);

        let stats = s.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks as usize, chunks.len());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_atomically() {
        let s = store();
        let chunks = chunk_document("Alpha beta gamma delta.", 50, 1, 80, 0.1);
        let ins = s
            .insert_document_with_chunks(&new_doc("a", "Alpha beta gamma delta.", "k"), &chunks)
            .await
            .unwrap();
        let id = ins.chunk_ids[0];
        let err = s
            .insert_embeddings(&[row(id, vec![1.0, 0.0, 0.0]), row(id, vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 3, actual: 2 }));
        let stats = s.stats().await.unwrap();
        assert_eq!(stats.embeddings, 0);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_search_and_replace_source() {
        let s = store().with_ranker(Box::new(TermOverlapRanker));
        let a = s
            .insert_document_with_chunks(&new_doc("a", "apples are red.", "ka"), &chunk_document("apples are red.", 50, 1, 80, 0.1))
            .await
            .unwrap();
        let b = s
            .insert_document_with_chunks(&new_doc("b", "bananas are yellow.", "kb"), &chunk_document("bananas are yellow.", 50, 1, 80, 0.1))
            .await
            .unwrap();
        s.insert_embeddings(&[row(a.chunk_ids[0], vec![1.0, 0.0, 0.0]), row(b.chunk_ids[0], vec![0.0, 1.0, 0.0])])
            .await
            .unwrap();

        let q = VectorQuery::new(vec![0.9, 0.1, 0.0], 2, Modality::Docs, "m");
        let hits = s.similar_chunks(&q).await.unwrap();
        assert_eq!(hits[0].source, "a");
        assert!(hits[0].score > hits[1].score);

        let hybrid = s
            .hybrid_search(&q, "bananas", HybridWeights { w_vec: 0.1, w_text: 0.9 })
            .await
            .unwrap();
        assert_eq!(hybrid[0].source, "b");

        let c = s
            .insert_document_with_chunks(&new_doc("a", "apples are green now.", "ka2"), &chunk_document("apples are green now.", 50, 1, 80, 0.1))
            .await
            .unwrap();
        assert!(c.created);
        let hits = s.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), 1, "replaced source drops its old vectors");
        assert_eq!(s.delete_source("b").await.unwrap(), 1);
        assert!(s.similar_chunks(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_copy_is_rewritten_once_real_vectors_arrive() {
        let s = store();
        let text = "Alpha beta gamma delta.";
        let chunks = chunk_document(text, 50, 1, 80, 0.1);

        let degraded = s
            .insert_document_with_embeddings(&new_doc("a", text, "k"), &chunks, &embeddings_for(&chunks, vec![0.0, 0.0, 1.0], true))
            .await
            .unwrap();
        assert!(degraded.created);
        assert_eq!(degraded.fallbacks, chunks.len());

        // Still degraded: the stored copy is kept.
        let again = s
            .insert_document_with_embeddings(&new_doc("a", text, "k"), &chunks, &embeddings_for(&chunks, vec![0.0, 1.0, 0.0], true))
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.document_id, degraded.document_id);

        let healed = s
            .insert_document_with_embeddings(&new_doc("a", text, "k"), &chunks, &embeddings_for(&chunks, vec![1.0, 0.0, 0.0], false))
            .await
            .unwrap();
        assert!(healed.created);
        assert_eq!(healed.fallbacks, 0);

        let q = VectorQuery::new(vec![1.0, 0.0, 0.0], 5, Modality::Docs, "m");
        let hits = s.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), chunks.len());
        assert!(hits[0].score > 0.99);
        let stats = s.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.embeddings as usize, chunks.len());

        let settled = s
            .insert_document_with_embeddings(&new_doc("a", text, "k"), &chunks, &embeddings_for(&chunks, vec![1.0, 0.0, 0.0], false))
            .await
            .unwrap();
        assert!(!settled.created);
    }

    #[tokio::test]
    async fn test_bad_vector_leaves_previous_version() {
        let s = store();
        let chunks = chunk_document("apples are red.", 50, 1, 80, 0.1);
        s.insert_document_with_embeddings(&new_doc("a", "apples are red.", "k1"), &chunks, &embeddings_for(&chunks, vec![1.0, 0.0, 0.0], false))
            .await
            .unwrap();

        let next = chunk_document("apples are green.", 50, 1, 80, 0.1);
        let err = s
            .insert_document_with_embeddings(&new_doc("a", "apples are green.", "k2"), &next, &embeddings_for(&next, vec![1.0, 0.0], false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DimensionMismatch);

        let q = VectorQuery::new(vec![1.0, 0.0, 0.0], 5, Modality::Docs, "m");
        let hits = s.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.text.contains("red"));
    }

    #[tokio::test]
    async fn test_set_search_quality() {
        let s = store();
        s.set_search_quality(128).await.unwrap();
        assert_eq!(s.stats().await.unwrap().ef_search, 128);
        assert!(s.set_search_quality(0).await.is_err());
    }
}
