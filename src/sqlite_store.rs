//! SQLite-backed [`VectorStore`].
//!
//! Rows live in the tables created by [`crate::migrate`]. Vectors are stored
//! as compact JSON literals and mirrored into in-memory HNSW graphs that are
//! rebuilt from the `embeddings` table when the store opens. Deletes cascade
//! through foreign keys in SQLite and soft-delete in the graphs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rag_harness_core::embedding::{
    encode_vector_literal, parse_vector_literal, score_from_distance, sha256_hex,
};
use rag_harness_core::hnsw::HnswParams;
use rag_harness_core::models::{
    Chunk, ChunkMetadata, ChunkRecord, DocumentEmbeddings, EmbeddingRow, InsertedDocument, Metric,
    Modality, NewDocument, ScoredChunk,
};
use rag_harness_core::scoring::{ranker_by_name, TextRanker};
use rag_harness_core::store::ann::AnnIndexes;
use rag_harness_core::store::{StoreCounters, StoreStats, VectorColumn, VectorQuery, VectorStore};
use rag_harness_core::{RagError, RagResult};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::config::Config;
use crate::db::{self, read_with_retry, to_rag_error};

pub struct SqliteStore {
    pool: SqlitePool,
    columns: HashMap<Modality, VectorColumn>,
    ann: AnnIndexes,
    counters: StoreCounters,
    ranker: Box<dyn TextRanker>,
    analyze_after: u64,
    vacuum_after: u64,
    inserts_since_analyze: AtomicU64,
    deletes_since_vacuum: AtomicU64,
}

impl SqliteStore {
    /// Open over a migrated pool and rebuild the ANN graphs.
    pub async fn open(pool: SqlitePool, config: &Config) -> Result<Self> {
        let rows: Vec<(String, i64, String, String)> =
            sqlx::query_as("SELECT modality, dim, metric, model_id FROM vector_columns")
                .fetch_all(&pool)
                .await
                .context("failed to read vector columns; run `rag init` first")?;

        let mut columns = HashMap::new();
        for (modality, dim, metric, model_id) in rows {
            let modality: Modality = modality.parse()?;
            let metric = match metric.as_str() {
                "cosine" => Metric::Cosine,
                other => bail!("unsupported metric '{}' for {}", other, modality),
            };
            columns.insert(
                modality,
                VectorColumn {
                    modality,
                    dim: dim as usize,
                    metric,
                    model_id,
                },
            );
        }

        let ranker = match ranker_by_name(&config.retrieval.text_ranker) {
            Some(r) => r,
            None => bail!("Unknown text ranker: {}", config.retrieval.text_ranker),
        };

        let params = HnswParams {
            m: config.index.m,
            ef_construction: config.index.ef_construction,
        };
        let store = Self {
            pool,
            columns,
            ann: AnnIndexes::new(params, config.index.ef_search),
            counters: StoreCounters::default(),
            ranker,
            analyze_after: config.index.analyze_after_inserts,
            vacuum_after: config.index.vacuum_after_deletes,
            inserts_since_analyze: AtomicU64::new(0),
            deletes_since_vacuum: AtomicU64::new(0),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn column(&self, modality: Modality) -> RagResult<&VectorColumn> {
        self.columns
            .get(&modality)
            .ok_or_else(|| RagError::validation(format!("no vector column declared for {}", modality)))
    }

    async fn rebuild_index(&self) -> Result<()> {
        self.ann.clear();
        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.model_id, e.vector, d.modality
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            JOIN documents d ON d.id = c.document_id
            ORDER BY e.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = 0usize;
        for row in &rows {
            let chunk_id: i64 = row.get("chunk_id");
            let model_id: String = row.get("model_id");
            let literal: String = row.get("vector");
            let modality: String = row.get("modality");
            let modality: Modality = modality.parse()?;
            let vector = parse_vector_literal(&literal)
                .with_context(|| format!("corrupt vector for chunk {}", chunk_id))?;
            self.ann.insert(modality, &model_id, chunk_id, vector)?;
            loaded += 1;
        }
        tracing::info!(vectors = loaded, "rebuilt approximate index");
        Ok(())
    }

    async fn modality_of_chunk(&self, chunk_id: i64) -> RagResult<Modality> {
        let pool = &self.pool;
        let found: Option<String> = read_with_retry(|| {
            sqlx::query_scalar(
                "SELECT d.modality FROM chunks c JOIN documents d ON d.id = c.document_id WHERE c.id = ?",
            )
            .bind(chunk_id)
            .fetch_optional(pool)
        })
        .await
        .map_err(to_rag_error)?;
        match found {
            Some(m) => m.parse(),
            None => Err(RagError::validation(format!("unknown chunk {}", chunk_id))),
        }
    }

    async fn existing(&self, key: &str) -> RagResult<Option<InsertedDocument>> {
        let pool = &self.pool;
        let doc: Option<i64> = read_with_retry(|| {
            sqlx::query_scalar("SELECT id FROM documents WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(pool)
        })
        .await
        .map_err(to_rag_error)?;

        let Some(document_id) = doc else { return Ok(None) };
        let chunk_ids: Vec<i64> = read_with_retry(|| {
            sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ? ORDER BY chunk_index")
                .bind(document_id)
                .fetch_all(pool)
        })
        .await
        .map_err(to_rag_error)?;
        let fallbacks: i64 = read_with_retry(|| {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM embeddings e JOIN chunks c ON c.id = e.chunk_id WHERE c.document_id = ? AND e.fallback = 1",
            )
            .bind(document_id)
            .fetch_one(pool)
        })
        .await
        .map_err(to_rag_error)?;

        Ok(Some(InsertedDocument {
            document_id,
            chunk_ids,
            created: false,
            fallbacks: fallbacks as usize,
        }))
    }

    async fn chunk_ids_for_source(&self, source: &str) -> RagResult<Vec<i64>> {
        let pool = &self.pool;
        read_with_retry(|| {
            sqlx::query_scalar(
                "SELECT c.id FROM chunks c JOIN documents d ON d.id = c.document_id WHERE d.source = ?",
            )
            .bind(source)
            .fetch_all(pool)
        })
        .await
        .map_err(to_rag_error)
    }

    async fn do_insert_document(&self, doc: &NewDocument, chunks: &[Chunk]) -> RagResult<InsertedDocument> {
        self.column(doc.modality)?;
        if let Some(found) = self.existing(&doc.idempotency_key).await? {
            return Ok(found);
        }
        let metadata = encode_metadata(chunks)?;

        let stale = if doc.replace_source {
            self.chunk_ids_for_source(&doc.source).await?
        } else {
            Vec::new()
        };

        let mut tx = self.pool.begin().await.map_err(to_rag_error)?;
        let (document_id, chunk_ids) = match write_document(&mut *tx, doc, chunks, &metadata).await {
            Ok(ids) => ids,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                drop(tx);
                return self.raced(&doc.idempotency_key).await;
            }
            Err(e) => return Err(to_rag_error(e)),
        };
        tx.commit().await.map_err(to_rag_error)?;

        for id in stale {
            self.ann.remove(id);
        }
        self.counters.insert(1);

        Ok(InsertedDocument {
            document_id,
            chunk_ids,
            created: true,
            fallbacks: 0,
        })
    }

    /// Lost a race with an identical ingest; report its rows.
    async fn raced(&self, key: &str) -> RagResult<InsertedDocument> {
        match self.existing(key).await? {
            Some(found) => Ok(found),
            None => Err(RagError::unexpected("idempotency key vanished during insert")),
        }
    }

    async fn do_insert_embeddings(&self, rows: &[EmbeddingRow]) -> RagResult<usize> {
        let mut targets = Vec::with_capacity(rows.len());
        let mut literals = Vec::with_capacity(rows.len());
        for row in rows {
            let modality = self.modality_of_chunk(row.chunk_id).await?;
            self.column(modality)?.check(&row.vector, row.metric)?;
            literals.push(encode_vector_literal(&row.vector)?);
            targets.push(modality);
        }

        let mut tx = self.pool.begin().await.map_err(to_rag_error)?;
        write_embeddings(&mut *tx, rows, &literals)
            .await
            .map_err(to_rag_error)?;
        tx.commit().await.map_err(to_rag_error)?;

        for (row, modality) in rows.iter().zip(targets) {
            self.ann
                .insert(modality, &row.model_id, row.chunk_id, row.vector.clone())?;
        }
        Ok(rows.len())
    }

    /// Document, chunks and vectors in one transaction. A stored copy with
    /// the same key is reused unless it holds more fallback vectors.
    async fn do_insert_with_embeddings(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
        embeddings: &DocumentEmbeddings,
    ) -> RagResult<InsertedDocument> {
        self.column(doc.modality)?.check_document(chunks.len(), embeddings)?;
        let incoming = embeddings.fallback_count();

        let existing = self.existing(&doc.idempotency_key).await?;
        if let Some(found) = &existing {
            if found.fallbacks <= incoming {
                return Ok(found.clone());
            }
            tracing::info!(source = %doc.source, stored = found.fallbacks, incoming, "replacing fallback vectors");
        }

        let metadata = encode_metadata(chunks)?;
        let literals = embeddings
            .vectors
            .iter()
            .map(|v| encode_vector_literal(v))
            .collect::<RagResult<Vec<_>>>()?;

        let mut stale = existing.as_ref().map(|f| f.chunk_ids.clone()).unwrap_or_default();
        if doc.replace_source {
            stale.extend(self.chunk_ids_for_source(&doc.source).await?);
        }

        let mut tx = self.pool.begin().await.map_err(to_rag_error)?;
        if existing.is_some() {
            sqlx::query("DELETE FROM documents WHERE idempotency_key = ?")
                .bind(&doc.idempotency_key)
                .execute(&mut *tx)
                .await
                .map_err(to_rag_error)?;
        }
        let (document_id, chunk_ids) = match write_document(&mut *tx, doc, chunks, &metadata).await {
            Ok(ids) => ids,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                drop(tx);
                return self.raced(&doc.idempotency_key).await;
            }
            Err(e) => return Err(to_rag_error(e)),
        };
        let rows = embeddings.rows(&chunk_ids);
        write_embeddings(&mut *tx, &rows, &literals)
            .await
            .map_err(to_rag_error)?;
        tx.commit().await.map_err(to_rag_error)?;

        for id in stale {
            self.ann.remove(id);
        }
        for row in &rows {
            self.ann
                .insert(doc.modality, &row.model_id, row.chunk_id, row.vector.clone())?;
        }
        self.counters.insert(1 + rows.len() as u64);

        Ok(InsertedDocument {
            document_id,
            chunk_ids,
            created: true,
            fallbacks: incoming,
        })
    }

    async fn do_similar(&self, query: &VectorQuery) -> RagResult<Vec<ScoredChunk>> {
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
        if found.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; found.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.text, c.token_estimate, c.metadata_json, d.source
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.id IN ({})
            "#,
            placeholders
        );
        let pool = &self.pool;
        let rows = read_with_retry(|| {
            let mut q = sqlx::query(&sql);
            for (id, _) in &found {
                q = q.bind(*id);
            }
            q.fetch_all(pool)
        })
        .await
        .map_err(to_rag_error)?;

        let mut by_id: HashMap<i64, (ChunkRecord, String)> = HashMap::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.get("metadata_json");
            let metadata: ChunkMetadata = serde_json::from_str(&metadata_json)
                .map_err(|e| RagError::unexpected(format!("corrupt chunk metadata: {}", e)))?;
            let record = ChunkRecord {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get::<i64, _>("chunk_index") as usize,
                text: row.get("text"),
                token_estimate: row.get::<i64, _>("token_estimate") as usize,
                metadata,
            };
            by_id.insert(record.id, (record, row.get("source")));
        }

        Ok(found
            .into_iter()
            .filter_map(|(id, distance)| {
                let (chunk, source) = by_id.remove(&id)?;
                Some(ScoredChunk {
                    chunk,
                    source,
                    distance,
                    score: score_from_distance(distance),
                })
            })
            .collect())
    }

    async fn count(&self, table: &str) -> RagResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let pool = &self.pool;
        let n: i64 = read_with_retry(|| sqlx::query_scalar(&sql).fetch_one(pool))
            .await
            .map_err(to_rag_error)?;
        Ok(n as u64)
    }

    async fn maybe_analyze(&self, inserted: u64) {
        if self.analyze_after == 0 {
            return;
        }
        let total = self.inserts_since_analyze.fetch_add(inserted, Ordering::Relaxed) + inserted;
        if total >= self.analyze_after {
            self.inserts_since_analyze.store(0, Ordering::Relaxed);
            if let Err(e) = self.analyze().await {
                tracing::warn!(error = %e, "automatic analyze failed");
            }
        }
    }

    async fn maybe_vacuum(&self, deleted: u64) {
        if self.vacuum_after == 0 || deleted == 0 {
            return;
        }
        let total = self.deletes_since_vacuum.fetch_add(deleted, Ordering::Relaxed) + deleted;
        if total >= self.vacuum_after {
            self.deletes_since_vacuum.store(0, Ordering::Relaxed);
            if let Err(e) = self.vacuum().await {
                tracing::warn!(error = %e, "automatic vacuum failed");
            }
        }
    }
}

fn encode_metadata(chunks: &[Chunk]) -> RagResult<Vec<String>> {
    chunks
        .iter()
        .map(|chunk| {
            serde_json::to_string(&chunk.metadata)
                .map_err(|e| RagError::unexpected(format!("failed to encode chunk metadata: {}", e)))
        })
        .collect()
}

/// Insert the document row and its chunks, replacing the source if asked.
async fn write_document(
    conn: &mut SqliteConnection,
    doc: &NewDocument,
    chunks: &[Chunk],
    metadata: &[String],
) -> Result<(i64, Vec<i64>), sqlx::Error> {
    if doc.replace_source {
        sqlx::query("DELETE FROM documents WHERE source = ?")
            .bind(&doc.source)
            .execute(&mut *conn)
            .await?;
    }

    let document_id = sqlx::query(
        "INSERT INTO documents (source, modality, content, content_hash, idempotency_key, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&doc.source)
    .bind(doc.modality.as_str())
    .bind(&doc.content)
    .bind(sha256_hex(doc.content.as_bytes()))
    .bind(&doc.idempotency_key)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let mut chunk_ids = Vec::with_capacity(chunks.len());
    for (chunk, metadata) in chunks.iter().zip(metadata) {
        let done = sqlx::query(
            "INSERT INTO chunks (document_id, chunk_index, text, token_estimate, metadata_json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.text)
        .bind(chunk.token_estimate as i64)
        .bind(metadata)
        .execute(&mut *conn)
        .await?;
        chunk_ids.push(done.last_insert_rowid());
    }
    Ok((document_id, chunk_ids))
}

/// Upsert validated rows; `literals[i]` is the encoded `rows[i].vector`.
async fn write_embeddings(
    conn: &mut SqliteConnection,
    rows: &[EmbeddingRow],
    literals: &[String],
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    for (row, literal) in rows.iter().zip(literals) {
        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, model_id, dim, metric, vector, fallback, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id, model_id) DO UPDATE SET
                dim = excluded.dim,
                metric = excluded.metric,
                vector = excluded.vector,
                fallback = excluded.fallback,
                created_at = excluded.created_at
            "#,
        )
        .bind(row.chunk_id)
        .bind(&row.model_id)
        .bind(row.vector.len() as i64)
        .bind(row.metric.as_str())
        .bind(literal)
        .bind(row.fallback)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn insert_document_with_chunks(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
    ) -> RagResult<InsertedDocument> {
        self.counters.track(self.do_insert_document(doc, chunks).await)
    }

    async fn insert_embeddings(&self, rows: &[EmbeddingRow]) -> RagResult<usize> {
        let n = self.counters.track(self.do_insert_embeddings(rows).await)?;
        self.counters.insert(n as u64);
        self.maybe_analyze(n as u64).await;
        Ok(n)
    }

    async fn insert_document_with_embeddings(
        &self,
        doc: &NewDocument,
        chunks: &[Chunk],
        embeddings: &DocumentEmbeddings,
    ) -> RagResult<InsertedDocument> {
        let inserted = self
            .counters
            .track(self.do_insert_with_embeddings(doc, chunks, embeddings).await)?;
        if inserted.created {
            self.maybe_analyze(inserted.chunk_ids.len() as u64).await;
        }
        Ok(inserted)
    }

    async fn similar_chunks(&self, query: &VectorQuery) -> RagResult<Vec<ScoredChunk>> {
        self.counters.query();
        self.counters.track(self.do_similar(query).await)
    }

    async fn delete_source(&self, source: &str) -> RagResult<u64> {
        let chunk_ids = self.chunk_ids_for_source(source).await?;
        let done = sqlx::query("DELETE FROM documents WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(to_rag_error);
        let removed = self.counters.track(done)?.rows_affected();
        for id in chunk_ids {
            self.ann.remove(id);
        }
        self.maybe_vacuum(removed).await;
        Ok(removed)
    }

    async fn analyze(&self) -> RagResult<()> {
        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .map_err(to_rag_error)?;
        tracing::debug!("analyze complete");
        Ok(())
    }

    async fn vacuum(&self) -> RagResult<()> {
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(to_rag_error)?;
        tracing::debug!("vacuum complete");
        Ok(())
    }

    async fn set_search_quality(&self, ef_search: usize) -> RagResult<()> {
        if ef_search == 0 {
            return Err(RagError::validation("ef_search must be at least 1"));
        }
        self.ann.set_ef_search(ef_search);
        tracing::info!(ef_search, "search quality changed");
        Ok(())
    }

    async fn health_check(&self) -> RagResult<()> {
        db::health_check(&self.pool).await.map_err(to_rag_error)
    }

    async fn stats(&self) -> RagResult<StoreStats> {
        let mut stats = StoreStats {
            documents: self.count("documents").await?,
            chunks: self.count("chunks").await?,
            embeddings: self.count("embeddings").await?,
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
    use crate::config::validate;
    use crate::migrate::run_migrations;
    use rag_harness_core::chunk::chunk_document;
    use rag_harness_core::embedding::fallback_vector;
    use rag_harness_core::scoring::HybridWeights;

    async fn open_store(dir: &std::path::Path, extra: &str) -> (Config, SqliteStore) {
        let text = format!(
            "[db]\npath = \"{}\"\n[embedding]\ntext_model = \"tiny\"\n[[models]]\nid = \"tiny\"\ndims = 4\n{}",
            dir.join("rag.sqlite").display(),
            extra
        );
        let config: Config = toml::from_str(&text).unwrap();
        validate(&config).unwrap();
        let pool = db::connect(&config).await.unwrap();
        run_migrations(&pool, &config).await.unwrap();
        let store = SqliteStore::open(pool, &config).await.unwrap();
        (config, store)
    }

    fn doc(source: &str, content: &str, key: &str) -> NewDocument {
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
            model_id: "tiny".into(),
            vector,
            metric: Metric::Cosine,
            fallback: false,
        }
    }

    fn vectors(chunks: &[Chunk], vector: Vec<f32>, fallback: bool) -> DocumentEmbeddings {
        DocumentEmbeddings {
            model_id: "tiny".into(),
            metric: Metric::Cosine,
            vectors: vec![vector; chunks.len()],
            fallback: vec![fallback; chunks.len()],
        }
    }

    async fn ingest(store: &SqliteStore, source: &str, content: &str, key: &str, vector: Vec<f32>) -> InsertedDocument {
        let chunks = chunk_document(content, 50, 1, 80, 0.1);
        let ins = store.insert_document_with_chunks(&doc(source, content, key), &chunks).await.unwrap();
        let rows: Vec<EmbeddingRow> = ins.chunk_ids.iter().map(|&id| row(id, vector.clone())).collect();
        store.insert_embeddings(&rows).await.unwrap();
        ins
    }

    #[tokio::test]
    async fn test_idempotent_insert_adds_no_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "").await;
        let text = "Rust is a systems language. It has no garbage collector.";
        let chunks = chunk_document(text, 50, 1, 80, 0.1);
        let a = store.insert_document_with_chunks(&doc("a.md", text, "k"), &chunks).await.unwrap();
        let b = store.insert_document_with_chunks(&doc("a.md", text, "k"), &chunks).await.unwrap();
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.chunk_ids, b.chunk_ids);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks as usize, chunks.len());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "").await;
        let chunks = chunk_document("One sentence only.", 50, 1, 80, 0.1);
        let ins = store.insert_document_with_chunks(&doc("a", "One sentence only.", "k"), &chunks).await.unwrap();
        let id = ins.chunk_ids[0];

        let err = store
            .insert_embeddings(&[row(id, vec![1.0, 0.0, 0.0, 0.0]), row(id, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 4, actual: 3 }));
        assert_eq!(store.stats().await.unwrap().embeddings, 0);
    }

    #[tokio::test]
    async fn test_search_ranks_nearest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "").await;
        ingest(&store, "a", "Apples grow on trees.", "ka", vec![1.0, 0.0, 0.0, 0.0]).await;
        ingest(&store, "b", "Boats float on water.", "kb", vec![0.0, 1.0, 0.0, 0.0]).await;

        let q = VectorQuery::new(vec![0.9, 0.1, 0.0, 0.0], 5, Modality::Docs, "tiny");
        let hits = store.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, "a");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));

        let hybrid = store
            .hybrid_search(&q, "boats", HybridWeights::default())
            .await
            .unwrap();
        assert_eq!(hybrid.len(), 2);
    }

    #[tokio::test]
    async fn test_index_rebuilt_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store) = open_store(tmp.path(), "").await;
        ingest(&store, "a", "Persisted vectors survive restarts.", "ka", fallback_vector("x", 4)).await;
        let pool = store.pool().clone();
        drop(store);

        let reopened = SqliteStore::open(pool, &config).await.unwrap();
        let q = VectorQuery::new(fallback_vector("x", 4), 3, Modality::Docs, "tiny");
        let hits = reopened.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_delete_source_cascades() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "").await;
        ingest(&store, "gone", "Soon to be removed.", "k", vec![0.0, 0.0, 1.0, 0.0]).await;
        assert_eq!(store.delete_source("gone").await.unwrap(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.documents, stats.chunks, stats.embeddings), (0, 0, 0));
        let q = VectorQuery::new(vec![0.0, 0.0, 1.0, 0.0], 3, Modality::Docs, "tiny");
        assert!(store.similar_chunks(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_and_search_quality() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "[index]\nanalyze_after_inserts = 1\nvacuum_after_deletes = 1\n").await;
        ingest(&store, "a", "Analyze runs after this insert.", "k", vec![1.0, 1.0, 0.0, 0.0]).await;
        store.delete_source("a").await.unwrap();
        store.analyze().await.unwrap();
        store.vacuum().await.unwrap();
        store.health_check().await.unwrap();

        store.set_search_quality(200).await.unwrap();
        assert_eq!(store.stats().await.unwrap().ef_search, 200);
        assert!(store.set_search_quality(0).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_embedding_write_keeps_previous_version() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "").await;
        let old = "The old version stays searchable.";
        let chunks = chunk_document(old, 50, 1, 80, 0.1);
        store
            .insert_document_with_embeddings(&doc("a.md", old, "k1"), &chunks, &vectors(&chunks, vec![1.0, 0.0, 0.0, 0.0], false))
            .await
            .unwrap();

        sqlx::query("CREATE TRIGGER reject_embeddings BEFORE INSERT ON embeddings BEGIN SELECT RAISE(ABORT, 'disk full'); END")
            .execute(store.pool())
            .await
            .unwrap();

        let new = "A new version that never lands.";
        let next = chunk_document(new, 50, 1, 80, 0.1);
        let err = store
            .insert_document_with_embeddings(&doc("a.md", new, "k2"), &next, &vectors(&next, vec![0.0, 1.0, 0.0, 0.0], false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.embeddings as usize, chunks.len());
        let content: String = sqlx::query_scalar("SELECT content FROM documents WHERE source = 'a.md'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(content, old);

        let q = VectorQuery::new(vec![1.0, 0.0, 0.0, 0.0], 3, Modality::Docs, "tiny");
        let hits = store.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), chunks.len());
        assert_eq!(hits[0].source, "a.md");
    }

    #[tokio::test]
    async fn test_fallback_rows_are_replaced_after_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = open_store(tmp.path(), "").await;
        let text = "Embedded while the backend was down.";
        let chunks = chunk_document(text, 50, 1, 80, 0.1);

        let degraded = store
            .insert_document_with_embeddings(&doc("a.md", text, "k"), &chunks, &vectors(&chunks, fallback_vector(text, 4), true))
            .await
            .unwrap();
        assert!(degraded.created);
        assert_eq!(degraded.fallbacks, chunks.len());

        let healed = store
            .insert_document_with_embeddings(&doc("a.md", text, "k"), &chunks, &vectors(&chunks, vec![0.0, 0.0, 0.0, 1.0], false))
            .await
            .unwrap();
        assert!(healed.created);
        assert_eq!(healed.fallbacks, 0);
        assert_ne!(healed.document_id, degraded.document_id);

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE fallback = 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(stored, 0);
        let q = VectorQuery::new(vec![0.0, 0.0, 0.0, 1.0], 3, Modality::Docs, "tiny");
        let hits = store.similar_chunks(&q).await.unwrap();
        assert_eq!(hits.len(), chunks.len());
        assert!(hits[0].score > 0.99);

        let again = store
            .insert_document_with_embeddings(&doc("a.md", text, "k"), &chunks, &vectors(&chunks, vec![0.0, 0.0, 0.0, 1.0], false))
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(store.stats().await.unwrap().documents, 1);
    }
}
