//! The service surface shared by the CLI and the HTTP server.
//!
//! [`RagService`] owns every component: the SQLite store, the embedding
//! client, the model manager, the ingestion pipeline, and the indexing
//! orchestrator. Callers only submit content, query, and consume events.
//!
//! | Operation | Returns |
//! |-----------|---------|
//! | [`ingest_stream`](RagService::ingest_stream) | correlation id + event receiver |
//! | [`query`](RagService::query) | scored hits with highlights |
//! | [`index`](RagService::index) | correlation id + events + session handle |
//! | [`watch`](RagService::watch) | number of runs once stopped |
//! | [`maintenance`](RagService::maintenance) | `analyze`, `vacuum`, `search_quality` |
//! | [`models`](RagService::models) / [`stats`](RagService::stats) / [`health`](RagService::health) | status snapshots |
//!
//! Request limits (item count, content length, allow-listed paths, rate
//! limits) are checked before anything is queued, so a rejected request
//! produces an error and no events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rag_harness_core::models::{CaptionItem, Modality};
use rag_harness_core::scoring::{extract_highlights, HybridWeights};
use rag_harness_core::store::{StoreStats, VectorQuery, VectorStore};
use rag_harness_core::{RagError, RagResult};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::embedding::{create_backend, EmbeddingBackend, EmbeddingClient, EmbeddingMetrics};
use crate::events::{channel, drain, new_correlation_id, EventEnvelope, EventSink, IngestEvent, ProgressMode};
use crate::model_manager::{ModelLoader, ModelManager, ModelRecord, NoopLoader, OllamaLoader, SystemMemoryProbe};
use crate::orchestrator::queue::{DeadLetter, IngestQueue, Job, Lane, QueueConfig, QueueCounters, QueueSummary};
use crate::orchestrator::scan::FileType;
use crate::orchestrator::tracking::IndexingSession;
use crate::orchestrator::watch::absolute;
use crate::orchestrator::{image_description, lane_for, Orchestrator, WatchOptions};
use crate::pipeline::{Pipeline, PreparedDoc};
use crate::redact::Redactor;
use crate::sqlite_store::SqliteStore;

// ============ Requests and responses ============

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IngestRequest {
    pub items: Vec<IngestItem>,
}

/// One piece of content. Exactly one of `content`, `path`, or `captions`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IngestItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Defaults to the file type for `path`, `captions` for captions, and
    /// `docs` otherwise.
    #[serde(default)]
    pub modality: Option<Modality>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub captions: Option<Vec<CaptionItem>>,
}

impl IngestItem {
    pub fn text(source: impl Into<String>, modality: Modality, content: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            modality: Some(modality),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>, modality: Option<Modality>) -> Self {
        Self {
            path: Some(path.into()),
            modality,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryRequest {
    pub q: String,
    #[serde(default = "default_query_modality")]
    pub modality: Modality,
    #[serde(default)]
    pub top_k: Option<usize>,
}

fn default_query_modality() -> Modality {
    Modality::Docs
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    /// Chunk id.
    pub id: i64,
    pub score: f64,
    pub highlights: Vec<String>,
    pub source: String,
    pub document_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub hits: Vec<QueryHit>,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum MaintenanceOp {
    Analyze,
    Vacuum,
    SearchQuality { ef_search: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub store: StoreStats,
    pub embedding: EmbeddingMetrics,
    pub queue: QueueSummary,
    pub models_loaded: usize,
    pub recent_sessions: Vec<IndexingSession>,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: bool,
    pub backend: String,
    pub error: Option<String>,
}

/// A running indexing session.
pub struct IndexRun {
    pub correlation_id: String,
    pub events: mpsc::Receiver<EventEnvelope>,
    pub session: JoinHandle<RagResult<IndexingSession>>,
}

// ============ Service ============

pub struct RagService {
    config: Config,
    pool: SqlitePool,
    store: Arc<SqliteStore>,
    client: Arc<EmbeddingClient>,
    manager: Arc<ModelManager>,
    pipeline: Arc<Pipeline>,
    orchestrator: Arc<Orchestrator>,
    counters: Arc<QueueCounters>,
    limiters: HashMap<Modality, DefaultDirectRateLimiter>,
    redactor: Redactor,
    started: Instant,
}

impl RagService {
    /// Connect, migrate, and wire every component from `config`.
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        let backend = create_backend(&config.embedding)?;
        Self::open_with_backend(config, backend).await
    }

    /// Like [`open`](Self::open) with an explicit embedding backend.
    pub async fn open_with_backend(config: Config, backend: Arc<dyn EmbeddingBackend>) -> Result<Arc<Self>> {
        let pool = crate::db::connect(&config).await?;
        crate::migrate::run_migrations(&pool, &config)
            .await
            .context("schema migration failed")?;
        let store = Arc::new(SqliteStore::open(pool.clone(), &config).await?);

        let registry = config.registry();
        let loader: Arc<dyn ModelLoader> = if config.embedding.provider == "ollama" {
            let mm = &config.model_manager;
            Arc::new(OllamaLoader::new(
                config.embedding.base_url(),
                Duration::from_secs(mm.response_timeout_secs),
                mm.text_vram_timeout_secs.max(mm.vision_vram_timeout_secs),
            )?)
        } else {
            Arc::new(NoopLoader)
        };
        let manager = ModelManager::init(
            &config.model_manager,
            &registry,
            loader,
            Arc::new(SystemMemoryProbe::new()),
        );

        let client = Arc::new(EmbeddingClient::from_config(&config, backend, Some(Arc::clone(&manager))));
        let pipeline = Arc::new(Pipeline::new(&config, store.clone(), Arc::clone(&client)));
        let counters = Arc::new(QueueCounters::default());
        let orchestrator = Arc::new(Orchestrator::new(
            &config.indexing,
            Arc::clone(&pipeline),
            pool.clone(),
            Arc::clone(&counters),
        ));

        let limiters = Modality::ALL
            .iter()
            .filter_map(|&m| {
                let per_minute = NonZeroU32::new(config.limits.rate_limits.per_minute(m)?)?;
                Some((m, RateLimiter::direct(Quota::per_minute(per_minute))))
            })
            .collect();

        tracing::info!(
            db = %config.db.path.display(),
            backend = client.backend_name(),
            models = registry.len(),
            "rag service ready"
        );

        Ok(Arc::new(Self {
            redactor: Redactor::new(&config.privacy),
            config,
            pool,
            store,
            client,
            manager,
            pipeline,
            orchestrator,
            counters,
            limiters,
            started: Instant::now(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    // ============ Ingestion ============

    /// Validate `request`, queue its items, and stream their events.
    pub async fn ingest_stream(
        self: &Arc<Self>,
        request: IngestRequest,
    ) -> RagResult<(String, mpsc::Receiver<EventEnvelope>)> {
        let docs = self.prepare(request).await?;
        let correlation_id = new_correlation_id();
        let (sink, rx) = channel(correlation_id.clone(), self.config.indexing.event_buffer);
        tracing::info!(correlation_id = %correlation_id, items = docs.len(), "ingest accepted");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_ingest(docs, sink).await });
        Ok((correlation_id, rx))
    }

    async fn run_ingest(&self, docs: Vec<(String, PreparedDoc)>, sink: EventSink) {
        let total = docs.len() as u64;
        sink.emit(IngestEvent::Enqueued { scheduled: total, total }).await;
        sink.emit(IngestEvent::Accepted { total }).await;

        let queue = IngestQueue::start(
            QueueConfig::from_indexing(&self.config.indexing),
            Some(self.orchestrator.dead_letters().clone()),
            Some(sink.clone()),
            Arc::clone(&self.counters),
        );
        for (item_id, doc) in docs {
            queue.submit(Arc::new(DocJob {
                item_id,
                pipeline: Arc::clone(&self.pipeline),
                doc,
            }));
        }
        let summary = queue.drain().await;
        sink.emit(IngestEvent::Complete {
            processed: summary.processed(),
            successful: summary.successful,
            failed: summary.failed,
        })
        .await;
    }

    /// Check limits and load every item. Nothing is queued on error.
    async fn prepare(&self, request: IngestRequest) -> RagResult<Vec<(String, PreparedDoc)>> {
        let limits = &self.config.limits;
        if request.items.is_empty() {
            return Err(RagError::validation("ingest request has no items"));
        }
        if request.items.len() > limits.max_items {
            return Err(RagError::validation(format!(
                "ingest request has {} items; the limit is {}",
                request.items.len(),
                limits.max_items
            )));
        }

        let mut seen = HashSet::new();
        let mut docs = Vec::with_capacity(request.items.len());
        for (index, item) in request.items.into_iter().enumerate() {
            let doc = self.prepare_item(index, item.clone()).await?;
            let item_id = item.id.unwrap_or_else(|| doc.source.clone());
            if !seen.insert(item_id.clone()) {
                return Err(RagError::validation(format!("duplicate item '{}' in request", item_id)));
            }
            docs.push((item_id, doc));
        }

        self.check_rate_limits(&docs)?;
        Ok(docs)
    }

    /// Take one cell per item from each modality's limiter. A modality's
    /// cells are taken together or not at all.
    fn check_rate_limits(&self, docs: &[(String, PreparedDoc)]) -> RagResult<()> {
        let mut per_modality: HashMap<Modality, u32> = HashMap::new();
        for (_, doc) in docs {
            *per_modality.entry(doc.modality).or_default() += 1;
        }
        for (modality, count) in per_modality {
            let (Some(limiter), Some(n)) = (self.limiters.get(&modality), NonZeroU32::new(count)) else {
                continue;
            };
            if !matches!(limiter.check_n(n), Ok(Ok(()))) {
                return Err(RagError::RateLimited(format!(
                    "{} ingestion is limited to {} items per minute",
                    modality,
                    self.config.limits.rate_limits.per_minute(modality).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    async fn prepare_item(&self, index: usize, item: IngestItem) -> RagResult<PreparedDoc> {
        let max_len = self.config.limits.max_content_length;
        let given = [item.content.is_some(), item.path.is_some(), item.captions.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        if given != 1 {
            return Err(RagError::validation(format!(
                "item {}: set exactly one of content, path, or captions",
                index
            )));
        }

        if let Some(content) = item.content {
            if content.len() > max_len {
                return Err(RagError::validation(format!(
                    "item {}: content is {} bytes; the limit is {}",
                    index,
                    content.len(),
                    max_len
                )));
            }
            let source = item
                .source
                .or(item.id)
                .unwrap_or_else(|| format!("inline:{}", uuid::Uuid::new_v4()));
            return Ok(PreparedDoc {
                source,
                modality: item.modality.unwrap_or(Modality::Docs),
                content,
                captions: None,
            });
        }

        if let Some(captions) = item.captions {
            if captions.is_empty() {
                return Err(RagError::validation(format!("item {}: captions are empty", index)));
            }
            let content = captions.iter().map(|c| c.caption.as_str()).collect::<Vec<_>>().join("\n");
            if content.len() > max_len {
                return Err(RagError::validation(format!(
                    "item {}: captions are {} bytes; the limit is {}",
                    index,
                    content.len(),
                    max_len
                )));
            }
            let source = item
                .source
                .or(item.id)
                .unwrap_or_else(|| format!("captions:{}", uuid::Uuid::new_v4()));
            return Ok(PreparedDoc {
                source,
                modality: item.modality.unwrap_or(Modality::Captions),
                content,
                captions: Some(captions),
            });
        }

        let Some(path) = item.path else {
            return Err(RagError::validation(format!("item {}: nothing to ingest", index)));
        };
        let path = self.allowed_path(&path)?;
        let size = tokio::fs::metadata(&path).await?.len();
        if size as usize > max_len {
            return Err(RagError::validation(format!(
                "{} is {} bytes; the limit is {}",
                path.display(),
                size,
                max_len
            )));
        }
        let file_type = FileType::from_path(&path);
        let modality = item.modality.unwrap_or(file_type.modality());
        let content = if modality.is_visual() {
            image_description(&path.to_string_lossy())
        } else {
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RagError::validation(format!("cannot read {}: {}", path.display(), e)))?
        };
        Ok(PreparedDoc {
            source: item.source.unwrap_or_else(|| path.to_string_lossy().to_string()),
            modality,
            content,
            captions: None,
        })
    }

    /// Canonical `path` if it lies under an allowed directory.
    ///
    /// With no `limits.allowed_paths`, only the indexing root is allowed.
    fn allowed_path(&self, path: &Path) -> RagResult<PathBuf> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|e| RagError::validation(format!("cannot read {}: {}", path.display(), e)))?;
        let mut allowed: Vec<&Path> = self.config.limits.allowed_paths.iter().map(PathBuf::as_path).collect();
        if allowed.is_empty() {
            allowed.extend(self.config.indexing.root.as_deref());
        }
        let permitted = allowed.iter().any(|dir| {
            std::fs::canonicalize(dir)
                .map(|dir| canonical.starts_with(dir))
                .unwrap_or(false)
        });
        if !permitted {
            return Err(RagError::validation(format!(
                "{} is outside the allowed paths",
                path.display()
            )));
        }
        Ok(canonical)
    }

    // ============ Query ============

    pub async fn query(&self, request: &QueryRequest) -> RagResult<QueryResponse> {
        let retrieval = &self.config.retrieval;
        let q = request.q.trim();
        if q.is_empty() {
            return Err(RagError::validation("query text is empty"));
        }
        if q.len() > self.config.limits.max_content_length {
            return Err(RagError::validation("query text is too long"));
        }
        let top_k = request.top_k.unwrap_or(retrieval.default_top_k);
        if top_k == 0 || top_k > retrieval.max_top_k {
            return Err(RagError::validation(format!(
                "top_k must be between 1 and {}",
                retrieval.max_top_k
            )));
        }

        let model_id = self.pipeline.model_for(request.modality);
        let (vector, fallback) = self.client.embed_one(model_id, q).await?;
        let mut vq = VectorQuery::new(vector, top_k, request.modality, model_id);
        vq.candidate_multiplier = retrieval.candidate_multiplier;
        let weights = HybridWeights {
            w_vec: retrieval.w_vec,
            w_text: retrieval.w_text,
        };
        let scored = self.store.hybrid_search(&vq, q, weights).await?;

        let hits: Vec<QueryHit> = scored
            .into_iter()
            .map(|hit| QueryHit {
                id: hit.chunk.id,
                score: hit.score,
                highlights: extract_highlights(&hit.chunk.text, q, retrieval.max_highlights)
                    .into_iter()
                    .map(|h| self.redactor.highlight(h))
                    .collect(),
                source: hit.source,
                document_id: hit.chunk.document_id,
            })
            .collect();

        tracing::info!(
            query = %self.redactor.for_log(q),
            modality = %request.modality,
            top_k,
            hits = hits.len(),
            fallback,
            "query"
        );
        Ok(QueryResponse {
            total: hits.len(),
            hits,
        })
    }

    // ============ Indexing ============

    /// Start an indexing session over `root`, or the configured root.
    pub fn index(&self, root: Option<PathBuf>) -> RagResult<IndexRun> {
        let root = root
            .or_else(|| self.config.indexing.root.clone())
            .ok_or_else(|| RagError::validation("no indexing root: pass one or set indexing.root"))?;
        let correlation_id = new_correlation_id();
        let (sink, events) = channel(correlation_id.clone(), self.config.indexing.event_buffer);
        let orchestrator = Arc::clone(&self.orchestrator);
        let session = tokio::spawn(async move { orchestrator.run(&root, sink).await });
        Ok(IndexRun {
            correlation_id,
            events,
            session,
        })
    }

    /// Keep `root` (or the configured root) indexed until `shutdown`
    /// resolves. Each run gets its own correlation id; its events go to a
    /// reporter built by `mode`.
    pub async fn watch<F>(&self, root: Option<PathBuf>, mode: ProgressMode, shutdown: F) -> RagResult<u64>
    where
        F: Future<Output = ()>,
    {
        let root = root
            .or_else(|| self.config.indexing.root.clone())
            .ok_or_else(|| RagError::validation("no indexing root: pass one or set indexing.root"))?;
        let mut options = WatchOptions::from_indexing(&self.config.indexing);
        options.ignore.push(absolute(&self.config.db.path));

        let buffer = self.config.indexing.event_buffer;
        self.orchestrator
            .watch(&root, options, shutdown, move || {
                let (sink, rx) = channel(new_correlation_id(), buffer);
                tokio::spawn(async move {
                    let reporter = mode.reporter("watch");
                    drain(rx, reporter.as_ref()).await;
                });
                sink
            })
            .await
    }

    // ============ Maintenance and status ============

    pub async fn maintenance(&self, op: MaintenanceOp) -> RagResult<()> {
        let started = Instant::now();
        match op {
            MaintenanceOp::Analyze => self.store.analyze().await?,
            MaintenanceOp::Vacuum => self.store.vacuum().await?,
            MaintenanceOp::SearchQuality { ef_search } => {
                if ef_search == 0 {
                    return Err(RagError::validation("ef_search must be > 0"));
                }
                self.store.set_search_quality(ef_search).await?
            }
        }
        tracing::info!(?op, elapsed_ms = started.elapsed().as_millis() as u64, "maintenance done");
        Ok(())
    }

    pub fn models(&self) -> Vec<ModelRecord> {
        self.manager.status()
    }

    pub async fn stats(&self) -> RagResult<ServiceStats> {
        let recent_sessions = self.orchestrator.tracking().recent_sessions(5).await?;
        Ok(ServiceStats {
            store: self.store.stats().await?,
            embedding: self.client.metrics(),
            queue: self.counters.snapshot(),
            models_loaded: self.manager.status().iter().filter(|m| m.is_loaded).count(),
            recent_sessions,
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    pub async fn health(&self) -> HealthReport {
        let backend = self.client.backend_name().to_string();
        match self.store.health_check().await {
            Ok(()) => HealthReport {
                status: "ok",
                store: true,
                backend,
                error: None,
            },
            Err(e) => HealthReport {
                status: "degraded",
                store: false,
                backend,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn dead_letters(&self, limit: i64) -> RagResult<Vec<DeadLetter>> {
        Ok(self.orchestrator.dead_letters().list(limit).await?)
    }

    pub async fn clear_dead_letters(&self) -> RagResult<u64> {
        Ok(self.orchestrator.dead_letters().clear().await?)
    }

    /// Unload models and close the pool.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.pool.close().await;
        tracing::info!("rag service stopped");
    }
}

/// Ingest one prepared item.
struct DocJob {
    item_id: String,
    pipeline: Arc<Pipeline>,
    doc: PreparedDoc,
}

#[async_trait]
impl Job for DocJob {
    fn item_id(&self) -> String {
        self.item_id.clone()
    }

    fn lane(&self) -> Lane {
        lane_for(self.doc.modality)
    }

    fn summary(&self) -> String {
        format!("{} {}", self.doc.modality, self.doc.source)
    }

    async fn run(&self) -> RagResult<()> {
        self.pipeline.ingest(&self.doc).await.map(|_| ())
    }
}
