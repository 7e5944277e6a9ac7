//! Caching, batching, failure-tolerant embedding client.
//!
//! # Contract
//!
//! [`EmbeddingClient::embed`] returns exactly one vector per input text, in
//! input order, each of the registered dimension for the model. This holds
//! even when the backend fails, as long as the failure policy is
//! [`FailurePolicy::Fallback`].
//!
//! # Pipeline
//!
//! 1. Split any text whose token estimate exceeds the model's `max_tokens`.
//! 2. Serve pieces from the LRU cache, keyed by `(model, normalized text)`.
//! 3. Pin the model through the [`ModelManager`] and send misses in batches.
//! 4. On a failed batch: count one error, then fall back or fail.
//! 5. Mean-pool split pieces back into one vector per input.
//!
//! Fallback vectors are never cached, so a recovered backend replaces them
//! on the next call.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rag_harness_core::chunk::{char_windows, estimate_tokens};
use rag_harness_core::embedding::{fallback_vector, mean_pool, normalize_whitespace};
use rag_harness_core::models::Chunk;
use rag_harness_core::{RagError, RagResult};
use serde::Serialize;

use super::EmbeddingBackend;
use crate::config::{Config, FailurePolicy};
use crate::model_manager::ModelManager;
use crate::models::{ModelRegistry, ModelSpec};

type CacheKey = (String, String);

/// Overlap used when splitting oversize input for a model.
const SPLIT_OVERLAP: f32 = 0.10;

/// Vectors for one `embed` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutput {
    pub vectors: Vec<Vec<f32>>,
    /// `fallback[i]` is set when `vectors[i]` was synthesized after a backend failure.
    pub fallback: Vec<bool>,
}

impl EmbedOutput {
    pub fn any_fallback(&self) -> bool {
        self.fallback.iter().any(|f| *f)
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingMetrics {
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub cached_entries: usize,
}

pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    registry: ModelRegistry,
    manager: Option<Arc<ModelManager>>,
    policy: FailurePolicy,
    batch_size: usize,
    cache: Mutex<LruCache<CacheKey, Vec<f32>>>,
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
}

struct Piece {
    owner: usize,
    text: String,
    vector: Option<Vec<f32>>,
    fallback: bool,
}

impl EmbeddingClient {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        registry: ModelRegistry,
        policy: FailurePolicy,
        batch_size: usize,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            registry,
            manager: None,
            policy,
            batch_size: batch_size.max(1),
            cache: Mutex::new(LruCache::new(capacity)),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        config: &Config,
        backend: Arc<dyn EmbeddingBackend>,
        manager: Option<Arc<ModelManager>>,
    ) -> Self {
        let client = Self::new(
            backend,
            config.registry(),
            config.embedding.on_failure,
            config.embedding.batch_size,
            config.embedding.cache_size,
        );
        match manager {
            Some(m) => client.with_manager(m),
            None => client,
        }
    }

    /// Gate backend calls on the model manager: misses are only sent while a
    /// handle for the model is held.
    pub fn with_manager(mut self, manager: Arc<ModelManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether fallback output means a degraded backend rather than a
    /// deliberately disabled one.
    pub fn backend_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    pub fn metrics(&self) -> EmbeddingMetrics {
        EmbeddingMetrics {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cached_entries: self.lock_cache().len(),
        }
    }

    /// Embed `texts` with `model_id`. See the module docs for the contract.
    pub async fn embed(&self, model_id: &str, texts: &[String]) -> RagResult<EmbedOutput> {
        let spec = self.registry.require(model_id)?.clone();

        let mut pieces: Vec<Piece> = Vec::with_capacity(texts.len());
        for (owner, text) in texts.iter().enumerate() {
            for part in split_for_model(text, &spec) {
                pieces.push(Piece {
                    owner,
                    text: part,
                    vector: None,
                    fallback: false,
                });
            }
        }

        let mut misses: Vec<usize> = Vec::new();
        {
            let mut cache = self.lock_cache();
            for (i, piece) in pieces.iter_mut().enumerate() {
                let key = (spec.id.clone(), normalize_whitespace(&piece.text));
                match cache.get(&key) {
                    Some(v) => {
                        piece.vector = Some(v.clone());
                        self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    None => misses.push(i),
                }
            }
        }

        if !misses.is_empty() {
            let _handle = match &self.manager {
                Some(manager) => match manager.acquire(&spec.id).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        // Nothing can be sent without the model: the whole miss set fails as one batch.
                        self.requests.fetch_add(1, Ordering::Relaxed);
                        self.fall_back(&spec, &mut pieces, &misses, e)?;
                        return assemble(texts.len(), pieces, spec.dims);
                    }
                },
                None => None,
            };

            for batch in misses.chunks(self.batch_size) {
                let inputs: Vec<String> = batch.iter().map(|&i| pieces[i].text.clone()).collect();
                self.requests.fetch_add(1, Ordering::Relaxed);

                match self.call_backend(&spec, &inputs).await {
                    Ok(vectors) => {
                        let mut cache = self.lock_cache();
                        for (&i, v) in batch.iter().zip(vectors) {
                            cache.put((spec.id.clone(), normalize_whitespace(&pieces[i].text)), v.clone());
                            pieces[i].vector = Some(v);
                        }
                    }
                    Err(e) => self.fall_back(&spec, &mut pieces, batch, e)?,
                }
            }
        }

        assemble(texts.len(), pieces, spec.dims)
    }

    /// Embed one text.
    pub async fn embed_one(&self, model_id: &str, text: &str) -> RagResult<(Vec<f32>, bool)> {
        let out = self.embed(model_id, &[text.to_string()]).await?;
        let fallback = out.any_fallback();
        out.vectors
            .into_iter()
            .next()
            .map(|v| (v, fallback))
            .ok_or_else(|| RagError::unexpected("empty embedding result"))
    }

    /// Split chunks whose estimate exceeds the model's `max_tokens` into
    /// several compliant chunks, renumbering `chunk_index` contiguously.
    pub fn fit_chunks(&self, model_id: &str, chunks: Vec<Chunk>) -> RagResult<Vec<Chunk>> {
        let spec = self.registry.require(model_id)?;
        let mut out: Vec<Chunk> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.token_estimate <= spec.max_tokens {
                out.push(chunk);
                continue;
            }
            let ranges = char_windows(
                &chunk.text,
                0,
                chunk.text.len(),
                spec.max_tokens,
                spec.max_tokens,
                SPLIT_OVERLAP,
            );
            for (s, e) in ranges {
                let text = chunk.text[s..e].to_string();
                let mut metadata = chunk.metadata.clone();
                if let Some(base) = chunk.metadata.byte_start {
                    metadata.byte_start = Some(base + s);
                    metadata.byte_end = Some(base + e);
                }
                metadata.overshoot = false;
                out.push(Chunk {
                    chunk_index: 0,
                    token_estimate: estimate_tokens(&text),
                    text,
                    metadata,
                });
            }
        }
        for (i, chunk) in out.iter_mut().enumerate() {
            chunk.chunk_index = i;
        }
        Ok(out)
    }

    /// Record one failed request covering `batch`. Under the fail policy the
    /// error is returned, otherwise every piece gets its fallback vector.
    fn fall_back(&self, spec: &ModelSpec, pieces: &mut [Piece], batch: &[usize], e: RagError) -> RagResult<()> {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if self.policy == FailurePolicy::Fail {
            return Err(e);
        }
        if self.backend.is_enabled() {
            tracing::warn!(model = %spec.id, count = batch.len(), error = %e, error_type = %e.kind(), "embedding backend failed, using fallback vectors");
        } else {
            tracing::debug!(model = %spec.id, count = batch.len(), "embedding disabled, using fallback vectors");
        }
        for &i in batch {
            pieces[i].vector = Some(fallback_vector(&pieces[i].text, spec.dims));
            pieces[i].fallback = true;
        }
        self.fallbacks.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn call_backend(&self, spec: &ModelSpec, inputs: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let vectors = self.backend.embed_batch(&spec.id, inputs).await?;
        if vectors.len() != inputs.len() {
            return Err(RagError::Network(format!(
                "backend returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            )));
        }
        for v in &vectors {
            if v.len() != spec.dims {
                return Err(RagError::DimensionMismatch {
                    expected: spec.dims,
                    actual: v.len(),
                });
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(RagError::Network("backend returned a non-finite vector".into()));
            }
        }
        Ok(vectors)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, Vec<f32>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pieces of `text` that each fit the model's token budget.
fn split_for_model(text: &str, spec: &ModelSpec) -> Vec<String> {
    if estimate_tokens(text) <= spec.max_tokens || text.is_empty() {
        return vec![text.to_string()];
    }
    char_windows(text, 0, text.len(), spec.max_tokens, spec.max_tokens, SPLIT_OVERLAP)
        .into_iter()
        .map(|(s, e)| text[s..e].to_string())
        .collect()
}

fn assemble(n: usize, pieces: Vec<Piece>, dims: usize) -> RagResult<EmbedOutput> {
    let mut grouped: Vec<Vec<Vec<f32>>> = vec![Vec::new(); n];
    let mut fallback = vec![false; n];
    for piece in pieces {
        let vector = piece
            .vector
            .ok_or_else(|| RagError::unexpected("embedding piece left unfilled"))?;
        grouped[piece.owner].push(vector);
        fallback[piece.owner] |= piece.fallback;
    }
    let vectors = grouped
        .into_iter()
        .map(|mut parts| match parts.len() {
            1 => parts.pop().ok_or_else(|| RagError::unexpected("missing vector")),
            _ => mean_pool(&parts).ok_or_else(|| RagError::DimensionMismatch {
                expected: dims,
                actual: parts.first().map(|p| p.len()).unwrap_or(0),
            }),
        })
        .collect::<RagResult<Vec<_>>>()?;
    Ok(EmbedOutput { vectors, fallback })
}
