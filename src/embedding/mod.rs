//! Embedding backend abstraction and the caching client in front of it.
//!
//! - **[`EmbeddingBackend`]**: one HTTP round trip per batch. Implementations:
//!   [`OllamaBackend`], [`OpenAiBackend`], and [`DisabledBackend`].
//! - **[`EmbeddingClient`]**: what the rest of the service calls. Adds the
//!   LRU cache, batching, oversize splitting, metrics, model gating, and the
//!   configured failure policy on top of a backend.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use rag_harness::config::EmbeddingConfig;
//! # use rag_harness::embedding::create_backend;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let backend = create_backend(&config).unwrap();
//! assert_eq!(backend.name(), "disabled");
//! ```

pub mod backend;
pub mod client;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rag_harness_core::{RagError, RagResult};

use crate::config::EmbeddingConfig;

pub use backend::{OllamaBackend, OpenAiBackend};
pub use client::{EmbedOutput, EmbeddingClient, EmbeddingMetrics};

/// A remote (or local) service that turns text into vectors.
///
/// `embed_batch` returns one vector per input, in input order. Errors carry
/// the shared taxonomy so callers can decide between retry and fallback.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// False for a backend that can never produce real vectors. Fallback
    /// output from such a backend is the expected steady state.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn embed_batch(&self, model_id: &str, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;
}

// ============ Disabled Backend ============

/// Backend used when `embedding.provider = "disabled"`. Every call fails, so
/// the client either falls back or surfaces the error per its policy.
pub struct DisabledBackend;

#[async_trait]
impl EmbeddingBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed_batch(&self, model_id: &str, _texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        Err(RagError::ModelUnavailable {
            model_id: model_id.to_string(),
            reason: "embedding provider is disabled".to_string(),
            retryable: false,
        })
    }
}

/// Build the backend named by `config.provider`.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        "ollama" => Ok(Arc::new(OllamaBackend::new(
            config.base_url(),
            timeout,
            config.max_retries,
        )?)),
        "openai" => {
            let api_key = match std::env::var(&config.api_key_env) {
                Ok(key) => key,
                Err(_) => bail!("{} environment variable not set", config.api_key_env),
            };
            Ok(Arc::new(OpenAiBackend::new(
                config.base_url(),
                api_key,
                timeout,
                config.max_retries,
            )?))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}
