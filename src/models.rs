//! Embedding model registry.
//!
//! Every model the service can embed with is declared here with its vector
//! dimension, metric, token budget and kind. The registry is an owned value
//! built from configuration at startup and passed to the components that
//! need it; there is no process-wide registry.

use std::collections::BTreeMap;

use rag_harness_core::models::Metric;
use rag_harness_core::{RagError, RagResult};
use serde::{Deserialize, Serialize};

/// What a model embeds. Decides which idle timeouts apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Text,
    Vision,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Text => "text",
            ModelKind::Vision => "vision",
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub dims: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_kind")]
    pub kind: ModelKind,
    #[serde(default)]
    pub metric: Metric,
}

fn default_max_tokens() -> usize {
    512
}

fn default_kind() -> ModelKind {
    ModelKind::Text
}

impl ModelSpec {
    fn builtin(id: &str, dims: usize, max_tokens: usize, kind: ModelKind) -> Self {
        Self {
            id: id.to_string(),
            dims,
            max_tokens,
            kind,
            metric: Metric::Cosine,
        }
    }
}

/// Models known to the service, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    /// Registry used when configuration declares no models.
    pub fn builtin() -> Self {
        Self::from_specs(vec![
            ModelSpec::builtin("embeddinggemma", 768, 2048, ModelKind::Text),
            ModelSpec::builtin("nomic-embed-text", 768, 8192, ModelKind::Text),
            ModelSpec::builtin("mxbai-embed-large", 1024, 512, ModelKind::Text),
            ModelSpec::builtin("bge-m3", 1024, 8192, ModelKind::Text),
            ModelSpec::builtin("all-minilm", 384, 256, ModelKind::Text),
            ModelSpec::builtin("clip-vit-b-32", 512, 77, ModelKind::Vision),
        ])
    }

    pub fn from_specs(specs: Vec<ModelSpec>) -> Self {
        Self {
            models: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// Built-in entries overlaid with configured ones.
    pub fn with_overrides(specs: &[ModelSpec]) -> Self {
        let mut registry = Self::builtin();
        for spec in specs {
            registry.models.insert(spec.id.clone(), spec.clone());
        }
        registry
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.get(model_id)
    }

    /// Look up `model_id`, failing with a non-retryable `model_unavailable`.
    pub fn require(&self, model_id: &str) -> RagResult<&ModelSpec> {
        self.get(model_id).ok_or_else(|| RagError::ModelUnavailable {
            model_id: model_id.to_string(),
            reason: "model is not registered".to_string(),
            retryable: false,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
