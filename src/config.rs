use anyhow::{Context, Result};
use rag_harness_core::models::Modality;
use rag_harness_core::store::VectorColumn;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{ModelKind, ModelRegistry, ModelSpec};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub model_manager: ModelManagerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_pool_size() -> u32 {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f32,
    #[serde(default = "default_min_loc")]
    pub code_min_loc: usize,
    #[serde(default = "default_max_loc")]
    pub code_max_loc: usize,
    #[serde(default = "default_overlap_loc")]
    pub code_overlap_loc: usize,
    #[serde(default)]
    pub caption_summary: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            overlap_ratio: default_overlap_ratio(),
            code_min_loc: default_min_loc(),
            code_max_loc: default_max_loc(),
            code_overlap_loc: default_overlap_loc(),
            caption_summary: false,
        }
    }
}

fn default_target_tokens() -> usize {
    400
}
fn default_min_tokens() -> usize {
    100
}
fn default_max_tokens() -> usize {
    800
}
fn default_overlap_ratio() -> f32 {
    0.12
}
fn default_min_loc() -> usize {
    20
}
fn default_max_loc() -> usize {
    120
}
fn default_overlap_loc() -> usize {
    5
}

/// What to do when the embedding backend fails.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Substitute a deterministic hash-derived vector.
    #[default]
    Fallback,
    /// Surface the backend error.
    Fail,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default)]
    pub code_model: Option<String>,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            api_key_env: default_api_key_env(),
            text_model: default_text_model(),
            code_model: None,
            vision_model: default_vision_model(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            on_failure: FailurePolicy::Fallback,
            cache_size: default_cache_size(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_text_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_vision_model() -> String {
    "clip-vit-b-32".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_size() -> usize {
    1000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Backend base URL, defaulting per provider.
    pub fn base_url(&self) -> String {
        match (&self.url, self.provider.as_str()) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, "openai") => "https://api.openai.com".to_string(),
            _ => "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelManagerConfig {
    #[serde(default = "default_text_vram_timeout")]
    pub text_vram_timeout_secs: u64,
    #[serde(default = "default_text_ram_timeout")]
    pub text_ram_timeout_secs: u64,
    #[serde(default = "default_vision_vram_timeout")]
    pub vision_vram_timeout_secs: u64,
    #[serde(default = "default_vision_ram_timeout")]
    pub vision_ram_timeout_secs: u64,
    #[serde(default = "default_memory_pressure")]
    pub memory_pressure_threshold: f64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            text_vram_timeout_secs: default_text_vram_timeout(),
            text_ram_timeout_secs: default_text_ram_timeout(),
            vision_vram_timeout_secs: default_vision_vram_timeout(),
            vision_ram_timeout_secs: default_vision_ram_timeout(),
            memory_pressure_threshold: default_memory_pressure(),
            response_timeout_secs: default_response_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_text_vram_timeout() -> u64 {
    300
}
fn default_text_ram_timeout() -> u64 {
    1800
}
fn default_vision_vram_timeout() -> u64 {
    120
}
fn default_vision_ram_timeout() -> u64 {
    600
}
fn default_memory_pressure() -> f64 {
    0.9
}
fn default_response_timeout() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    30
}

impl ModelManagerConfig {
    /// `(vram_timeout, ram_timeout)` in seconds for a model kind.
    pub fn timeouts(&self, kind: ModelKind) -> (u64, u64) {
        match kind {
            ModelKind::Text => (self.text_vram_timeout_secs, self.text_ram_timeout_secs),
            ModelKind::Vision => (self.vision_vram_timeout_secs, self.vision_ram_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_hnsw_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    #[serde(default = "default_analyze_after")]
    pub analyze_after_inserts: u64,
    #[serde(default = "default_vacuum_after")]
    pub vacuum_after_deletes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_hnsw_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            analyze_after_inserts: default_analyze_after(),
            vacuum_after_deletes: default_vacuum_after(),
        }
    }
}

fn default_hnsw_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    64
}
fn default_ef_search() -> usize {
    64
}
fn default_analyze_after() -> u64 {
    1000
}
fn default_vacuum_after() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Quiet period before filesystem events become a watch-mode run.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
    /// Watch mode also reruns on this period, picking up degraded files
    /// once the backend recovers. 0 disables.
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
            concurrency: ConcurrencyConfig::default(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            event_buffer: default_event_buffer(),
            watch_debounce_ms: default_watch_debounce_ms(),
            watch_interval_secs: default_watch_interval_secs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_event_buffer() -> usize {
    64
}
fn default_watch_debounce_ms() -> u64 {
    500
}
fn default_watch_interval_secs() -> u64 {
    300
}

/// Worker count per file type.
#[derive(Debug, Deserialize, Clone)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_two")]
    pub document: usize,
    #[serde(default = "default_two")]
    pub code: usize,
    #[serde(default = "default_one")]
    pub image: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            document: 2,
            code: 2,
            image: 1,
        }
    }
}

fn default_one() -> usize {
    1
}
fn default_two() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_w_vec")]
    pub w_vec: f64,
    #[serde(default = "default_w_text")]
    pub w_text: f64,
    #[serde(default = "default_text_ranker")]
    pub text_ranker: String,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_max_highlights")]
    pub max_highlights: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            w_vec: default_w_vec(),
            w_text: default_w_text(),
            text_ranker: default_text_ranker(),
            candidate_multiplier: default_candidate_multiplier(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            max_highlights: default_max_highlights(),
        }
    }
}

fn default_w_vec() -> f64 {
    0.8
}
fn default_w_text() -> f64 {
    0.2
}
fn default_text_ranker() -> String {
    "zero".to_string()
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_top_k() -> usize {
    20
}
fn default_max_top_k() -> usize {
    100
}
fn default_max_highlights() -> usize {
    3
}

/// Requests per minute, per modality. Absent means unlimited.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RateLimitConfig {
    pub docs: Option<u32>,
    pub code: Option<u32>,
    pub captions: Option<u32>,
    pub images: Option<u32>,
}

impl RateLimitConfig {
    pub fn per_minute(&self, modality: Modality) -> Option<u32> {
        match modality {
            Modality::Docs => self.docs,
            Modality::Code => self.code,
            Modality::Captions => self.captions,
            Modality::Images => self.images,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    /// Local paths ingestion may read. Empty means only the indexing root.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            max_content_length: default_max_content_length(),
            allowed_paths: Vec::new(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

fn default_max_items() -> usize {
    100
}
fn default_max_content_length() -> usize {
    1_000_000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub redact_logs: bool,
    #[serde(default)]
    pub redact_highlights: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

impl Config {
    /// Registry of built-in models overlaid with `[[models]]`.
    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::with_overrides(&self.models)
    }

    /// Model that embeds content of `modality`.
    pub fn model_for(&self, modality: Modality) -> &str {
        match modality {
            Modality::Docs | Modality::Captions => &self.embedding.text_model,
            Modality::Code => self
                .embedding
                .code_model
                .as_deref()
                .unwrap_or(&self.embedding.text_model),
            Modality::Images => &self.embedding.vision_model,
        }
    }

    /// Declared vector column per modality, derived from each modality's model.
    pub fn vector_columns(&self) -> Result<Vec<VectorColumn>> {
        let registry = self.registry();
        Modality::ALL
            .iter()
            .map(|&modality| {
                let model_id = self.model_for(modality);
                let spec = registry.get(model_id).with_context(|| {
                    format!(
                        "{} model '{}' is not in the model registry",
                        modality, model_id
                    )
                })?;
                Ok(VectorColumn {
                    modality,
                    dim: spec.dims,
                    metric: spec.metric,
                    model_id: spec.id.clone(),
                })
            })
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    let c = &config.chunking;
    if c.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if c.min_tokens > c.target_tokens || c.target_tokens > c.max_tokens {
        anyhow::bail!("chunking requires min_tokens <= target_tokens <= max_tokens");
    }
    if !(0.0..0.5).contains(&c.overlap_ratio) {
        anyhow::bail!("chunking.overlap_ratio must be in [0.0, 0.5)");
    }
    if c.code_max_loc == 0 || c.code_min_loc > c.code_max_loc {
        anyhow::bail!("chunking requires 0 < code_min_loc <= code_max_loc");
    }
    if c.code_overlap_loc >= c.code_max_loc {
        anyhow::bail!("chunking.code_overlap_loc must be < code_max_loc");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    for spec in &config.models {
        if spec.dims == 0 {
            anyhow::bail!("models.{}: dims must be > 0", spec.id);
        }
    }
    let columns = config.vector_columns()?;
    let registry = config.registry();
    for col in &columns {
        let kind = registry.get(&col.model_id).map(|s| s.kind);
        if col.modality.is_visual() != (kind == Some(ModelKind::Vision)) {
            anyhow::bail!(
                "{} modality cannot be embedded with {} model '{}'",
                col.modality,
                kind.map(|k| k.as_str()).unwrap_or("unknown"),
                col.model_id
            );
        }
    }

    // Model manager
    let mm = &config.model_manager;
    if !(0.0..=1.0).contains(&mm.memory_pressure_threshold) {
        anyhow::bail!("model_manager.memory_pressure_threshold must be in [0.0, 1.0]");
    }
    if mm.sweep_interval_secs == 0 {
        anyhow::bail!("model_manager.sweep_interval_secs must be > 0");
    }

    // Index
    if config.index.m < 2 {
        anyhow::bail!("index.m must be >= 2");
    }
    if config.index.ef_search == 0 || config.index.ef_construction == 0 {
        anyhow::bail!("index.ef_search and index.ef_construction must be > 0");
    }

    // Indexing
    let ix = &config.indexing;
    if ix.max_attempts == 0 {
        anyhow::bail!("indexing.max_attempts must be >= 1");
    }
    if ix.concurrency.document == 0 || ix.concurrency.code == 0 || ix.concurrency.image == 0 {
        anyhow::bail!("indexing.concurrency values must be >= 1");
    }
    if ix.event_buffer == 0 {
        anyhow::bail!("indexing.event_buffer must be >= 1");
    }
    if ix.watch_debounce_ms == 0 {
        anyhow::bail!("indexing.watch_debounce_ms must be > 0");
    }

    // Retrieval
    let r = &config.retrieval;
    if r.w_vec < 0.0 || r.w_text < 0.0 || r.w_vec + r.w_text > 1.0 + f64::EPSILON {
        anyhow::bail!("retrieval weights must be non-negative and sum to at most 1.0");
    }
    if rag_harness_core::scoring::ranker_by_name(&r.text_ranker).is_none() {
        anyhow::bail!(
            "Unknown retrieval.text_ranker: '{}'. Must be zero or term_overlap.",
            r.text_ranker
        );
    }
    if r.default_top_k == 0 || r.default_top_k > r.max_top_k {
        anyhow::bail!("retrieval requires 0 < default_top_k <= max_top_k");
    }

    // Limits
    if config.limits.max_items == 0 || config.limits.max_content_length == 0 {
        anyhow::bail!("limits.max_items and limits.max_content_length must be > 0");
    }

    Ok(())
}
