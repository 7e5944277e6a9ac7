//! Embedding model lifecycle: load once, pin while in use, evict when idle.
//!
//! # States
//!
//! ```text
//! Unloaded ──acquire──▶ Pending ──ok──▶ Loaded(fast) ──idle > vram──▶ Loaded(ram)
//!    ▲                     │                                             │
//!    └──────── failed ─────┘          Unloading ◀──── idle > ram / pressure
//! ```
//!
//! Each model has at most one in-flight load. The first caller moves the
//! slot to `Pending` and spawns the load on its own task. Later callers
//! subscribe to the same watch channel. A caller that gives up (drops its
//! future or hits `response_timeout`) never cancels the load.
//!
//! A [`ModelHandle`] pins its model: models with live handles are skipped by
//! idle sweeps and pressure eviction. Dropping the handle releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rag_harness_core::{RagError, RagResult};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ModelManagerConfig;
use crate::models::{ModelKind, ModelRegistry, ModelSpec};

/// Brings models in and out of memory on the serving backend.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, spec: &ModelSpec) -> RagResult<()>;

    /// Move from fast memory (VRAM) to RAM. Backends without tiers do nothing.
    async fn offload(&self, spec: &ModelSpec) -> RagResult<()>;

    async fn unload(&self, spec: &ModelSpec) -> RagResult<()>;
}

/// Reports how full system memory is.
pub trait MemoryProbe: Send + Sync {
    /// Used fraction in `[0, 1]`.
    fn used_fraction(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Residency {
    Fast,
    Ram,
}

type LoadOutcome = Option<RagResult<()>>;

enum SlotState {
    Unloaded,
    Pending(watch::Receiver<LoadOutcome>),
    Loaded(Residency),
    Unloading,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Unloaded => "unloaded",
            SlotState::Pending(_) => "loading",
            SlotState::Loaded(_) => "loaded",
            SlotState::Unloading => "unloading",
        }
    }
}

struct Slot {
    spec: ModelSpec,
    state: SlotState,
    last_used: Option<Instant>,
    last_used_unix: Option<i64>,
    usage_count: u64,
    active: usize,
    vram_timeout: Duration,
    ram_timeout: Duration,
}

impl Slot {
    fn evictable(&self) -> bool {
        self.active == 0 && matches!(self.state, SlotState::Loaded(_))
    }

    fn touch(&mut self) {
        self.last_used = Some(Instant::now());
        self.last_used_unix = Some(chrono::Utc::now().timestamp());
    }
}

/// Snapshot of one model's lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub kind: ModelKind,
    pub state: &'static str,
    pub is_loaded: bool,
    pub residency: Option<Residency>,
    pub last_used_at: Option<i64>,
    pub usage_count: u64,
    pub active_handles: usize,
    pub vram_timeout_secs: u64,
    pub ram_timeout_secs: u64,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub offloaded: usize,
    pub unloaded: usize,
    pub evicted: usize,
}

/// Owned registry of model slots. Create with [`ModelManager::init`], stop
/// with [`ModelManager::shutdown`].
pub struct ModelManager {
    slots: Mutex<HashMap<String, Slot>>,
    loader: Arc<dyn ModelLoader>,
    probe: Arc<dyn MemoryProbe>,
    pressure_threshold: f64,
    response_timeout: Duration,
    loads: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a model loaded and pinned until dropped.
pub struct ModelHandle {
    manager: Arc<ModelManager>,
    model_id: String,
}

impl ModelHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.manager.release(&self.model_id);
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("model_id", &self.model_id).finish()
    }
}

impl ModelManager {
    /// Build the manager without a background sweep.
    pub fn new(
        config: &ModelManagerConfig,
        registry: &ModelRegistry,
        loader: Arc<dyn ModelLoader>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Arc<Self> {
        let slots = registry
            .iter()
            .map(|spec| {
                let (vram, ram) = config.timeouts(spec.kind);
                (
                    spec.id.clone(),
                    Slot {
                        spec: spec.clone(),
                        state: SlotState::Unloaded,
                        last_used: None,
                        last_used_unix: None,
                        usage_count: 0,
                        active: 0,
                        vram_timeout: Duration::from_secs(vram),
                        ram_timeout: Duration::from_secs(ram),
                    },
                )
            })
            .collect();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            slots: Mutex::new(slots),
            loader,
            probe,
            pressure_threshold: config.memory_pressure_threshold,
            response_timeout: Duration::from_secs(config.response_timeout_secs),
            loads: AtomicU64::new(0),
            shutdown_tx,
            sweeper: Mutex::new(None),
        })
    }

    /// Build the manager and start the periodic idle sweep.
    pub fn init(
        config: &ModelManagerConfig,
        registry: &ModelRegistry,
        loader: Arc<dyn ModelLoader>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Arc<Self> {
        let manager = Self::new(config, registry, loader, probe);
        let interval = Duration::from_secs(config.sweep_interval_secs.max(1));
        let weak: Weak<Self> = Arc::downgrade(&manager);
        let mut shutdown_rx = manager.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        let report = manager.release_idle_sweep().await;
                        if report != SweepReport::default() {
                            tracing::info!(offloaded = report.offloaded, unloaded = report.unloaded, evicted = report.evicted, "model sweep");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *manager.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        manager
    }

    /// Stop the sweep and unload every idle model.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let n = self.unload_all().await;
        tracing::debug!(unloaded = n, "model manager shut down");
    }

    /// Number of loader calls made so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Load `model_id` if needed and pin it.
    pub async fn acquire(self: &Arc<Self>, model_id: &str) -> RagResult<ModelHandle> {
        let deadline = tokio::time::Instant::now() + self.response_timeout;
        loop {
            let mut rx = {
                let mut slots = self.lock();
                let slot = slots.get_mut(model_id).ok_or_else(|| RagError::ModelUnavailable {
                    model_id: model_id.to_string(),
                    reason: "model is not registered".to_string(),
                    retryable: false,
                })?;

                match &slot.state {
                    SlotState::Loaded(_) => {
                        slot.state = SlotState::Loaded(Residency::Fast);
                        slot.active += 1;
                        slot.usage_count += 1;
                        slot.touch();
                        return Ok(ModelHandle {
                            manager: Arc::clone(self),
                            model_id: model_id.to_string(),
                        });
                    }
                    SlotState::Pending(rx) => rx.clone(),
                    SlotState::Unloaded | SlotState::Unloading => {
                        let (tx, rx) = watch::channel::<LoadOutcome>(None);
                        slot.state = SlotState::Pending(rx.clone());
                        self.spawn_load(slot.spec.clone(), tx);
                        rx
                    }
                }
            };

            let waited = tokio::time::timeout_at(deadline, rx.wait_for(|v| v.is_some())).await;
            let outcome: LoadOutcome = match waited {
                Err(_) => {
                    return Err(RagError::ModelUnavailable {
                        model_id: model_id.to_string(),
                        reason: format!(
                            "still loading after {}s, retry shortly",
                            self.response_timeout.as_secs()
                        ),
                        retryable: true,
                    })
                }
                Ok(Ok(value)) => value.clone(),
                Ok(Err(_)) => None,
            };

            match outcome {
                Some(Ok(())) => continue,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(RagError::ModelLoading {
                        model_id: model_id.to_string(),
                        reason: "load task ended without a result".to_string(),
                    })
                }
            }
        }
    }

    fn spawn_load(self: &Arc<Self>, spec: ModelSpec, tx: watch::Sender<LoadOutcome>) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let guard = LoadGuard {
            manager: Arc::clone(self),
            model_id: spec.id.clone(),
            tx: Some(tx),
        };
        let loader = Arc::clone(&self.loader);
        tokio::spawn(async move {
            let started = Instant::now();
            tracing::info!(model = %spec.id, "loading model");
            let result = loader.load(&spec).await;
            if result.is_ok() {
                tracing::info!(model = %spec.id, elapsed_ms = started.elapsed().as_millis() as u64, "model loaded");
            }
            guard.finish(result);
        });
    }

    fn release(&self, model_id: &str) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(model_id) {
            slot.active = slot.active.saturating_sub(1);
            slot.touch();
        }
    }

    /// Offload models idle past `vram_timeout`, unload those idle past
    /// `ram_timeout`, then evict under memory pressure.
    pub async fn release_idle_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Instant::now();

        let (offload, unload): (Vec<ModelSpec>, Vec<ModelSpec>) = {
            let mut slots = self.lock();
            let mut offload = Vec::new();
            let mut unload = Vec::new();
            for slot in slots.values_mut() {
                if !slot.evictable() {
                    continue;
                }
                let idle = slot.last_used.map(|t| now.duration_since(t)).unwrap_or_default();
                if idle >= slot.ram_timeout {
                    slot.state = SlotState::Unloading;
                    unload.push(slot.spec.clone());
                } else if idle >= slot.vram_timeout
                    && matches!(slot.state, SlotState::Loaded(Residency::Fast))
                {
                    slot.state = SlotState::Loaded(Residency::Ram);
                    offload.push(slot.spec.clone());
                }
            }
            (offload, unload)
        };

        for spec in &offload {
            if let Err(e) = self.loader.offload(spec).await {
                tracing::warn!(model = %spec.id, error = %e, "offload failed");
            }
            report.offloaded += 1;
        }
        for spec in &unload {
            self.finish_unload(spec).await;
            report.unloaded += 1;
        }

        while self.probe.used_fraction() > self.pressure_threshold {
            let Some(victim) = self.pick_victim() else { break };
            tracing::info!(model = %victim.id, "evicting model under memory pressure");
            self.finish_unload(&victim).await;
            report.evicted += 1;
        }

        report
    }

    /// Least recently used evictable model, ties broken by lowest usage.
    /// Marks it `Unloading` before returning.
    fn pick_victim(&self) -> Option<ModelSpec> {
        let mut slots = self.lock();
        let victim = slots
            .values_mut()
            .filter(|s| s.evictable())
            .min_by(|a, b| {
                a.last_used
                    .cmp(&b.last_used)
                    .then_with(|| a.usage_count.cmp(&b.usage_count))
            })?;
        victim.state = SlotState::Unloading;
        Some(victim.spec.clone())
    }

    async fn finish_unload(&self, spec: &ModelSpec) {
        if let Err(e) = self.loader.unload(spec).await {
            tracing::warn!(model = %spec.id, error = %e, "unload failed, marking unloaded");
        }
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&spec.id) {
            if matches!(slot.state, SlotState::Unloading) {
                slot.state = SlotState::Unloaded;
            }
        }
    }

    /// Unload one model now. Refused while handles are live.
    pub async fn force_unload(&self, model_id: &str) -> RagResult<bool> {
        let spec = {
            let mut slots = self.lock();
            let slot = slots.get_mut(model_id).ok_or_else(|| RagError::ModelUnavailable {
                model_id: model_id.to_string(),
                reason: "model is not registered".to_string(),
                retryable: false,
            })?;
            if slot.active > 0 {
                return Err(RagError::validation(format!(
                    "model {} has {} active handle(s)",
                    model_id, slot.active
                )));
            }
            if !matches!(slot.state, SlotState::Loaded(_)) {
                return Ok(false);
            }
            slot.state = SlotState::Unloading;
            slot.spec.clone()
        };
        self.finish_unload(&spec).await;
        Ok(true)
    }

    /// Unload every loaded model without live handles. Returns how many.
    pub async fn unload_all(&self) -> usize {
        let specs: Vec<ModelSpec> = {
            let mut slots = self.lock();
            slots
                .values_mut()
                .filter(|s| s.evictable())
                .map(|s| {
                    s.state = SlotState::Unloading;
                    s.spec.clone()
                })
                .collect()
        };
        for spec in &specs {
            self.finish_unload(spec).await;
        }
        specs.len()
    }

    pub fn status(&self) -> Vec<ModelRecord> {
        let slots = self.lock();
        let mut records: Vec<ModelRecord> = slots
            .values()
            .map(|s| ModelRecord {
                model_id: s.spec.id.clone(),
                kind: s.spec.kind,
                state: s.state.name(),
                is_loaded: matches!(s.state, SlotState::Loaded(_)),
                residency: match s.state {
                    SlotState::Loaded(r) => Some(r),
                    _ => None,
                },
                last_used_at: s.last_used_unix,
                usage_count: s.usage_count,
                active_handles: s.active,
                vram_timeout_secs: s.vram_timeout.as_secs(),
                ram_timeout_secs: s.ram_timeout.as_secs(),
            })
            .collect();
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        records
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Publishes a load's outcome. If the load task panics, `Drop` resets the
/// slot and wakes waiters with `model_loading`.
struct LoadGuard {
    manager: Arc<ModelManager>,
    model_id: String,
    tx: Option<watch::Sender<LoadOutcome>>,
}

impl LoadGuard {
    fn finish(mut self, result: RagResult<()>) {
        let result = result.map_err(|e| match e {
            RagError::ModelDownload { .. } | RagError::ModelLoading { .. } => e,
            other => RagError::ModelLoading {
                model_id: self.model_id.clone(),
                reason: other.to_string(),
            },
        });
        self.publish(result);
    }

    fn publish(&mut self, result: RagResult<()>) {
        let Some(tx) = self.tx.take() else { return };
        {
            let mut slots = self.manager.lock();
            if let Some(slot) = slots.get_mut(&self.model_id) {
                if matches!(slot.state, SlotState::Pending(_)) {
                    slot.state = match &result {
                        Ok(()) => SlotState::Loaded(Residency::Fast),
                        Err(_) => SlotState::Unloaded,
                    };
                    slot.touch();
                }
            }
        }
        if let Err(e) = &result {
            tracing::warn!(model = %self.model_id, error = %e, "model load failed");
        }
        tx.send_replace(Some(result));
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let model_id = self.model_id.clone();
            self.publish(Err(RagError::ModelLoading {
                model_id,
                reason: "loader aborted".to_string(),
            }));
        }
    }
}

// ============ Loaders ============

/// Loader for remote APIs that manage their own models.
pub struct NoopLoader;

#[async_trait]
impl ModelLoader for NoopLoader {
    async fn load(&self, _spec: &ModelSpec) -> RagResult<()> {
        Ok(())
    }

    async fn offload(&self, _spec: &ModelSpec) -> RagResult<()> {
        Ok(())
    }

    async fn unload(&self, _spec: &ModelSpec) -> RagResult<()> {
        Ok(())
    }
}

/// Warms and releases models on an Ollama server through `keep_alive`.
pub struct OllamaLoader {
    client: reqwest::Client,
    url: String,
    keep_alive_secs: u64,
}

impl OllamaLoader {
    pub fn new(url: impl Into<String>, timeout: Duration, keep_alive_secs: u64) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::unexpected(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            keep_alive_secs,
        })
    }

    async fn keep_alive(&self, spec: &ModelSpec, keep_alive: serde_json::Value) -> RagResult<()> {
        let body = serde_json::json!({
            "model": spec.id,
            "input": [],
            "keep_alive": keep_alive,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::Timeout(format!("Ollama did not answer loading {}: {}", spec.id, e))
                } else {
                    RagError::Network(format!("Ollama connection error at {}: {}", self.url, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(RagError::ModelDownload {
                model_id: spec.id.clone(),
                reason: format!("model is not available on the server: {}", text),
            });
        }
        Err(RagError::ModelLoading {
            model_id: spec.id.clone(),
            reason: format!("Ollama error {}: {}", status, text),
        })
    }
}

#[async_trait]
impl ModelLoader for OllamaLoader {
    async fn load(&self, spec: &ModelSpec) -> RagResult<()> {
        self.keep_alive(spec, serde_json::json!(format!("{}s", self.keep_alive_secs)))
            .await
    }

    async fn offload(&self, spec: &ModelSpec) -> RagResult<()> {
        // Ollama has no RAM tier; the model stays resident until unloaded.
        tracing::debug!(model = %spec.id, "offload requested");
        Ok(())
    }

    async fn unload(&self, spec: &ModelSpec) -> RagResult<()> {
        self.keep_alive(spec, serde_json::json!(0)).await
    }
}

// ============ Memory probe ============

/// Reads system memory through `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<sysinfo::System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_fraction(&self) -> f64 {
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (sys.used_memory() as f64 / total as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingLoader {
        delay: Duration,
        fail: bool,
        panic: bool,
        loads: AtomicUsize,
        unloads: AtomicUsize,
    }

    impl CountingLoader {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail: false,
                panic: false,
                loads: AtomicUsize::new(0),
                unloads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, spec: &ModelSpec) -> RagResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("loader exploded");
            }
            if self.fail {
                return Err(RagError::Network(format!("cannot reach server for {}", spec.id)));
            }
            Ok(())
        }

        async fn offload(&self, _spec: &ModelSpec) -> RagResult<()> {
            Ok(())
        }

        async fn unload(&self, _spec: &ModelSpec) -> RagResult<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Reports pressure for the first `high_reads` calls, then none.
    struct FakeProbe {
        high_reads: AtomicUsize,
    }

    impl FakeProbe {
        fn new(high_reads: usize) -> Arc<Self> {
            Arc::new(Self {
                high_reads: AtomicUsize::new(high_reads),
            })
        }
    }

    impl MemoryProbe for FakeProbe {
        fn used_fraction(&self) -> f64 {
            let left = self.high_reads.load(Ordering::SeqCst);
            if left > 0 {
                self.high_reads.store(left - 1, Ordering::SeqCst);
                0.99
            } else {
                0.10
            }
        }
    }

    fn config(vram: u64, ram: u64, response: u64) -> ModelManagerConfig {
        ModelManagerConfig {
            text_vram_timeout_secs: vram,
            text_ram_timeout_secs: ram,
            vision_vram_timeout_secs: vram,
            vision_ram_timeout_secs: ram,
            memory_pressure_threshold: 0.9,
            response_timeout_secs: response,
            sweep_interval_secs: 60,
        }
    }

    fn record<'a>(records: &'a [ModelRecord], id: &str) -> &'a ModelRecord {
        records.iter().find(|r| r.model_id == id).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_acquire_loads_once() {
        let loader = CountingLoader::new(50);
        let manager = ModelManager::new(&config(300, 900, 5), &ModelRegistry::builtin(), loader.clone(), FakeProbe::new(0));

        let (a, b) = tokio::join!(manager.acquire("bge-m3"), manager.acquire("bge-m3"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(manager.load_count(), 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        let status = manager.status();
        let rec = record(&status, "bge-m3");
        assert!(rec.is_loaded);
        assert_eq!(rec.active_handles, 2);
        assert_eq!(rec.usage_count, 2);

        drop(a);
        drop(b);
        assert_eq!(record(&manager.status(), "bge-m3").active_handles, 0);
    }

    #[tokio::test]
    async fn test_unknown_model_is_permanent() {
        let manager = ModelManager::new(&config(300, 900, 5), &ModelRegistry::builtin(), CountingLoader::new(0), FakeProbe::new(0));
        let err = manager.acquire("nope").await.unwrap_err();
        assert_eq!(err.kind(), rag_harness_core::ErrorKind::ModelUnavailable);
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_failed_load_resets_to_unloaded() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(1),
            fail: true,
            panic: false,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        });
        let manager = ModelManager::new(&config(300, 900, 5), &ModelRegistry::builtin(), loader, FakeProbe::new(0));
        let err = manager.acquire("all-minilm").await.unwrap_err();
        assert_eq!(err.kind(), rag_harness_core::ErrorKind::ModelLoading);
        assert_eq!(record(&manager.status(), "all-minilm").state, "unloaded");

        let _ = manager.acquire("all-minilm").await;
        assert_eq!(manager.load_count(), 2, "a failed load is retried on the next acquire");
    }

    #[tokio::test]
    async fn test_panicking_loader_releases_gate() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(1),
            fail: false,
            panic: true,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        });
        let manager = ModelManager::new(&config(300, 900, 5), &ModelRegistry::builtin(), loader, FakeProbe::new(0));
        let err = manager.acquire("all-minilm").await.unwrap_err();
        assert_eq!(err.kind(), rag_harness_core::ErrorKind::ModelLoading);
        assert_eq!(record(&manager.status(), "all-minilm").state, "unloaded");
    }

    #[tokio::test]
    async fn test_slow_load_times_out_but_completes() {
        let loader = CountingLoader::new(1500);
        let manager = ModelManager::new(&config(300, 900, 1), &ModelRegistry::builtin(), loader, FakeProbe::new(0));
        let err = manager.acquire("bge-m3").await.unwrap_err();
        assert_eq!(err.kind(), rag_harness_core::ErrorKind::ModelUnavailable);
        assert!(err.retryable());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(record(&manager.status(), "bge-m3").state, "loaded");
        let _h = manager.acquire("bge-m3").await.unwrap();
        assert_eq!(manager.load_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_sweep_offloads_then_unloads() {
        let loader = CountingLoader::new(0);
        let manager = ModelManager::new(&config(0, 3600, 5), &ModelRegistry::builtin(), loader.clone(), FakeProbe::new(0));
        drop(manager.acquire("bge-m3").await.unwrap());

        let report = manager.release_idle_sweep().await;
        assert_eq!(report.offloaded, 1);
        assert_eq!(record(&manager.status(), "bge-m3").residency, Some(Residency::Ram));

        let manager = ModelManager::new(&config(0, 0, 5), &ModelRegistry::builtin(), loader.clone(), FakeProbe::new(0));
        drop(manager.acquire("bge-m3").await.unwrap());
        let report = manager.release_idle_sweep().await;
        assert_eq!(report.unloaded, 1);
        assert!(!record(&manager.status(), "bge-m3").is_loaded);
        assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_handles_block_eviction() {
        let manager = ModelManager::new(&config(0, 0, 5), &ModelRegistry::builtin(), CountingLoader::new(0), FakeProbe::new(100));
        let handle = manager.acquire("bge-m3").await.unwrap();
        let report = manager.release_idle_sweep().await;
        assert_eq!(report, SweepReport::default());
        assert!(record(&manager.status(), "bge-m3").is_loaded);
        assert!(manager.force_unload("bge-m3").await.is_err());
        drop(handle);
        assert!(manager.force_unload("bge-m3").await.unwrap());
    }

    #[tokio::test]
    async fn test_pressure_evicts_least_recently_used() {
        let manager = ModelManager::new(&config(3600, 3600, 5), &ModelRegistry::builtin(), CountingLoader::new(0), FakeProbe::new(0));
        drop(manager.acquire("all-minilm").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(manager.acquire("bge-m3").await.unwrap());

        // One high reading: exactly one eviction, and it must be the older model.
        let pressured = ModelManager {
            probe: FakeProbe::new(1),
            ..Arc::try_unwrap(manager).ok().unwrap()
        };
        let report = pressured.release_idle_sweep().await;
        assert_eq!(report.evicted, 1);
        let status = pressured.status();
        assert!(!record(&status, "all-minilm").is_loaded);
        assert!(record(&status, "bge-m3").is_loaded);
    }

    #[tokio::test]
    async fn test_pressure_tie_on_last_used_evicts_least_used() {
        for (busy, quiet) in [("all-minilm", "bge-m3"), ("bge-m3", "all-minilm")] {
            let manager = ModelManager::new(&config(3600, 3600, 5), &ModelRegistry::builtin(), CountingLoader::new(0), FakeProbe::new(0));
            for _ in 0..3 {
                drop(manager.acquire(busy).await.unwrap());
            }
            drop(manager.acquire(quiet).await.unwrap());
            {
                let now = Instant::now();
                let mut slots = manager.lock();
                for id in [busy, quiet] {
                    slots.get_mut(id).unwrap().last_used = Some(now);
                }
            }

            let pressured = ModelManager {
                probe: FakeProbe::new(1),
                ..Arc::try_unwrap(manager).ok().unwrap()
            };
            let report = pressured.release_idle_sweep().await;
            assert_eq!(report.evicted, 1);
            let status = pressured.status();
            assert!(record(&status, busy).is_loaded, "{} has more uses and stays", busy);
            assert!(!record(&status, quiet).is_loaded, "{} is evicted on the tie", quiet);
        }
    }

    #[tokio::test]
    async fn test_unload_all_and_shutdown() {
        let manager = ModelManager::init(&config(300, 900, 5), &ModelRegistry::builtin(), CountingLoader::new(0), FakeProbe::new(0));
        drop(manager.acquire("bge-m3").await.unwrap());
        drop(manager.acquire("all-minilm").await.unwrap());
        manager.shutdown().await;
        assert!(manager.status().iter().all(|r| !r.is_loaded));
    }
}
