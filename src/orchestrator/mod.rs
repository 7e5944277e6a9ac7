//! Incremental indexing of a directory tree.
//!
//! # Session
//!
//! ```text
//! Idle → Scanning → Skipped
//!                 → Indexing → Completed | Failed | Cancelled
//! ```
//!
//! 1. Walk the root (globs, size limit) and fingerprint each file. Hashes are
//!    reused from tracking when mtime and size are unchanged.
//! 2. Compare the aggregate hash with the stored [`tracking::RootState`]. A
//!    match ends the session as `Skipped` without touching tracking rows.
//! 3. Otherwise reindex new, changed and previously failed files, refresh
//!    mtimes of touched files, and remove vanished files from the store.
//! 4. Flagged files go through the [`queue::IngestQueue`]; each job records
//!    its outcome in `file_tracking`.
//!
//! [`Orchestrator::watch`] keeps a root indexed continuously: filesystem
//! events from [`watch::RootWatcher`] are debounced into incremental runs.
//!
//! A file that fails is non-fatal: it is tracked as `failed` with its error
//! and retried on the next session. A file stored with fallback vectors from
//! a failing backend is tracked as `degraded` and retried the same way, so
//! neither may let the root aggregate short-circuit a later run.

pub mod queue;
pub mod scan;
pub mod tracking;
pub mod watch;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rag_harness_core::models::Modality;
use rag_harness_core::{RagError, RagResult};
use sqlx::SqlitePool;

use crate::config::IndexingConfig;
use crate::events::{EventSink, IngestEvent};
use crate::pipeline::{IngestOutcome, Pipeline, PreparedDoc};

use queue::{DeadLetters, IngestQueue, Job, Lane, QueueConfig, QueueCounters};
use scan::{scan_root, FileType, HashHint, ScannedFile};
use tracking::{detect_changes, IndexingSession, RootState, SessionStatus, SessionTotals, Tracking};

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    tracking: Tracking,
    dead_letters: DeadLetters,
    config: IndexingConfig,
    counters: Arc<QueueCounters>,
    status: tokio::sync::watch::Sender<SessionStatus>,
    active: Mutex<Option<IngestQueue>>,
    running: tokio::sync::Mutex<()>,
    cancel_requested: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: &IndexingConfig,
        pipeline: Arc<Pipeline>,
        pool: SqlitePool,
        counters: Arc<QueueCounters>,
    ) -> Self {
        let (status, _) = tokio::sync::watch::channel(SessionStatus::Idle);
        Self {
            pipeline,
            tracking: Tracking::new(pool.clone()),
            dead_letters: DeadLetters::new(pool),
            config: config.clone(),
            counters,
            status,
            active: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn tracking(&self) -> &Tracking {
        &self.tracking
    }

    pub fn dead_letters(&self) -> &DeadLetters {
        &self.dead_letters
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn default_root(&self) -> Option<&Path> {
        self.config.root.as_deref()
    }

    fn active_queue(&self) -> Option<IngestQueue> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pause the running session's queue. Returns false when idle.
    pub fn pause(&self) -> bool {
        self.active_queue().map(|q| q.pause()).is_some()
    }

    pub fn resume(&self) -> bool {
        self.active_queue().map(|q| q.resume()).is_some()
    }

    /// Cancel every file not yet picked up by a worker.
    pub fn cancel(&self) -> usize {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.active_queue().map(|q| q.cancel_all()).unwrap_or(0)
    }

    /// Run one session over `root`, streaming events to `sink`.
    ///
    /// Only one session runs at a time; a concurrent call is rejected.
    pub async fn run(&self, root: &Path, sink: EventSink) -> RagResult<IndexingSession> {
        let Ok(_running) = self.running.try_lock() else {
            let err = RagError::validation("an indexing session is already running");
            sink.emit(IngestEvent::from_error(&err)).await;
            return Err(err);
        };
        self.cancel_requested.store(false, Ordering::SeqCst);

        let root = match std::fs::canonicalize(root) {
            Ok(r) => r,
            Err(e) => {
                let err = RagError::validation(format!("cannot index {}: {}", root.display(), e));
                sink.emit(IngestEvent::from_error(&err)).await;
                return Err(err);
            }
        };
        let root_str = root.to_string_lossy().to_string();

        let mut session = IndexingSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            root_path: root_str.clone(),
            start_time: chrono::Utc::now().timestamp(),
            end_time: None,
            status: SessionStatus::Scanning,
            totals: SessionTotals::default(),
            error: None,
        };
        self.set_status(&mut session, SessionStatus::Scanning);
        if let Err(e) = self.tracking.save_session(&session).await {
            tracing::warn!(error = %e, "failed to record session start");
        }
        tracing::info!(session = %session.session_id, root = %root_str, correlation_id = %sink.correlation_id(), "indexing session started");

        let outcome = self.run_session(&root, &mut session, &sink).await.map_err(RagError::from);
        if let Err(err) = &outcome {
            session.error = Some(err.to_string());
            self.set_status(&mut session, SessionStatus::Failed);
            sink.emit(IngestEvent::from_error(err)).await;
        }

        session.end_time = Some(chrono::Utc::now().timestamp());
        if let Err(e) = self.tracking.save_session(&session).await {
            tracing::warn!(error = %e, "failed to record session end");
        }
        tracing::info!(
            session = %session.session_id,
            status = session.status.as_str(),
            scanned = session.totals.scanned,
            indexed = session.totals.indexed,
            failed = session.totals.failed,
            degraded = session.totals.degraded,
            removed = session.totals.removed,
            "indexing session finished"
        );

        outcome.map(|()| session)
    }

    /// Index `root`, then keep it indexed until `shutdown` resolves.
    ///
    /// Every debounced batch of filesystem changes, and every `interval` tick
    /// when set, becomes one incremental [`run`](Self::run) with a sink from
    /// `sink_for_run`. Returns the number of runs. Only the first run's error
    /// is returned; later ones are logged and watching continues.
    pub async fn watch<F, S>(&self, root: &Path, options: WatchOptions, shutdown: F, mut sink_for_run: S) -> RagResult<u64>
    where
        F: Future<Output = ()>,
        S: FnMut() -> EventSink,
    {
        let root = std::fs::canonicalize(root)
            .map_err(|e| RagError::validation(format!("cannot watch {}: {}", root.display(), e)))?;
        let (_watcher, mut changes) = watch::RootWatcher::start(&root, options.debounce, options.ignore)
            .map_err(|e| RagError::unexpected(format!("cannot watch {}: {}", root.display(), e)))?;

        self.run(&root, sink_for_run()).await?;
        let mut runs = 1u64;

        let mut ticker = options.interval.map(|period| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                batch = changes.recv() => {
                    let Some(mut paths) = batch else { break };
                    while let Ok(more) = changes.try_recv() {
                        paths.extend(more);
                    }
                    tracing::info!(root = %root.display(), changed = paths.len(), "changes detected, reindexing");
                }
                _ = next_tick(&mut ticker) => {
                    tracing::debug!(root = %root.display(), "periodic reindex");
                }
            }
            if let Err(e) = self.run(&root, sink_for_run()).await {
                tracing::warn!(root = %root.display(), error = %e, error_type = %e.kind(), "watch run failed");
            }
            runs += 1;
        }

        tracing::info!(root = %root.display(), runs, "watch stopped");
        Ok(runs)
    }

    fn set_status(&self, session: &mut IndexingSession, status: SessionStatus) {
        session.status = status;
        self.status.send_replace(status);
    }

    async fn run_session(&self, root: &Path, session: &mut IndexingSession, sink: &EventSink) -> Result<()> {
        let root_str = session.root_path.clone();
        let tracked = self.tracking.load(&root_str).await?;

        let hints: HashMap<String, HashHint> = tracked
            .values()
            .map(|t| {
                (
                    t.path.clone(),
                    HashHint {
                        mtime: t.mtime,
                        size: t.size,
                        content_hash: t.content_hash.clone(),
                    },
                )
            })
            .collect();
        let config = self.config.clone();
        let scan_root_path = root.to_path_buf();
        let scan = tokio::task::spawn_blocking(move || scan_root(&scan_root_path, &config, &hints))
            .await
            .context("scan task failed")??;
        session.totals.scanned = scan.files.len() as u64;

        if let Some(state) = self.tracking.root_state(&root_str).await? {
            if state.aggregate_hash == scan.aggregate_hash {
                session.totals.skipped = scan.files.len() as u64;
                self.set_status(session, SessionStatus::Skipped);
                sink.emit(IngestEvent::Skipped {
                    reason: "root unchanged since last scan".to_string(),
                })
                .await;
                return Ok(());
            }
        }

        let changes = detect_changes(&scan.files, &tracked);
        for file in &changes.touched {
            self.tracking.refresh_mtime(&root_str, &file.path, file.mtime).await?;
        }
        for gone in &changes.vanished {
            let source = source_for(root, &gone.path);
            self.pipeline.store().delete_source(&source).await?;
            self.tracking.remove(&root_str, &gone.path).await?;
            session.totals.removed += 1;
            tracing::debug!(path = %gone.path, "removed vanished file");
        }
        session.totals.skipped = (changes.unchanged + changes.touched.len()) as u64;

        self.set_status(session, SessionStatus::Indexing);
        self.tracking.save_session(session).await?;

        let scheduled = changes.reindex.len() as u64;
        sink.emit(IngestEvent::Enqueued {
            scheduled,
            total: session.totals.scanned,
        })
        .await;
        sink.emit(IngestEvent::Accepted { total: scheduled }).await;

        let queue = IngestQueue::start(
            QueueConfig::from_indexing(&self.config),
            Some(self.dead_letters.clone()),
            Some(sink.clone()),
            Arc::clone(&self.counters),
        );
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(queue.clone());

        let degraded = Arc::new(AtomicU64::new(0));
        for file in changes.reindex {
            queue.submit(Arc::new(FileJob {
                pipeline: Arc::clone(&self.pipeline),
                tracking: self.tracking.clone(),
                root: root_str.clone(),
                source: source_for(root, &file.path),
                file,
                degraded: Arc::clone(&degraded),
            }));
        }
        if self.cancel_requested.load(Ordering::SeqCst) {
            queue.cancel_all();
        }

        let summary = queue.drain().await;
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = None;

        session.totals.indexed = summary.successful;
        session.totals.failed = summary.failed;
        session.totals.degraded = degraded.load(Ordering::SeqCst);
        let cancelled = summary.cancelled > 0 || self.cancel_requested.load(Ordering::SeqCst);
        self.set_status(
            session,
            if cancelled {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Completed
            },
        );

        // Only a clean run may short-circuit the next one.
        if session.status == SessionStatus::Completed && summary.failed == 0 && session.totals.degraded == 0 {
            self.tracking
                .save_root_state(&RootState {
                    root_path: root_str.clone(),
                    aggregate_hash: scan.aggregate_hash,
                    total_files: scan.files.len() as i64,
                    total_size: scan.total_size as i64,
                    last_scan_time: chrono::Utc::now().timestamp(),
                })
                .await?;
        } else {
            self.tracking.clear_root_state(&root_str).await?;
        }

        sink.emit(IngestEvent::Complete {
            processed: summary.processed(),
            successful: summary.successful,
            failed: summary.failed,
        })
        .await;
        Ok(())
    }
}

/// Settings for [`Orchestrator::watch`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub interval: Option<Duration>,
    /// Path prefixes whose changes are not indexing triggers.
    pub ignore: Vec<PathBuf>,
}

impl WatchOptions {
    pub fn from_indexing(config: &IndexingConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.watch_debounce_ms),
            interval: (config.watch_interval_secs > 0).then(|| Duration::from_secs(config.watch_interval_secs)),
            ignore: Vec::new(),
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Store source name of a file under `root`.
pub fn source_for(root: &Path, relative: &str) -> String {
    let mut path = PathBuf::from(root);
    for part in relative.split('/') {
        path.push(part);
    }
    path.to_string_lossy().to_string()
}

/// Text an image is embedded from: its path words, e.g. `photos/red_car.png`
/// becomes `photos red car`.
pub fn image_description(relative: &str) -> String {
    let without_ext = match relative.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => relative,
    };
    without_ext
        .split(|c: char| c == '/' || c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reindex one file and record the outcome in tracking.
struct FileJob {
    pipeline: Arc<Pipeline>,
    tracking: Tracking,
    root: String,
    source: String,
    file: ScannedFile,
    degraded: Arc<AtomicU64>,
}

impl FileJob {
    async fn prepare(&self) -> RagResult<(PreparedDoc, ScannedFile)> {
        let bytes = tokio::fs::read(&self.file.abs_path).await?;
        let mut file = self.file.clone();
        file.content_hash = Pipeline::content_hash(&bytes);
        file.size = bytes.len() as u64;

        let content = match self.file.file_type {
            FileType::Image => image_description(&self.file.path),
            FileType::Document | FileType::Code => String::from_utf8(bytes)
                .map_err(|_| RagError::validation(format!("{} is not valid UTF-8", self.file.path)))?,
        };
        Ok((
            PreparedDoc {
                source: self.source.clone(),
                modality: self.file.file_type.modality(),
                content,
                captions: None,
            },
            file,
        ))
    }

    async fn attempt(&self) -> RagResult<(IngestOutcome, ScannedFile)> {
        let (doc, file) = self.prepare().await?;
        let outcome = self.pipeline.ingest(&doc).await?;
        Ok((outcome, file))
    }
}

#[async_trait]
impl Job for FileJob {
    fn item_id(&self) -> String {
        self.file.path.clone()
    }

    fn lane(&self) -> Lane {
        self.file.file_type.lane()
    }

    fn summary(&self) -> String {
        format!("{} {}", self.file.file_type.modality(), self.source)
    }

    async fn run(&self) -> RagResult<()> {
        match self.attempt().await {
            Ok((outcome, file)) if outcome.degraded => {
                self.degraded.fetch_add(1, Ordering::SeqCst);
                self.tracking
                    .mark_degraded(&self.root, &file, outcome.document_id, outcome.fallbacks)
                    .await?;
                Ok(())
            }
            Ok((outcome, file)) => {
                self.tracking.mark_indexed(&self.root, &file, outcome.document_id).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(te) = self.tracking.mark_failed(&self.root, &self.file, &e.to_string()).await {
                    tracing::warn!(path = %self.file.path, error = %te, "failed to record failure");
                }
                Err(e)
            }
        }
    }
}

/// Lane for content of `modality`.
pub fn lane_for(modality: Modality) -> Lane {
    match modality {
        Modality::Code => Lane::Code,
        Modality::Images => Lane::Image,
        Modality::Docs | Modality::Captions => Lane::Document,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, Config};
    use crate::embedding::testing::ToggleBackend;
    use crate::embedding::{DisabledBackend, EmbeddingBackend, EmbeddingClient};
    use crate::events::{channel, EventEnvelope};
    use crate::sqlite_store::SqliteStore;
    use rag_harness_core::store::VectorStore;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        orchestrator: Orchestrator,
        store: Arc<SqliteStore>,
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(DisabledBackend)).await
    }

    async fn fixture_with(backend: Arc<dyn EmbeddingBackend>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let config: Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n[embedding]\ntext_model = \"tiny\"\n[[models]]\nid = \"tiny\"\ndims = 8\n[indexing]\nbackoff_base_ms = 1\nbackoff_cap_ms = 2\n",
            tmp.path().join("rag.sqlite").display()
        ))
        .unwrap();
        validate(&config).unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool, &config).await.unwrap();
        let store = Arc::new(SqliteStore::open(pool.clone(), &config).await.unwrap());
        let client = Arc::new(EmbeddingClient::from_config(&config, backend, None));
        let pipeline = Arc::new(Pipeline::new(&config, store.clone(), client));
        let orchestrator = Orchestrator::new(&config.indexing, pipeline, pool, Arc::new(QueueCounters::default()));
        Fixture {
            _tmp: tmp,
            root,
            orchestrator,
            store,
        }
    }

    async fn run(f: &Fixture) -> (IndexingSession, Vec<EventEnvelope>) {
        let (sink, mut rx) = channel("test", 256);
        let session = f.orchestrator.run(&f.root, sink).await.unwrap();
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        (session, events)
    }

    #[tokio::test]
    async fn test_second_run_is_skipped() {
        let f = fixture().await;
        std::fs::write(f.root.join("a.md"), "# A\n\nAlpha is first.").unwrap();
        std::fs::write(f.root.join("b.rs"), "fn b() {}\n").unwrap();

        let (first, events) = run(&f).await;
        assert_eq!(first.status, SessionStatus::Completed);
        assert_eq!(first.totals.indexed, 2);
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e.event {
                IngestEvent::Enqueued { .. } => "enqueued",
                IngestEvent::Accepted { .. } => "accepted",
                IngestEvent::Progress { .. } => "progress",
                IngestEvent::Complete { .. } => "complete",
                IngestEvent::Error { .. } => "error",
                IngestEvent::Skipped { .. } => "skipped",
            })
            .collect();
        assert_eq!(kinds, vec!["enqueued", "accepted", "progress", "progress", "complete"]);

        let (second, events) = run(&f).await;
        assert_eq!(second.status, SessionStatus::Skipped);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, IngestEvent::Skipped { .. }));
        assert_eq!(f.store.stats().await.unwrap().documents, 2);
    }

    #[tokio::test]
    async fn test_only_changed_files_reindexed() {
        let f = fixture().await;
        std::fs::write(f.root.join("keep.md"), "Keep this file.").unwrap();
        std::fs::write(f.root.join("edit.md"), "Version one.").unwrap();
        std::fs::write(f.root.join("drop.md"), "Delete me later.").unwrap();
        run(&f).await;

        std::fs::write(f.root.join("edit.md"), "Version two is longer.").unwrap();
        std::fs::remove_file(f.root.join("drop.md")).unwrap();
        let (session, _) = run(&f).await;
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.totals.indexed, 1);
        assert_eq!(session.totals.removed, 1);
        assert_eq!(session.totals.skipped, 1);

        let root = f.orchestrator.tracking().load(&session.root_path).await.unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(f.store.stats().await.unwrap().documents, 2);
    }

    #[tokio::test]
    async fn test_failed_file_is_tracked_and_retried() {
        let f = fixture().await;
        std::fs::write(f.root.join("empty.md"), "   ").unwrap();
        std::fs::write(f.root.join("ok.md"), "Fine content.").unwrap();

        let (session, _) = run(&f).await;
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.totals.failed, 1);
        let tracked = f.orchestrator.tracking().load(&session.root_path).await.unwrap();
        assert_eq!(tracked["empty.md"].status, tracking::FileStatus::Failed);
        assert!(tracked["empty.md"].error.is_some());

        // Nothing changed on disk, but the failure makes the next run compare per file.
        let (again, _) = run(&f).await;
        assert_eq!(again.status, SessionStatus::Completed);
        assert_eq!(again.totals.failed, 1);
        assert_eq!(again.totals.indexed, 0);
        assert_eq!(f.orchestrator.dead_letters().list(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_degraded_files_are_retried_until_backend_recovers() {
        let backend = ToggleBackend::new(8, false);
        let f = fixture_with(backend.clone()).await;
        std::fs::write(f.root.join("a.md"), "# A\n\nWritten during an outage.").unwrap();

        let (first, _) = run(&f).await;
        assert_eq!(first.status, SessionStatus::Completed);
        assert_eq!(first.totals.indexed, 1);
        assert_eq!(first.totals.degraded, 1);
        let tracked = f.orchestrator.tracking().load(&first.root_path).await.unwrap();
        assert_eq!(tracked["a.md"].status, tracking::FileStatus::Degraded);
        assert!(f.orchestrator.tracking().root_state(&first.root_path).await.unwrap().is_none());

        // Still down: the file is tried again rather than skipped.
        let (second, _) = run(&f).await;
        assert_eq!(second.status, SessionStatus::Completed);
        assert_eq!(second.totals.degraded, 1);

        backend.set_up(true);
        let (healed, _) = run(&f).await;
        assert_eq!(healed.status, SessionStatus::Completed);
        assert_eq!(healed.totals.indexed, 1);
        assert_eq!(healed.totals.degraded, 0);
        let tracked = f.orchestrator.tracking().load(&healed.root_path).await.unwrap();
        assert_eq!(tracked["a.md"].status, tracking::FileStatus::Indexed);
        let fallback_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE fallback = 1")
            .fetch_one(f.store.pool())
            .await
            .unwrap();
        assert_eq!(fallback_rows, 0);

        let (settled, _) = run(&f).await;
        assert_eq!(settled.status, SessionStatus::Skipped);

        let history = f.orchestrator.tracking().recent_sessions(10).await.unwrap();
        assert!(history.iter().any(|s| s.totals.degraded == 1));
    }

    #[tokio::test]
    async fn test_watch_reindexes_on_change() {
        let f = fixture().await;
        std::fs::write(f.root.join("a.md"), "# A\n\nAlpha before watching.").unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (sessions_tx, mut sessions_rx) = tokio::sync::mpsc::unbounded_channel();
        let options = WatchOptions {
            debounce: Duration::from_millis(50),
            interval: None,
            ignore: Vec::new(),
        };

        let watching = async {
            f.orchestrator
                .watch(
                    &f.root,
                    options,
                    async {
                        let _ = stop_rx.await;
                    },
                    || {
                        let (sink, mut rx) = channel("watch", 256);
                        let tx = sessions_tx.clone();
                        tokio::spawn(async move {
                            while let Some(env) = rx.recv().await {
                                if env.event.is_terminal() {
                                    let _ = tx.send(env.event);
                                }
                            }
                        });
                        sink
                    },
                )
                .await
        };
        let driving = async {
            let first = sessions_rx.recv().await.unwrap();
            assert!(matches!(first, IngestEvent::Complete { successful: 1, .. }));

            std::fs::write(f.root.join("b.md"), "# B\n\nBravo arrives later.").unwrap();
            let second = tokio::time::timeout(Duration::from_secs(10), sessions_rx.recv())
                .await
                .expect("no run after the change")
                .unwrap();
            assert!(matches!(second, IngestEvent::Complete { successful: 1, .. }));
            let _ = stop_tx.send(());
        };

        let (runs, ()) = tokio::join!(watching, driving);
        assert!(runs.unwrap() >= 2);
        assert_eq!(f.store.stats().await.unwrap().documents, 2);
    }

    #[tokio::test]
    async fn test_missing_root_errors() {
        let f = fixture().await;
        let (sink, mut rx) = channel("x", 4);
        let err = f.orchestrator.run(&f.root.join("nope"), sink).await.unwrap_err();
        assert_eq!(err.kind(), rag_harness_core::ErrorKind::Validation);
        assert!(matches!(rx.try_recv().unwrap().event, IngestEvent::Error { .. }));
    }

    #[test]
    fn test_image_description() {
        assert_eq!(image_description("photos/red_car.png"), "photos red car");
        assert_eq!(image_description("x.jpeg"), "x");
    }
}
