//! Bounded-concurrency ingestion queue with retries and dead letters.
//!
//! Each submitted item runs on its own task but must hold a permit from its
//! lane's semaphore (`document`, `code`, `image`) to execute, so at most
//! `concurrency.<lane>` items of a kind run at once. Semaphores are fair, so
//! items start in submission order within a lane.
//!
//! - **pause/resume**: running items finish; nothing new starts while paused.
//! - **cancel(item_id)**: valid until the item is dequeued (queued or waiting
//!   for a retry).
//! - **retry**: `timeout`, `network`, `rate_limit` and retryable
//!   `model_unavailable` failures run again after `base * 2^(attempt-1)`
//!   (capped), up to `max_attempts`.
//! - **dead letters**: every item that ends in failure is recorded with its
//!   last error.
//! - **drain**: wait until every submitted item is finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use rag_harness_core::retry::RetryPolicy;
use rag_harness_core::{RagError, RagResult};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{watch, Semaphore};

use crate::config::IndexingConfig;
use crate::events::{EventSink, IngestEvent};

/// Worker pool an item runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Document,
    Code,
    Image,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Document => "document",
            Lane::Code => "code",
            Lane::Image => "image",
        }
    }
}

/// A unit of work. `run` is called once per attempt.
#[async_trait]
pub trait Job: Send + Sync {
    fn item_id(&self) -> String;

    fn lane(&self) -> Lane;

    /// Short description stored with dead letters.
    fn summary(&self) -> String;

    async fn run(&self) -> RagResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Running,
    Retrying,
    Done,
    Cancelled,
    DeadLettered,
}

impl ItemState {
    fn is_final(&self) -> bool {
        matches!(self, ItemState::Done | ItemState::Cancelled | ItemState::DeadLettered)
    }
}

/// Observable state of one queue item.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub item_id: String,
    pub lane: Lane,
    pub payload: String,
    pub attempt_count: u32,
    pub state: ItemState,
    pub last_error: Option<String>,
}

/// What a drained queue did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub submitted: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
}

impl QueueSummary {
    /// Items that reached a final state other than cancelled.
    pub fn processed(&self) -> u64 {
        self.successful + self.failed
    }
}

/// Process-wide counters shared by every queue, reported under `/stats`.
#[derive(Debug, Default)]
pub struct QueueCounters {
    submitted: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
}

impl QueueCounters {
    pub fn snapshot(&self) -> QueueSummary {
        QueueSummary {
            submitted: self.submitted.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub document: usize,
    pub code: usize,
    pub image: usize,
    pub policy: RetryPolicy,
}

impl QueueConfig {
    pub fn from_indexing(config: &IndexingConfig) -> Self {
        Self {
            document: config.concurrency.document,
            code: config.concurrency.code,
            image: config.concurrency.image,
            policy: RetryPolicy {
                max_attempts: config.max_attempts,
                base: std::time::Duration::from_millis(config.backoff_base_ms),
                cap: std::time::Duration::from_millis(config.backoff_cap_ms),
            },
        }
    }
}

// ============ Dead letters ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub item_id: String,
    pub payload_summary: String,
    pub attempts: i64,
    pub last_error: String,
    pub error_type: String,
    pub failed_at: i64,
}

/// SQLite-backed dead-letter list.
#[derive(Clone)]
pub struct DeadLetters {
    pool: SqlitePool,
}

impl DeadLetters {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, item: &QueueItem, err: &RagError) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters (item_id, payload_summary, attempts, last_error, error_type, failed_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.item_id)
        .bind(&item.payload)
        .bind(item.attempt_count as i64)
        .bind(err.to_string())
        .bind(err.kind().as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT id, item_id, payload_summary, attempts, last_error, error_type, failed_at FROM dead_letters ORDER BY failed_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM dead_letters").execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}

// ============ Queue ============

struct Entry {
    item: QueueItem,
}

struct Shared {
    items: Mutex<HashMap<String, Entry>>,
    lanes: HashMap<Lane, Arc<Semaphore>>,
    paused: watch::Sender<bool>,
    outstanding: watch::Sender<u64>,
    policy: RetryPolicy,
    dead_letters: Option<DeadLetters>,
    sink: Option<EventSink>,
    summary: Mutex<QueueSummary>,
    counters: Arc<QueueCounters>,
}

impl Shared {
    fn items(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn summary(&self) -> MutexGuard<'_, QueueSummary> {
        self.summary.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, item_id: &str, state: ItemState) {
        if let Some(entry) = self.items().get_mut(item_id) {
            entry.item.state = state;
        }
    }

    fn state(&self, item_id: &str) -> Option<ItemState> {
        self.items().get(item_id).map(|e| e.item.state)
    }

    fn finish_one(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn emit_progress(&self) {
        let Some(sink) = &self.sink else { return };
        let (processed, errors, total) = {
            let s = self.summary();
            (s.processed(), s.failed, s.submitted - s.cancelled)
        };
        sink.emit(IngestEvent::Progress {
            processed,
            errors,
            total,
        })
        .await;
    }
}

/// One run's queue. Create with [`IngestQueue::start`], feed with
/// [`submit`](IngestQueue::submit), finish with [`drain`](IngestQueue::drain).
#[derive(Clone)]
pub struct IngestQueue {
    shared: Arc<Shared>,
}

impl IngestQueue {
    pub fn start(
        config: QueueConfig,
        dead_letters: Option<DeadLetters>,
        sink: Option<EventSink>,
        counters: Arc<QueueCounters>,
    ) -> Self {
        let lanes = [
            (Lane::Document, config.document),
            (Lane::Code, config.code),
            (Lane::Image, config.image),
        ]
        .into_iter()
        .map(|(lane, n)| (lane, Arc::new(Semaphore::new(n.max(1)))))
        .collect();
        let (paused, _) = watch::channel(false);
        let (outstanding, _) = watch::channel(0u64);
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(HashMap::new()),
                lanes,
                paused,
                outstanding,
                policy: config.policy,
                dead_letters,
                sink,
                summary: Mutex::new(QueueSummary::default()),
                counters,
            }),
        }
    }

    /// Enqueue a job. Returns its item id, or `None` if that id is already
    /// pending in this queue.
    pub fn submit(&self, job: Arc<dyn Job>) -> Option<String> {
        let item_id = job.item_id();
        {
            let mut items = self.shared.items();
            if items.get(&item_id).is_some_and(|e| !e.item.state.is_final()) {
                return None;
            }
            items.insert(
                item_id.clone(),
                Entry {
                    item: QueueItem {
                        item_id: item_id.clone(),
                        lane: job.lane(),
                        payload: job.summary(),
                        attempt_count: 0,
                        state: ItemState::Queued,
                        last_error: None,
                    },
                },
            );
        }
        self.shared.summary().submitted += 1;
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.outstanding.send_modify(|n| *n += 1);

        let shared = Arc::clone(&self.shared);
        let id = item_id.clone();
        tokio::spawn(async move { run_item(shared, id, job).await });
        Some(item_id)
    }

    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
        tracing::info!("ingestion queue paused");
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
        tracing::info!("ingestion queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Cancel an item that has not been dequeued. Returns whether it was.
    pub fn cancel(&self, item_id: &str) -> bool {
        {
            let mut items = self.shared.items();
            let Some(entry) = items.get_mut(item_id) else { return false };
            if !matches!(entry.item.state, ItemState::Queued | ItemState::Retrying) {
                return false;
            }
            entry.item.state = ItemState::Cancelled;
        }
        self.shared.summary().cancelled += 1;
        self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.shared.finish_one();
        true
    }

    /// Cancel every item not yet dequeued.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .shared
            .items()
            .values()
            .filter(|e| matches!(e.item.state, ItemState::Queued | ItemState::Retrying))
            .map(|e| e.item.item_id.clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn item(&self, item_id: &str) -> Option<QueueItem> {
        self.shared.items().get(item_id).map(|e| e.item.clone())
    }

    pub fn pending(&self) -> u64 {
        *self.shared.outstanding.borrow()
    }

    /// Wait for every submitted item to finish, then report.
    pub async fn drain(&self) -> QueueSummary {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
        self.shared.summary().clone()
    }
}

async fn run_item(shared: Arc<Shared>, item_id: String, job: Arc<dyn Job>) {
    let Some(semaphore) = shared.lanes.get(&job.lane()).cloned() else {
        return;
    };
    let mut paused = shared.paused.subscribe();

    loop {
        let _ = paused.wait_for(|p| !*p).await;
        let Ok(permit) = semaphore.acquire().await else { return };
        if *paused.borrow() {
            drop(permit);
            continue;
        }

        // Dequeue: from here on the item can no longer be cancelled.
        let attempt = {
            let mut items = shared.items();
            let Some(entry) = items.get_mut(&item_id) else { return };
            if entry.item.state != ItemState::Queued {
                return;
            }
            entry.item.state = ItemState::Running;
            entry.item.attempt_count += 1;
            entry.item.attempt_count
        };

        let result = job.run().await;
        drop(permit);

        match result {
            Ok(()) => {
                shared.set_state(&item_id, ItemState::Done);
                shared.summary().successful += 1;
                shared.counters.successful.fetch_add(1, Ordering::Relaxed);
                shared.emit_progress().await;
                shared.finish_one();
                return;
            }
            Err(err) if shared.policy.should_retry(&err, attempt) => {
                let delay = shared.policy.backoff(attempt);
                tracing::debug!(item = %item_id, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying item");
                {
                    let mut items = shared.items();
                    if let Some(entry) = items.get_mut(&item_id) {
                        entry.item.state = ItemState::Retrying;
                        entry.item.last_error = Some(err.to_string());
                    }
                }
                shared.summary().retries += 1;
                shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;

                let mut items = shared.items();
                match items.get_mut(&item_id) {
                    Some(entry) if entry.item.state == ItemState::Retrying => {
                        entry.item.state = ItemState::Queued;
                    }
                    _ => return,
                }
            }
            Err(err) => {
                let snapshot = {
                    let mut items = shared.items();
                    let Some(entry) = items.get_mut(&item_id) else { return };
                    entry.item.state = ItemState::DeadLettered;
                    entry.item.last_error = Some(err.to_string());
                    entry.item.clone()
                };
                tracing::warn!(
                    item = %item_id,
                    attempts = snapshot.attempt_count,
                    error_type = %err.kind(),
                    error = %err,
                    "item dead-lettered"
                );
                if let Some(dl) = &shared.dead_letters {
                    if let Err(e) = dl.record(&snapshot, &err).await {
                        tracing::error!(item = %item_id, error = %e, "failed to record dead letter");
                    }
                }
                shared.summary().failed += 1;
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                shared.emit_progress().await;
                shared.finish_one();
                return;
            }
        }
    }
}
