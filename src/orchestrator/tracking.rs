//! Persistent change-detection state: per-file tracking, per-root aggregate
//! state, and indexing session history.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use super::scan::ScannedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Indexed,
    /// Stored with fallback vectors from a failing backend.
    Degraded,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Indexed => "indexed",
            FileStatus::Degraded => "degraded",
            FileStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "indexed" => FileStatus::Indexed,
            "degraded" => FileStatus::Degraded,
            "failed" => FileStatus::Failed,
            _ => FileStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileTrackingRecord {
    pub path: String,
    pub content_hash: String,
    pub mtime: i64,
    pub size: u64,
    pub status: FileStatus,
    pub last_indexed_mtime: Option<i64>,
    pub error: Option<String>,
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct RootState {
    pub root_path: String,
    pub aggregate_hash: String,
    pub total_files: i64,
    pub total_size: i64,
    pub last_scan_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Scanning,
    Skipped,
    Indexing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Scanning => "scanning",
            SessionStatus::Skipped => "skipped",
            SessionStatus::Indexing => "indexing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Skipped | SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionTotals {
    pub scanned: u64,
    pub indexed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub removed: u64,
    pub degraded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexingSession {
    pub session_id: String,
    pub root_path: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: SessionStatus,
    pub totals: SessionTotals,
    pub error: Option<String>,
}

/// Files to work on after comparing a scan with tracking.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// New, changed, or previously failed files.
    pub reindex: Vec<ScannedFile>,
    /// Same content, new mtime: tracking is refreshed, nothing is re-read.
    pub touched: Vec<ScannedFile>,
    pub unchanged: usize,
    /// Tracked paths no longer on disk.
    pub vanished: Vec<FileTrackingRecord>,
}

/// A file is reindexed iff it is untracked, its content hash changed, or
/// its last attempt did not finish successfully (failed or degraded).
pub fn detect_changes(scanned: &[ScannedFile], tracked: &HashMap<String, FileTrackingRecord>) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for file in scanned {
        match tracked.get(&file.path) {
            None => changes.reindex.push(file.clone()),
            Some(t) if t.content_hash != file.content_hash || t.status != FileStatus::Indexed => {
                changes.reindex.push(file.clone())
            }
            Some(t) if t.mtime != file.mtime => changes.touched.push(file.clone()),
            Some(_) => changes.unchanged += 1,
        }
    }

    let present: std::collections::HashSet<&str> = scanned.iter().map(|f| f.path.as_str()).collect();
    let mut vanished: Vec<FileTrackingRecord> = tracked
        .values()
        .filter(|t| !present.contains(t.path.as_str()))
        .cloned()
        .collect();
    vanished.sort_by(|a, b| a.path.cmp(&b.path));
    changes.vanished = vanished;
    changes
}

/// SQLite access for tracking tables.
#[derive(Clone)]
pub struct Tracking {
    pool: SqlitePool,
}

impl Tracking {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, root: &str) -> Result<HashMap<String, FileTrackingRecord>> {
        let rows: Vec<(String, String, i64, i64, String, Option<i64>, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT path, content_hash, mtime, size, status, last_indexed_mtime, error, document_id FROM file_tracking WHERE root_path = ?",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(path, content_hash, mtime, size, status, last_indexed_mtime, error, document_id)| {
                (
                    path.clone(),
                    FileTrackingRecord {
                        path,
                        content_hash,
                        mtime,
                        size: size as u64,
                        status: FileStatus::parse(&status),
                        last_indexed_mtime,
                        error,
                        document_id,
                    },
                )
            })
            .collect())
    }

    pub async fn mark_indexed(&self, root: &str, file: &ScannedFile, document_id: i64) -> Result<()> {
        self.upsert(root, file, FileStatus::Indexed, None, Some(document_id)).await
    }

    /// Searchable, but only through fallback vectors. Retried every run.
    pub async fn mark_degraded(&self, root: &str, file: &ScannedFile, document_id: i64, fallbacks: usize) -> Result<()> {
        let note = format!("{} chunks embedded with fallback vectors", fallbacks);
        self.upsert(root, file, FileStatus::Degraded, Some(&note), Some(document_id)).await
    }

    pub async fn mark_failed(&self, root: &str, file: &ScannedFile, error: &str) -> Result<()> {
        self.upsert(root, file, FileStatus::Failed, Some(error), None).await
    }

    async fn upsert(
        &self,
        root: &str,
        file: &ScannedFile,
        status: FileStatus,
        error: Option<&str>,
        document_id: Option<i64>,
    ) -> Result<()> {
        let indexed_mtime = (status == FileStatus::Indexed).then_some(file.mtime);
        sqlx::query(
            r#"
            INSERT INTO file_tracking (root_path, path, content_hash, mtime, size, status, last_indexed_mtime, error, document_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(root_path, path) DO UPDATE SET
                content_hash = excluded.content_hash,
                mtime = excluded.mtime,
                size = excluded.size,
                status = excluded.status,
                last_indexed_mtime = COALESCE(excluded.last_indexed_mtime, file_tracking.last_indexed_mtime),
                error = excluded.error,
                document_id = COALESCE(excluded.document_id, file_tracking.document_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(root)
        .bind(&file.path)
        .bind(&file.content_hash)
        .bind(file.mtime)
        .bind(file.size as i64)
        .bind(status.as_str())
        .bind(indexed_mtime)
        .bind(error)
        .bind(document_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a new mtime for a file whose content did not change.
    pub async fn refresh_mtime(&self, root: &str, path: &str, mtime: i64) -> Result<()> {
        sqlx::query("UPDATE file_tracking SET mtime = ?, updated_at = ? WHERE root_path = ? AND path = ?")
            .bind(mtime)
            .bind(chrono::Utc::now().timestamp())
            .bind(root)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, root: &str, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_tracking WHERE root_path = ? AND path = ?")
            .bind(root)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn root_state(&self, root: &str) -> Result<Option<RootState>> {
        let state = sqlx::query_as::<_, RootState>(
            "SELECT root_path, aggregate_hash, total_files, total_size, last_scan_time FROM root_state WHERE root_path = ?",
        )
        .bind(root)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    pub async fn save_root_state(&self, state: &RootState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO root_state (root_path, aggregate_hash, total_files, total_size, last_scan_time)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(root_path) DO UPDATE SET
                aggregate_hash = excluded.aggregate_hash,
                total_files = excluded.total_files,
                total_size = excluded.total_size,
                last_scan_time = excluded.last_scan_time
            "#,
        )
        .bind(&state.root_path)
        .bind(&state.aggregate_hash)
        .bind(state.total_files)
        .bind(state.total_size)
        .bind(state.last_scan_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forget the aggregate so the next run compares file by file.
    pub async fn clear_root_state(&self, root: &str) -> Result<()> {
        sqlx::query("DELETE FROM root_state WHERE root_path = ?")
            .bind(root)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_session(&self, session: &IndexingSession) -> Result<()> {
        let t = &session.totals;
        sqlx::query(
            r#"
            INSERT INTO indexing_sessions (session_id, root_path, start_time, end_time, status, scanned, indexed, skipped, failed, removed, degraded, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                end_time = excluded.end_time,
                status = excluded.status,
                scanned = excluded.scanned,
                indexed = excluded.indexed,
                skipped = excluded.skipped,
                failed = excluded.failed,
                removed = excluded.removed,
                degraded = excluded.degraded,
                error = excluded.error
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.root_path)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status.as_str())
        .bind(t.scanned as i64)
        .bind(t.indexed as i64)
        .bind(t.skipped as i64)
        .bind(t.failed as i64)
        .bind(t.removed as i64)
        .bind(t.degraded as i64)
        .bind(&session.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_sessions(&self, limit: i64) -> Result<Vec<IndexingSession>> {
        type Row = (String, String, i64, Option<i64>, String, i64, i64, i64, i64, i64, i64, Option<String>);
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT session_id, root_path, start_time, end_time, status, scanned, indexed, skipped, failed, removed, degraded, error FROM indexing_sessions ORDER BY start_time DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(session_id, root_path, start_time, end_time, status, scanned, indexed, skipped, failed, removed, degraded, error)| {
                IndexingSession {
                    session_id,
                    root_path,
                    start_time,
                    end_time,
                    status: match status.as_str() {
                        "scanning" => SessionStatus::Scanning,
                        "skipped" => SessionStatus::Skipped,
                        "indexing" => SessionStatus::Indexing,
                        "completed" => SessionStatus::Completed,
                        "failed" => SessionStatus::Failed,
                        "cancelled" => SessionStatus::Cancelled,
                        _ => SessionStatus::Idle,
                    },
                    totals: SessionTotals {
                        scanned: scanned as u64,
                        indexed: indexed as u64,
                        skipped: skipped as u64,
                        failed: failed as u64,
                        removed: removed as u64,
                        degraded: degraded as u64,
                    },
                    error,
                }
            })
            .collect())
    }
}
