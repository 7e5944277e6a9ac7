use anyhow::Result;
use rag_harness_core::RagError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.db.busy_timeout_ms))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.pool_size.max(1))
        .acquire_timeout(Duration::from_secs(config.db.acquire_timeout_secs))
        .test_before_acquire(true)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// `SELECT 1` round trip.
pub async fn health_check(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

/// Pool exhaustion, IO, and `SQLITE_BUSY`/`SQLITE_LOCKED` are worth one more try.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

/// Run a read, retrying once on a transient failure.
pub async fn read_with_retry<T, F, Fut>(op: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match op().await {
        Err(e) if is_transient(&e) => {
            tracing::warn!(error = %e, "transient database error, retrying read once");
            op().await
        }
        other => other,
    }
}

/// Map a database error onto the shared taxonomy.
pub fn to_rag_error(err: sqlx::Error) -> RagError {
    match err {
        sqlx::Error::PoolTimedOut => RagError::Timeout("database pool acquire timed out".into()),
        sqlx::Error::Database(db) if db.message().contains("CHECK constraint failed") => {
            RagError::validation(format!("rejected by schema: {}", db.message()))
        }
        other => RagError::unexpected(format!("database error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_read_retries_once_on_transient() {
        let calls = AtomicU32::new(0);
        let out = read_with_retry(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(sqlx::Error::PoolTimedOut)
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let out: Result<i32, _> = read_with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
