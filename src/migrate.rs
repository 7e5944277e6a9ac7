use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;

/// Create every table and index, then seed the declared vector columns.
///
/// Idempotent: a second run changes nothing. A configured dimension that
/// disagrees with an existing column is an error, and the caller treats
/// it as fatal.
pub async fn run_migrations(pool: &SqlitePool, config: &Config) -> Result<()> {
    // Documents, unique by idempotency key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            modality TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Declared shape per modality
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_columns (
            modality TEXT PRIMARY KEY,
            dim INTEGER NOT NULL CHECK (dim > 0),
            metric TEXT NOT NULL,
            model_id TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id INTEGER NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
            model_id TEXT NOT NULL,
            dim INTEGER NOT NULL,
            metric TEXT NOT NULL,
            vector TEXT NOT NULL,
            fallback INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, model_id),
            CHECK (json_valid(vector) AND json_array_length(vector) = dim)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_tracking (
            root_path TEXT NOT NULL,
            path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            status TEXT NOT NULL,
            last_indexed_mtime INTEGER,
            error TEXT,
            document_id INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (root_path, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS root_state (
            root_path TEXT PRIMARY KEY,
            aggregate_hash TEXT NOT NULL,
            total_files INTEGER NOT NULL,
            total_size INTEGER NOT NULL,
            last_scan_time INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_sessions (
            session_id TEXT PRIMARY KEY,
            root_path TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            status TEXT NOT NULL,
            scanned INTEGER NOT NULL DEFAULT 0,
            indexed INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            removed INTEGER NOT NULL DEFAULT 0,
            degraded INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            payload_summary TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            error_type TEXT NOT NULL,
            failed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the first release
    ensure_column(pool, "embeddings", "fallback", "INTEGER NOT NULL DEFAULT 0").await?;
    ensure_column(pool, "indexing_sessions", "degraded", "INTEGER NOT NULL DEFAULT 0").await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters(failed_at DESC)",
    )
    .execute(pool)
    .await?;

    seed_vector_columns(pool, config).await
}

/// Add `column` to `table` when an older database lacks it.
async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, decl: &str) -> Result<()> {
    let present: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await?;
    if present == 0 {
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await
            .with_context(|| format!("failed to add {}.{}", table, column))?;
        tracing::info!(table, column, "added column");
    }
    Ok(())
}

async fn seed_vector_columns(pool: &SqlitePool, config: &Config) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    for col in config.vector_columns()? {
        let existing: Option<(i64, String, String)> =
            sqlx::query_as("SELECT dim, metric, model_id FROM vector_columns WHERE modality = ?")
                .bind(col.modality.as_str())
                .fetch_optional(pool)
                .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO vector_columns (modality, dim, metric, model_id, updated_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(col.modality.as_str())
                .bind(col.dim as i64)
                .bind(col.metric.as_str())
                .bind(&col.model_id)
                .bind(now)
                .execute(pool)
                .await
                .with_context(|| format!("failed to seed vector column for {}", col.modality))?;
                tracing::info!(modality = %col.modality, dim = col.dim, model = %col.model_id, "declared vector column");
            }
            Some((dim, metric, _)) if dim as usize != col.dim || metric != col.metric.as_str() => {
                bail!(
                    "vector column '{}' is declared as {}-dim {} in the database but configured as {}-dim {}; \
                     re-create the database or restore the previous model",
                    col.modality,
                    dim,
                    metric,
                    col.dim,
                    col.metric.as_str()
                );
            }
            Some((_, _, model_id)) if model_id != col.model_id => {
                sqlx::query("UPDATE vector_columns SET model_id = ?, updated_at = ? WHERE modality = ?")
                    .bind(&col.model_id)
                    .bind(now)
                    .bind(col.modality.as_str())
                    .execute(pool)
                    .await?;
                tracing::info!(modality = %col.modality, from = %model_id, to = %col.model_id, "vector column model changed");
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, Config};
    use crate::db;

    fn config_at(dir: &std::path::Path, extra: &str) -> Config {
        let text = format!(
            "[db]\npath = \"{}\"\n{}",
            dir.join("rag.sqlite").display(),
            extra
        );
        let config: Config = toml::from_str(&text).unwrap();
        validate(&config).unwrap();
        config
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_at(tmp.path(), "");
        let pool = db::connect(&config).await.unwrap();
        run_migrations(&pool, &config).await.unwrap();
        run_migrations(&pool, &config).await.unwrap();

        let columns: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_columns")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(columns, 4);
        db::health_check(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_older_embeddings_table_gains_fallback_column() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_at(tmp.path(), "");
        let pool = db::connect(&config).await.unwrap();
        sqlx::query("CREATE TABLE embeddings (chunk_id INTEGER NOT NULL, model_id TEXT NOT NULL, dim INTEGER NOT NULL, metric TEXT NOT NULL, vector TEXT NOT NULL, created_at INTEGER NOT NULL, PRIMARY KEY (chunk_id, model_id))")
            .execute(&pool)
            .await
            .unwrap();
        run_migrations(&pool, &config).await.unwrap();

        let present: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('embeddings') WHERE name = 'fallback'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(present, 1);
    }

    #[tokio::test]
    async fn test_dimension_conflict_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_at(tmp.path(), "");
        let pool = db::connect(&config).await.unwrap();
        run_migrations(&pool, &config).await.unwrap();

        let changed = config_at(
            tmp.path(),
            "[embedding]\ntext_model = \"tiny\"\n[[models]]\nid = \"tiny\"\ndims = 8\n",
        );
        let err = run_migrations(&pool, &changed).await.unwrap_err();
        assert!(err.to_string().contains("vector column"));
    }

    #[tokio::test]
    async fn test_check_constraint_rejects_wrong_length() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_at(tmp.path(), "");
        let pool = db::connect(&config).await.unwrap();
        run_migrations(&pool, &config).await.unwrap();

        sqlx::query("INSERT INTO documents (source, modality, content, content_hash, idempotency_key, created_at) VALUES ('s', 'docs', 'c', 'h', 'k', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chunks (document_id, chunk_index, text, token_estimate) VALUES (1, 0, 't', 1)")
            .execute(&pool)
            .await
            .unwrap();
        let res = sqlx::query("INSERT INTO embeddings (chunk_id, model_id, dim, metric, vector, created_at) VALUES (1, 'm', 3, 'cosine', '[0.1,0.2]', 0)")
            .execute(&pool)
            .await;
        assert!(res.is_err());
    }
}
