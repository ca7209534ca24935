use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Per-file sync checkpoints
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            project_id TEXT NOT NULL,
            repository TEXT NOT NULL,
            path TEXT NOT NULL,
            revision TEXT NOT NULL,
            repo_revision TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            last_synced_at INTEGER NOT NULL,
            PRIMARY KEY (project_id, repository, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local vector index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            repository TEXT NOT NULL,
            path TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            total INTEGER NOT NULL,
            revision TEXT NOT NULL,
            extension TEXT NOT NULL,
            text TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            success INTEGER NOT NULL,
            result_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_repo ON checkpoints(project_id, repository)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_path ON vectors(namespace, repository, path)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
