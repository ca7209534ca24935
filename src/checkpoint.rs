//! SQLite-backed [`CheckpointStore`].
//!
//! One row per `(project_id, repository, path)` in the `checkpoints`
//! table. Timestamps are stored as unix milliseconds.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use reposync_core::models::{CheckpointEntry, CheckpointStatus};
use reposync_core::traits::CheckpointStore;

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<CheckpointEntry> {
    let status: String = row.get("status");
    let millis: i64 = row.get("last_synced_at");
    let chunk_count: i64 = row.get("chunk_count");
    Ok(CheckpointEntry {
        project_id: row.get("project_id"),
        repository: row.get("repository"),
        path: row.get("path"),
        revision: row.get("revision"),
        repo_revision: row.get("repo_revision"),
        chunk_count: chunk_count.max(0) as usize,
        status: CheckpointStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown checkpoint status '{}'", status))?,
        last_synced_at: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default(),
    })
}

const SELECT_COLUMNS: &str = "SELECT project_id, repository, path, revision, repo_revision, \
     chunk_count, status, last_synced_at FROM checkpoints";

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(
        &self,
        project_id: &str,
        repository: &str,
        path: &str,
    ) -> Result<Option<CheckpointEntry>> {
        let row = sqlx::query(&format!(
            "{} WHERE project_id = ? AND repository = ? AND path = ?",
            SELECT_COLUMNS
        ))
        .bind(project_id)
        .bind(repository)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list(
        &self,
        project_id: &str,
        repository: Option<&str>,
    ) -> Result<Vec<CheckpointEntry>> {
        let rows = match repository {
            Some(repo) => {
                sqlx::query(&format!(
                    "{} WHERE project_id = ? AND repository = ? ORDER BY path",
                    SELECT_COLUMNS
                ))
                .bind(project_id)
                .bind(repo)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{} WHERE project_id = ? ORDER BY repository, path",
                    SELECT_COLUMNS
                ))
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_entry).collect()
    }

    async fn save(&self, entry: &CheckpointEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (project_id, repository, path, revision, repo_revision,
                                     chunk_count, status, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, repository, path) DO UPDATE SET
                revision = excluded.revision,
                repo_revision = excluded.repo_revision,
                chunk_count = excluded.chunk_count,
                status = excluded.status,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(&entry.project_id)
        .bind(&entry.repository)
        .bind(&entry.path)
        .bind(&entry.revision)
        .bind(&entry.repo_revision)
        .bind(entry.chunk_count as i64)
        .bind(entry.status.as_str())
        .bind(entry.last_synced_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, project_id: &str, repository: &str, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE project_id = ? AND repository = ? AND path = ?")
            .bind(project_id)
            .bind(repository)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_repo_revision(
        &self,
        project_id: &str,
        repository: &str,
        revision: &str,
    ) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE checkpoints SET repo_revision = ?
            WHERE project_id = ? AND repository = ?
              AND (repo_revision IS NULL OR repo_revision != ?)
            "#,
        )
        .bind(revision)
        .bind(project_id)
        .bind(repository)
        .bind(revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }
}
