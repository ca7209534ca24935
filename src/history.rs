//! Run history in the `runs` table.

use anyhow::{Context, Result};
use reposync_core::models::RunResult;
use sqlx::{Row, SqlitePool};

/// Store a finished run. Re-recording the same run id replaces it.
pub async fn record_run(pool: &SqlitePool, result: &RunResult) -> Result<()> {
    let json = serde_json::to_string(result)?;
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, project_id, started_at, finished_at, success, result_json)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            finished_at = excluded.finished_at,
            success = excluded.success,
            result_json = excluded.result_json
        "#,
    )
    .bind(&result.run_id)
    .bind(&result.project_id)
    .bind(result.started_at.timestamp_millis())
    .bind(result.finished_at.map(|t| t.timestamp_millis()))
    .bind(result.success)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

/// The `limit` most recent runs of a project, newest first.
pub async fn recent_runs(pool: &SqlitePool, project_id: &str, limit: i64) -> Result<Vec<RunResult>> {
    let rows = sqlx::query(
        "SELECT result_json FROM runs WHERE project_id = ? ORDER BY started_at DESC LIMIT ?",
    )
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let json: String = row.get("result_json");
            serde_json::from_str(&json).context("corrupt run history row")
        })
        .collect()
}
