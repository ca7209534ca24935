//! Project status: what the checkpoints say about the last syncs.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reposync_core::models::{CheckpointEntry, CheckpointStatus, RunResult};
use serde::Serialize;

use crate::history;
use crate::setup::App;

/// Checkpoint summary for one repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoStatus {
    pub repository: String,
    pub files: usize,
    pub failed: usize,
    pub chunks: usize,
    /// Head marker recorded on the checkpoints, when they all agree.
    pub head: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub project_id: String,
    pub namespace: String,
    pub enabled: bool,
    pub repositories: Vec<RepoStatus>,
    /// Vectors in the project's namespace, when the index can count them.
    pub vectors: Option<usize>,
    pub recent_runs: Vec<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<CheckpointEntry>>,
}

/// Group checkpoint entries per repository, in repository order.
pub fn summarize(entries: &[CheckpointEntry]) -> Vec<RepoStatus> {
    let mut by_repo: BTreeMap<&str, Vec<&CheckpointEntry>> = BTreeMap::new();
    for entry in entries {
        by_repo.entry(entry.repository.as_str()).or_default().push(entry);
    }

    by_repo
        .into_iter()
        .map(|(repository, entries)| {
            let first_head = entries[0].repo_revision.clone();
            let head = first_head.filter(|h| {
                entries
                    .iter()
                    .all(|e| e.repo_revision.as_deref() == Some(h.as_str()))
            });
            RepoStatus {
                repository: repository.to_string(),
                files: entries.len(),
                failed: entries
                    .iter()
                    .filter(|e| e.status == CheckpointStatus::Failed)
                    .count(),
                chunks: entries.iter().map(|e| e.chunk_count).sum(),
                head,
                last_synced_at: entries.iter().map(|e| e.last_synced_at).max(),
            }
        })
        .collect()
}

pub async fn project_status(app: &App, project_id: &str, with_files: bool) -> Result<ProjectStatus> {
    let project = app
        .engine
        .project(project_id)
        .ok_or_else(|| anyhow::anyhow!("project '{}' is not configured", project_id))?;

    let entries = app.deps.checkpoints.list(project_id, None).await?;
    let vectors = match app.index.search.count(&project.namespace).await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!("could not count vectors: {:#}", e);
            None
        }
    };

    Ok(ProjectStatus {
        project_id: project.id.clone(),
        namespace: project.namespace.clone(),
        enabled: project.enabled,
        repositories: summarize(&entries),
        vectors,
        recent_runs: history::recent_runs(&app.pool, project_id, 5).await?,
        files: with_files.then_some(entries),
    })
}

pub fn print_status(status: &ProjectStatus) {
    println!("Project:     {}", status.project_id);
    println!("Namespace:   {}", status.namespace);
    println!("Enabled:     {}", status.enabled);
    if let Some(vectors) = status.vectors {
        println!("Vectors:     {}", vectors);
    }
    println!();

    if status.repositories.is_empty() {
        println!("  No checkpoints yet. Run `reposync sync {}`.", status.project_id);
    } else {
        println!(
            "  {:<36} {:>6} {:>6} {:>7}  {:<12} LAST SYNC",
            "REPOSITORY", "FILES", "FAILED", "CHUNKS", "HEAD"
        );
        println!("  {}", "-".repeat(90));
        for repo in &status.repositories {
            println!(
                "  {:<36} {:>6} {:>6} {:>7}  {:<12} {}",
                repo.repository,
                repo.files,
                repo.failed,
                repo.chunks,
                repo.head.as_deref().map(short_rev).unwrap_or("-"),
                repo.last_synced_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
    }

    if let Some(files) = &status.files {
        println!();
        for entry in files {
            println!(
                "  {:<7} {}/{}  rev={} chunks={}",
                entry.status.as_str(),
                entry.repository,
                entry.path,
                short_rev(&entry.revision),
                entry.chunk_count
            );
        }
    }

    if !status.recent_runs.is_empty() {
        println!();
        println!("  Recent runs:");
        for run in &status.recent_runs {
            println!(
                "  {}  {:<7} {:>5} synced {:>4} failed {:>4} warnings  {}",
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                if run.success { "ok" } else { "failed" },
                run.files_synced,
                run.files_failed,
                run.warnings.len(),
                if run.incremental { "incremental" } else { "full" },
            );
        }
    }
}

fn short_rev(rev: &str) -> &str {
    rev.get(..12).unwrap_or(rev)
}
