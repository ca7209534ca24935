//! Core data model shared by the sync engine and its collaborators.
//!
//! Everything here except [`CheckpointEntry`] lives for a single run.
//! Checkpoints are the only state that outlives a run and are owned by a
//! [`CheckpointStore`](crate::traits::CheckpointStore).

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the engine computes the delta file set for a repository.
///
/// Fixed per project; a single run never mixes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStrategy {
    /// Compare the repository head recorded at the last sync against the
    /// current head in one detector round trip.
    #[default]
    Repository,
    /// Take the full listing and compare every file's revision against its
    /// own checkpoint.
    PerFile,
}

/// A logical sync target, resolved from configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Organization, directory, or other detector-specific source scope.
    pub scope: String,
    /// Case-insensitive repository name filter.
    pub keyword: Option<String>,
    /// Index partition holding this project's vectors.
    pub namespace: String,
    pub allowed_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub enabled: bool,
    pub diff_strategy: DiffStrategy,
}

/// A repository discovered by the change detector for this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// Stable identifier, e.g. `org/name`.
    pub id: String,
    pub name: String,
    pub owner: String,
    pub default_branch: String,
    /// Current revision marker of the default branch, when known.
    pub head: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }
}

/// One file's change within a repository for the current run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub repository: String,
    pub path: String,
    pub kind: ChangeKind,
    /// Raw text; `None` for removals.
    pub content: Option<String>,
    /// Per-file content marker (e.g. git blob id or commit hash).
    pub revision: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

impl ChangeRecord {
    /// Lowercased extension including the leading dot, or an empty string.
    pub fn extension(&self) -> String {
        file_extension(&self.path)
    }
}

/// Lowercased extension of `path` including the leading dot (`".md"`).
pub fn file_extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Descriptive metadata attached to every chunk written to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub repository: String,
    pub path: String,
    pub revision: String,
    pub extension: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One unit of retrievable text.
///
/// `id` is derived from repository, path and ordinal only; see
/// [`chunk_id`](crate::chunk::chunk_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub ordinal: usize,
    pub total: usize,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// A chunk plus its vector, ready for the index writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Synced,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Synced => "synced",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(CheckpointStatus::Synced),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// Durable record of the last sync of one file in one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub project_id: String,
    pub repository: String,
    pub path: String,
    /// Per-file revision marker last written to the index.
    pub revision: String,
    /// Repository head at the time of the last successful repository pass.
    pub repo_revision: Option<String>,
    /// Number of chunk ordinals that may be present in the index.
    pub chunk_count: usize,
    pub status: CheckpointStatus,
    pub last_synced_at: DateTime<Utc>,
}

/// Where a recorded problem was contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueScope {
    Run,
    Repository,
    File,
    Batch,
    Deletion,
    Notification,
}

/// A structured error or warning collected during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub scope: IssueScope,
    /// Repository id or `repository/path` the issue refers to.
    pub target: Option<String>,
    pub message: String,
}

impl SyncIssue {
    pub fn new(scope: IssueScope, target: Option<String>, message: impl Into<String>) -> Self {
        Self {
            scope,
            target,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}: {}", target, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Aggregate outcome of one sync run.
///
/// `errors` holds fatal problems only (the run stopped early or was
/// canceled); everything contained to a repository, file, batch or
/// deletion lands in `warnings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub project_id: String,
    pub incremental: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub repositories_scanned: usize,
    pub files_discovered: usize,
    pub files_changed: usize,
    pub files_processed: usize,
    pub files_synced: usize,
    pub files_failed: usize,
    pub files_deleted: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub vectors_upserted: usize,
    pub vectors_deleted: usize,
    pub errors: Vec<SyncIssue>,
    pub warnings: Vec<SyncIssue>,
    pub success: bool,
    pub canceled: bool,
}

impl RunResult {
    pub fn new(project_id: &str, incremental: bool) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            incremental,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            repositories_scanned: 0,
            files_discovered: 0,
            files_changed: 0,
            files_processed: 0,
            files_synced: 0,
            files_failed: 0,
            files_deleted: 0,
            chunks_created: 0,
            embeddings_generated: 0,
            vectors_upserted: 0,
            vectors_deleted: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            success: false,
            canceled: false,
        }
    }

    /// Stamp the end time and derive the success flag.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self.success = self.errors.is_empty();
    }

    pub fn classification(&self) -> NotificationKind {
        if !self.errors.is_empty() {
            NotificationKind::Error
        } else if !self.warnings.is_empty() {
            NotificationKind::Warning
        } else {
            NotificationKind::Success
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Warning,
    Error,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
        }
    }
}

/// Human-readable run summary handed to a notifier.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub result: RunResult,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Build the end-of-run summary for a finished result.
    pub fn for_run(result: &RunResult) -> Self {
        let kind = result.classification();
        let title = match kind {
            NotificationKind::Error => format!("reposync failed: {}", result.project_id),
            NotificationKind::Warning => {
                format!("reposync finished with warnings: {}", result.project_id)
            }
            NotificationKind::Success => format!("reposync update: {}", result.project_id),
        };

        let mut message = format!(
            "{} repositories scanned, {}/{} files synced, {} vectors written, {} deleted in {:.1}s",
            result.repositories_scanned,
            result.files_synced,
            result.files_changed,
            result.vectors_upserted,
            result.vectors_deleted,
            result.duration_ms as f64 / 1000.0,
        );
        if let Some(first) = result.errors.first() {
            message.push_str(&format!("\nerror: {}", first));
        }
        if !result.warnings.is_empty() {
            message.push_str(&format!("\n{} warning(s)", result.warnings.len()));
        }

        Self {
            kind,
            title,
            message,
            result: result.clone(),
            timestamp: Utc::now(),
        }
    }
}
