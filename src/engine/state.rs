//! Run phases and the mutable counters aggregated while a run is live.

use std::collections::BTreeSet;

use reposync_core::models::{IssueScope, RunResult, SyncIssue};
use serde::Serialize;

/// Lifecycle of one sync run.
///
/// ```text
/// Discovering → Diffing → Filtering → Processing → Persisting → Reporting → Done
///      └──────────┴──────────────────────┴──→ Failed → Reporting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Discovering,
    Diffing,
    Filtering,
    Processing,
    Persisting,
    Reporting,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Discovering => "discovering",
            RunPhase::Diffing => "diffing",
            RunPhase::Filtering => "filtering",
            RunPhase::Processing => "processing",
            RunPhase::Persisting => "persisting",
            RunPhase::Reporting => "reporting",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Discovering, Diffing)
                | (Diffing, Filtering)
                | (Filtering, Processing)
                | (Processing, Persisting)
                | (Persisting, Reporting)
                | (Reporting, Done)
                | (Discovering, Failed)
                | (Diffing, Failed)
                | (Filtering, Failed)
                | (Processing, Failed)
                | (Persisting, Failed)
                | (Failed, Reporting)
        )
    }
}

/// Counters and issues accumulated by the engine and its workers.
///
/// Every update is an increment or an append, so merging stats from
/// different workers commutes.
#[derive(Debug, Default)]
pub(crate) struct RunStats {
    pub files_processed: usize,
    pub files_synced: usize,
    pub files_failed: usize,
    pub files_deleted: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub vectors_upserted: usize,
    pub vectors_deleted: usize,
    pub warnings: Vec<SyncIssue>,
    /// Repositories with at least one failure; their head marker must not
    /// advance.
    pub failed_repos: BTreeSet<String>,
}

impl RunStats {
    pub fn warn(&mut self, scope: IssueScope, target: Option<String>, message: impl Into<String>) {
        let issue = SyncIssue::new(scope, target, message);
        tracing::warn!(scope = ?issue.scope, "{}", issue);
        self.warnings.push(issue);
    }

    pub fn fail_repo(&mut self, repository: &str) {
        self.failed_repos.insert(repository.to_string());
    }

    pub fn merge(&mut self, other: RunStats) {
        self.files_processed += other.files_processed;
        self.files_synced += other.files_synced;
        self.files_failed += other.files_failed;
        self.files_deleted += other.files_deleted;
        self.chunks_created += other.chunks_created;
        self.embeddings_generated += other.embeddings_generated;
        self.vectors_upserted += other.vectors_upserted;
        self.vectors_deleted += other.vectors_deleted;
        self.warnings.extend(other.warnings);
        self.failed_repos.extend(other.failed_repos);
    }

    pub fn apply_to(self, result: &mut RunResult) {
        result.files_processed += self.files_processed;
        result.files_synced += self.files_synced;
        result.files_failed += self.files_failed;
        result.files_deleted += self.files_deleted;
        result.chunks_created += self.chunks_created;
        result.embeddings_generated += self.embeddings_generated;
        result.vectors_upserted += self.vectors_upserted;
        result.vectors_deleted += self.vectors_deleted;
        result.warnings.extend(self.warnings);
    }
}
