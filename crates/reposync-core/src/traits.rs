//! Collaborator traits consumed by the sync engine.
//!
//! The engine only ever talks to these request/response contracts, so any
//! transport satisfies them: an in-process call, a local git checkout, an
//! HTTP API. Tests drive the engine with in-memory fakes.
//!
//! All traits are object-safe and `Send + Sync`; the engine holds each
//! collaborator as an `Arc<dyn Trait>`.
//!
//! | Trait | Failure semantics |
//! |-------|-------------------|
//! | [`ChangeDetector`] | empty listing is valid; `None` marker ⇒ full listing; [`IncompleteDiff`] ⇒ engine relists |
//! | [`Chunker`] | empty content ⇒ empty list |
//! | [`Vectorizer`] | a partial failure fails the whole batch |
//! | [`IndexWriter`] | upsert is all-or-nothing; deleting unknown ids is fine |
//! | [`CheckpointStore`] | "not found" is `Ok(None)` |
//! | [`Notifier`] | failures are logged, never escalated |

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::chunk::ChunkParams;
use crate::models::{
    ChangeRecord, CheckpointEntry, Chunk, Notification, Repository, VectorRecord,
};

// ═══════════════════════════════════════════════════════════════════════
// Discovery and transformation
// ═══════════════════════════════════════════════════════════════════════

/// Discovers repositories and reports file changes between revisions.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Short name used in logs (e.g. `"git"`, `"github"`).
    fn name(&self) -> &str;

    /// Repositories in `scope` whose name contains `keyword`
    /// (case-insensitive). An empty list is not an error.
    async fn list_repositories(
        &self,
        scope: &str,
        keyword: Option<&str>,
    ) -> Result<Vec<Repository>>;

    /// Files changed in `repository` since `since`. With `None`, every file
    /// at the current head is returned as [`Added`](crate::models::ChangeKind::Added).
    ///
    /// When the changes since `since` cannot be listed completely, fail
    /// with an [`IncompleteDiff`] rather than returning a partial list.
    async fn diff(&self, repository: &Repository, since: Option<&str>)
        -> Result<Vec<ChangeRecord>>;
}

/// The changes since a marker cannot be listed completely: the marker is
/// no longer reachable, or the provider capped the comparison. The engine
/// answers with a full listing and treats missing paths as removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteDiff {
    pub reason: String,
}

impl IncompleteDiff {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Whether `err` is (or wraps) an [`IncompleteDiff`].
    pub fn is(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<IncompleteDiff>())
    }
}

impl fmt::Display for IncompleteDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incomplete diff: {}", self.reason)
    }
}

impl std::error::Error for IncompleteDiff {}

/// Splits one file into ordered chunks.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, record: &ChangeRecord, params: &ChunkParams) -> Result<Vec<Chunk>>;
}

/// Converts texts into fixed-dimension vectors.
#[async_trait]
pub trait Vectorizer: Send + Sync {
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// Vectorize `texts`, returning one vector per input in the same order.
    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Persistence
// ═══════════════════════════════════════════════════════════════════════

/// Namespaced vector index.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Upsert a batch of records sharing one namespace. Returns the number
    /// of records written.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize>;

    /// Delete by identifier. Unknown identifiers are ignored.
    async fn delete(&self, ids: &[String], namespace: &str) -> Result<()>;
}

/// Durable per-file checkpoints keyed by `(project, repository, path)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(
        &self,
        project_id: &str,
        repository: &str,
        path: &str,
    ) -> Result<Option<CheckpointEntry>>;

    /// All entries of a project, optionally restricted to one repository.
    async fn list(&self, project_id: &str, repository: Option<&str>)
        -> Result<Vec<CheckpointEntry>>;

    /// Insert or replace the entry with the same key.
    async fn save(&self, entry: &CheckpointEntry) -> Result<()>;

    /// Remove an entry. Removing a missing entry is not an error.
    async fn delete(&self, project_id: &str, repository: &str, path: &str) -> Result<()>;

    /// Record `revision` as the repository head on every entry of the
    /// repository that does not already carry it. Returns the number of
    /// entries changed.
    async fn set_repo_revision(
        &self,
        project_id: &str,
        repository: &str,
        revision: &str,
    ) -> Result<usize> {
        let mut changed = 0;
        for mut entry in self.list(project_id, Some(repository)).await? {
            if entry.repo_revision.as_deref() != Some(revision) {
                entry.repo_revision = Some(revision.to_string());
                self.save(&entry).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reporting
// ═══════════════════════════════════════════════════════════════════════

/// Delivers the end-of-run summary.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}
