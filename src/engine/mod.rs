//! Sync orchestration engine.
//!
//! [`SyncEngine::run_sync`] performs one synchronization run for a project:
//!
//! 1. **Discovering**: list the project's repositories. Failure is fatal.
//! 2. **Diffing**: plan each repository against its checkpoints (see
//!    [`diff`]). A failing repository is skipped with a warning.
//! 3. **Filtering**: apply the project's [`ContentFilter`]; removals are
//!    diverted to the deletion path.
//! 4. **Processing**: delete vectors of removed files, then chunk and
//!    vectorize changed files on a bounded worker pool (see [`pipeline`]).
//! 5. **Persisting**: flush the last batch and advance repository head
//!    markers of repositories that finished without failures.
//! 6. **Reporting**: finalize the [`RunResult`] and notify exactly once.
//!
//! The caller always gets a `RunResult`, even when the run failed before
//! discovery. Two runs of the same project never overlap; the second one
//! fails fast with [`SyncError::RunInProgress`].

mod diff;
mod lock;
mod pipeline;
mod state;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reposync_core::chunk::{chunk_ids_for, ChunkParams};
use reposync_core::filter::{ContentFilter, FilterDecision};
use reposync_core::models::{
    ChangeRecord, CheckpointEntry, DiffStrategy, IssueScope, Notification, Project, RunResult,
    SyncIssue,
};
use reposync_core::traits::{
    ChangeDetector, CheckpointStore, Chunker, IndexWriter, Notifier, Vectorizer,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::error::SyncError;
use crate::progress::{SyncProgressEvent, SyncReporter};

pub use lock::ProjectLocks;
pub use state::RunPhase;

use diff::{plan_repository, RepoPlan};
use pipeline::{Pipeline, PipelineSettings, WorkItem};
use state::RunStats;

/// The collaborators a run talks to.
#[derive(Clone)]
pub struct SyncDeps {
    pub detector: Arc<dyn ChangeDetector>,
    pub chunker: Arc<dyn Chunker>,
    pub vectorizer: Arc<dyn Vectorizer>,
    pub index: Arc<dyn IndexWriter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Processing limits shared by every run of an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_workers: usize,
    pub chunk_params: ChunkParams,
    /// Vector records accumulated before an index write.
    pub upsert_batch_size: usize,
    /// Texts per vectorizer call.
    pub embedding_batch_size: usize,
    pub run_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workers: 5,
            chunk_params: ChunkParams::default(),
            upsert_batch_size: 100,
            embedding_batch_size: 100,
            run_timeout: None,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.processing.max_workers,
            chunk_params: config.processing.chunk_params(),
            upsert_batch_size: config.processing.upsert_batch_size,
            embedding_batch_size: config.embedding.batch_size,
            run_timeout: config.processing.run_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Per-call options for [`SyncEngine::run_sync_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cancels the run when triggered; in-flight files still finish.
    pub cancel: Option<CancellationToken>,
    /// Overrides the engine-wide run timeout.
    pub timeout: Option<Duration>,
}

/// Tracks the run phase and forwards transitions to the reporter.
struct PhaseTracker {
    project: String,
    phase: RunPhase,
    reporter: Arc<dyn SyncReporter>,
}

impl PhaseTracker {
    fn start(project: &str, reporter: Arc<dyn SyncReporter>) -> Self {
        reporter.report(SyncProgressEvent::Phase {
            project: project.to_string(),
            phase: RunPhase::Discovering,
        });
        Self {
            project: project.to_string(),
            phase: RunPhase::Discovering,
            reporter,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        if self.phase == next {
            return;
        }
        if !self.phase.can_transition_to(next) {
            tracing::warn!(
                "unexpected phase transition {} -> {}",
                self.phase.as_str(),
                next.as_str()
            );
        }
        tracing::debug!(phase = next.as_str(), "phase");
        self.phase = next;
        self.reporter.report(SyncProgressEvent::Phase {
            project: self.project.clone(),
            phase: next,
        });
    }
}

pub struct SyncEngine {
    projects: BTreeMap<String, Project>,
    settings: EngineSettings,
    deps: SyncDeps,
    reporter: Arc<dyn SyncReporter>,
    locks: ProjectLocks,
}

impl SyncEngine {
    pub fn new(
        projects: Vec<Project>,
        settings: EngineSettings,
        deps: SyncDeps,
        reporter: Arc<dyn SyncReporter>,
    ) -> Self {
        Self {
            projects: projects.into_iter().map(|p| (p.id.clone(), p)).collect(),
            settings,
            deps,
            reporter,
            locks: ProjectLocks::new(),
        }
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub async fn run_sync(&self, project_id: &str, incremental: bool) -> RunResult {
        self.run_sync_with(project_id, incremental, RunOptions::default())
            .await
    }

    /// Run every enabled project in id order, one after another.
    pub async fn run_all(&self, incremental: bool) -> Vec<RunResult> {
        let ids: Vec<String> = self
            .projects
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.id.clone())
            .collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.run_sync(&id, incremental).await);
        }
        results
    }

    pub async fn run_sync_with(
        &self,
        project_id: &str,
        incremental: bool,
        options: RunOptions,
    ) -> RunResult {
        let mut result = RunResult::new(project_id, incremental);
        let span = tracing::info_span!("sync", project = %project_id, run = %result.run_id);

        async {
            tracing::info!(incremental, "sync started");
            let mut tracker = PhaseTracker::start(project_id, Arc::clone(&self.reporter));

            let outcome = match self.locks.try_acquire(project_id).await {
                None => Err(SyncError::RunInProgress(project_id.to_string())),
                Some(guard) => {
                    let outcome = self
                        .execute(project_id, incremental, options, &mut result, &mut tracker)
                        .await;
                    drop(guard);
                    outcome
                }
            };

            if let Err(err) = outcome {
                let canceled = matches!(err, SyncError::Canceled | SyncError::DeadlineExceeded(_));
                if canceled {
                    result.canceled = true;
                    tracing::warn!("{}", err);
                } else {
                    tracing::error!("{}", err);
                }
                // A canceled run that reached persisting still flushed its work.
                if !(canceled && tracker.phase == RunPhase::Persisting) {
                    tracker.advance(RunPhase::Failed);
                }
                result.errors.push(SyncIssue::new(
                    IssueScope::Run,
                    Some(project_id.to_string()),
                    err.to_string(),
                ));
            }

            tracker.advance(RunPhase::Reporting);
            result.finish();
            self.notify(&mut result).await;
            tracker.advance(RunPhase::Done);

            tracing::info!(
                success = result.success,
                files_synced = result.files_synced,
                files_failed = result.files_failed,
                vectors_upserted = result.vectors_upserted,
                vectors_deleted = result.vectors_deleted,
                warnings = result.warnings.len(),
                duration_ms = result.duration_ms,
                "sync finished"
            );
            self.reporter.report(SyncProgressEvent::finished(&result));
        }
        .instrument(span)
        .await;

        result
    }

    async fn execute(
        &self,
        project_id: &str,
        incremental: bool,
        options: RunOptions,
        result: &mut RunResult,
        tracker: &mut PhaseTracker,
    ) -> Result<(), SyncError> {
        let project = self
            .projects
            .get(project_id)
            .ok_or_else(|| SyncError::ProjectNotFound(project_id.to_string()))?;
        if !project.enabled {
            return Err(SyncError::ProjectDisabled(project_id.to_string()));
        }
        let filter = ContentFilter::new(&project.allowed_extensions, &project.exclude_patterns)
            .map_err(SyncError::InvalidRules)?;

        let cancel = options.cancel.unwrap_or_default().child_token();
        let deadline = options
            .timeout
            .or(self.settings.run_timeout)
            .map(|limit| Deadline::arm(cancel.clone(), limit));

        let outcome = self
            .sync_project(project, &filter, incremental, &cancel, result, tracker)
            .await;

        if let Some(deadline) = &deadline {
            deadline.disarm();
        }
        outcome?;

        if cancel.is_cancelled() {
            return Err(match deadline {
                Some(d) if d.fired() => SyncError::DeadlineExceeded(d.limit.as_secs()),
                _ => SyncError::Canceled,
            });
        }
        Ok(())
    }

    async fn sync_project(
        &self,
        project: &Project,
        filter: &ContentFilter,
        incremental: bool,
        cancel: &CancellationToken,
        result: &mut RunResult,
        tracker: &mut PhaseTracker,
    ) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let repositories = self
            .deps
            .detector
            .list_repositories(&project.scope, project.keyword.as_deref())
            .await
            .map_err(SyncError::Discovery)?;
        result.repositories_scanned = repositories.len();
        tracing::info!(
            detector = self.deps.detector.name(),
            repositories = repositories.len(),
            "repositories discovered"
        );

        tracker.advance(RunPhase::Diffing);
        let mut stats = RunStats::default();
        let mut plans: Vec<RepoPlan> = Vec::with_capacity(repositories.len());
        for repository in &repositories {
            if cancel.is_cancelled() {
                break;
            }
            match plan_repository(
                self.deps.detector.as_ref(),
                self.deps.checkpoints.as_ref(),
                project,
                repository,
                incremental,
            )
            .await
            {
                Ok(plan) => {
                    tracing::debug!(
                        repository = %repository.id,
                        since = plan.since.as_deref().unwrap_or("-"),
                        changes = plan.records.len(),
                        "repository diffed"
                    );
                    result.files_discovered += plan.discovered;
                    result.files_changed += plan.records.len();
                    self.reporter.report(SyncProgressEvent::Repository {
                        project: project.id.clone(),
                        repository: repository.id.clone(),
                        changes: plan.records.len(),
                    });
                    plans.push(plan);
                }
                Err(e) => {
                    stats.fail_repo(&repository.id);
                    stats.warn(
                        IssueScope::Repository,
                        Some(repository.id.clone()),
                        format!("diff failed, repository skipped: {:#}", e),
                    );
                }
            }
        }

        tracker.advance(RunPhase::Filtering);
        let mut work: Vec<WorkItem> = Vec::new();
        let mut removals: Vec<(ChangeRecord, Option<CheckpointEntry>)> = Vec::new();
        for plan in &mut plans {
            for record in std::mem::take(&mut plan.records) {
                let prior = plan.entries.get(&record.path).cloned();
                match filter.decide_record(&record) {
                    FilterDecision::Process => work.push(WorkItem {
                        record,
                        prior,
                        repo_revision: plan.since.clone(),
                    }),
                    FilterDecision::Delete => removals.push((record, prior)),
                    FilterDecision::Skip(reason) => {
                        tracing::debug!(
                            file = %format!("{}/{}", record.repository, record.path),
                            ?reason,
                            "skipped by content filter"
                        );
                    }
                }
            }
        }

        tracker.advance(RunPhase::Processing);
        for (record, prior) in removals {
            if cancel.is_cancelled() {
                break;
            }
            self.delete_file(project, &record, prior, &mut stats).await;
        }

        let pipeline = Pipeline::new(
            self.deps.clone(),
            &project.id,
            &project.namespace,
            PipelineSettings {
                workers: self.settings.max_workers,
                chunk_params: self.settings.chunk_params,
                embedding_batch_size: self.settings.embedding_batch_size,
                upsert_batch_size: self.settings.upsert_batch_size,
            },
            work,
            cancel.clone(),
            Arc::clone(&self.reporter),
        );
        pipeline.process().await;

        tracker.advance(RunPhase::Persisting);
        pipeline.flush().await;
        stats.merge(pipeline.take_stats().await);

        if !cancel.is_cancelled() {
            self.advance_heads(project, &plans, &mut stats).await;
        }

        stats.apply_to(result);
        Ok(())
    }

    /// Deletion path for one removed file.
    async fn delete_file(
        &self,
        project: &Project,
        record: &ChangeRecord,
        prior: Option<CheckpointEntry>,
        stats: &mut RunStats,
    ) {
        let Some(entry) = prior else {
            return;
        };
        let target = format!("{}/{}", record.repository, record.path);

        if entry.chunk_count > 0 {
            let ids = chunk_ids_for(&entry.repository, &entry.path, 0..entry.chunk_count);
            if let Err(e) = self.deps.index.delete(&ids, &project.namespace).await {
                stats.fail_repo(&record.repository);
                stats.warn(
                    IssueScope::Deletion,
                    Some(target),
                    format!("failed to delete {} vector(s): {:#}", ids.len(), e),
                );
                return;
            }
            stats.vectors_deleted += ids.len();
        }

        match self
            .deps
            .checkpoints
            .delete(&project.id, &entry.repository, &entry.path)
            .await
        {
            Ok(()) => {
                stats.files_deleted += 1;
                tracing::debug!(file = %target, "removed");
            }
            Err(e) => {
                stats.fail_repo(&record.repository);
                stats.warn(
                    IssueScope::Deletion,
                    Some(target),
                    format!("vectors deleted but checkpoint removal failed: {:#}", e),
                );
            }
        }
    }

    /// Record the current head on every checkpoint of each repository that
    /// finished cleanly, so the next incremental run diffs from there.
    async fn advance_heads(&self, project: &Project, plans: &[RepoPlan], stats: &mut RunStats) {
        for plan in plans {
            let repository = &plan.repository;
            let Some(head) = repository.head.as_deref() else {
                continue;
            };
            if stats.failed_repos.contains(&repository.id) {
                tracing::info!(repository = %repository.id, "head not advanced after failures");
                continue;
            }
            if project.diff_strategy == DiffStrategy::Repository
                && plan.since.as_deref() == Some(head)
            {
                continue;
            }
            match self
                .deps
                .checkpoints
                .set_repo_revision(&project.id, &repository.id, head)
                .await
            {
                Ok(changed) => {
                    tracing::debug!(repository = %repository.id, head, changed, "head advanced")
                }
                Err(e) => stats.warn(
                    IssueScope::Repository,
                    Some(repository.id.clone()),
                    format!("failed to record repository head: {:#}", e),
                ),
            }
        }
    }

    async fn notify(&self, result: &mut RunResult) {
        let notification = Notification::for_run(result);
        if let Err(e) = self.deps.notifier.notify(&notification).await {
            tracing::warn!("notification delivery failed: {:#}", e);
            result.warnings.push(SyncIssue::new(
                IssueScope::Notification,
                None,
                format!("notification delivery failed: {:#}", e),
            ));
        }
    }
}

/// Cancels a run token once a time limit elapses.
struct Deadline {
    limit: Duration,
    fired: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Deadline {
    fn arm(token: CancellationToken, limit: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    flag.store(true, Ordering::SeqCst);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
        Self {
            limit,
            fired,
            handle,
        }
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn disarm(&self) {
        self.handle.abort();
    }
}
