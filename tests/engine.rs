//! End-to-end scenarios for the sync engine.
//!
//! Every collaborator is an in-memory fake with failure injection and call
//! recording, so these tests pin down orchestration behavior: what gets
//! diffed, written, deleted and checkpointed, and what lands in the
//! `RunResult`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reposync::engine::{EngineSettings, RunOptions, SyncDeps, SyncEngine};
use reposync::progress::NoProgress;
use reposync_core::chunk::{chunk_id, ChunkParams, TextChunker};
use reposync_core::memory::{MemoryCheckpointStore, MemoryIndex};
use reposync_core::models::{
    ChangeKind, ChangeRecord, CheckpointStatus, Chunk, ChunkMetadata, DiffStrategy, IssueScope,
    Notification, Project, Repository, VectorRecord,
};
use reposync_core::traits::{
    ChangeDetector, CheckpointStore, Chunker, IncompleteDiff, IndexWriter, Notifier, Vectorizer,
};
use reposync_core::vector::HashVectorizer;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ─── Fakes ──────────────────────────────────────────────────────────

type Snapshot = BTreeMap<String, String>;

fn blob_id(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))[..12].to_string()
}

/// Repositories as a list of commits, each a full snapshot of the tree.
#[derive(Default)]
struct FakeDetector {
    repos: Mutex<BTreeMap<String, Vec<(String, Snapshot)>>>,
    diff_calls: Mutex<Vec<(String, Option<String>)>>,
    failing_diffs: Mutex<HashSet<String>>,
    fail_listing: AtomicBool,
    /// Refuse every marker diff as incomplete.
    incomplete_diffs: AtomicBool,
}

impl FakeDetector {
    fn commit(&self, repo: &str, changes: &[(&str, Option<&str>)]) -> String {
        let mut repos = self.repos.lock().unwrap();
        let commits = repos.entry(repo.to_string()).or_default();
        let mut snapshot = commits.last().map(|(_, s)| s.clone()).unwrap_or_default();
        for (path, content) in changes {
            match content {
                Some(text) => {
                    snapshot.insert(path.to_string(), text.to_string());
                }
                None => {
                    snapshot.remove(*path);
                }
            }
        }
        let head = format!("{}@{}", repo, commits.len() + 1);
        commits.push((head.clone(), snapshot));
        head
    }

    fn head(&self, repo: &str) -> String {
        self.repos.lock().unwrap()[repo].last().unwrap().0.clone()
    }

    fn diff_calls(&self) -> Vec<(String, Option<String>)> {
        self.diff_calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.diff_calls.lock().unwrap().clear();
    }
}

fn added(repo: &str, path: &str, content: &str, kind: ChangeKind) -> ChangeRecord {
    ChangeRecord {
        repository: repo.to_string(),
        path: path.to_string(),
        kind,
        content: Some(content.to_string()),
        revision: blob_id(content),
        last_modified: None,
        size: content.len() as u64,
    }
}

#[async_trait]
impl ChangeDetector for FakeDetector {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_repositories(
        &self,
        _scope: &str,
        keyword: Option<&str>,
    ) -> Result<Vec<Repository>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            bail!("listing unavailable");
        }
        let repos = self.repos.lock().unwrap();
        Ok(repos
            .iter()
            .filter(|(id, _)| keyword.map_or(true, |k| id.contains(k)))
            .map(|(id, commits)| {
                let (owner, name) = id.split_once('/').unwrap_or(("org", id));
                Repository {
                    id: id.clone(),
                    name: name.to_string(),
                    owner: owner.to_string(),
                    default_branch: "main".into(),
                    head: commits.last().map(|(h, _)| h.clone()),
                    updated_at: None,
                }
            })
            .collect())
    }

    async fn diff(
        &self,
        repository: &Repository,
        since: Option<&str>,
    ) -> Result<Vec<ChangeRecord>> {
        self.diff_calls
            .lock()
            .unwrap()
            .push((repository.id.clone(), since.map(|s| s.to_string())));
        if self.failing_diffs.lock().unwrap().contains(&repository.id) {
            bail!("diff exploded");
        }
        if since.is_some() && self.incomplete_diffs.load(Ordering::SeqCst) {
            return Err(IncompleteDiff::new("history was rewritten").into());
        }

        let repos = self.repos.lock().unwrap();
        let commits = &repos[&repository.id];
        let (_, current) = commits.last().unwrap();
        let base = since.and_then(|s| commits.iter().find(|(h, _)| h == s).map(|(_, t)| t));

        let Some(base) = base else {
            return Ok(current
                .iter()
                .map(|(p, c)| added(&repository.id, p, c, ChangeKind::Added))
                .collect());
        };

        let mut out = Vec::new();
        for (path, content) in current {
            match base.get(path) {
                None => out.push(added(&repository.id, path, content, ChangeKind::Added)),
                Some(old) if old != content => {
                    out.push(added(&repository.id, path, content, ChangeKind::Modified))
                }
                Some(_) => {}
            }
        }
        for (path, old) in base {
            if !current.contains_key(path) {
                out.push(ChangeRecord {
                    repository: repository.id.clone(),
                    path: path.clone(),
                    kind: ChangeKind::Removed,
                    content: None,
                    revision: blob_id(old),
                    last_modified: None,
                    size: 0,
                });
            }
        }
        Ok(out)
    }
}

/// Hash vectorizer that fails any batch mentioning `POISON` and can be
/// slowed down.
struct FlakyVectorizer {
    inner: HashVectorizer,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FlakyVectorizer {
    fn new() -> Self {
        Self {
            inner: HashVectorizer::new(16),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Vectorizer for FlakyVectorizer {
    fn model_name(&self) -> &str {
        "flaky"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if texts.iter().any(|t| t.contains("POISON")) {
            bail!("model rejected input");
        }
        self.inner.vectorize(texts).await
    }
}

/// One chunk per non-empty line, so tests control exact chunk counts.
struct LineChunker;

#[async_trait]
impl Chunker for LineChunker {
    async fn chunk(&self, record: &ChangeRecord, _params: &ChunkParams) -> Result<Vec<Chunk>> {
        let lines: Vec<&str> = record
            .content
            .as_deref()
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let total = lines.len();
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk {
                id: chunk_id(&record.repository, &record.path, i),
                ordinal: i,
                total,
                text: text.to_string(),
                metadata: ChunkMetadata {
                    repository: record.repository.clone(),
                    path: record.path.clone(),
                    revision: record.revision.clone(),
                    extension: record.extension(),
                    last_modified: None,
                },
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingIndex {
    inner: MemoryIndex,
    upserts: AtomicUsize,
    fail_upserts: AtomicBool,
    fail_deletes: AtomicBool,
}

#[async_trait]
impl IndexWriter for RecordingIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_upserts.load(Ordering::SeqCst) {
            bail!("index unavailable");
        }
        self.inner.upsert(records).await
    }

    async fn delete(&self, ids: &[String], namespace: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("delete refused");
        }
        self.inner.delete(ids, namespace).await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail.load(Ordering::SeqCst) {
            bail!("webhook returned 500");
        }
        Ok(())
    }
}

/// Detector that parks inside discovery until released.
struct GateDetector {
    inner: Arc<FakeDetector>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ChangeDetector for GateDetector {
    fn name(&self) -> &str {
        "gate"
    }

    async fn list_repositories(
        &self,
        scope: &str,
        keyword: Option<&str>,
    ) -> Result<Vec<Repository>> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_repositories(scope, keyword).await
    }

    async fn diff(
        &self,
        repository: &Repository,
        since: Option<&str>,
    ) -> Result<Vec<ChangeRecord>> {
        self.inner.diff(repository, since).await
    }
}

// ─── Harness ────────────────────────────────────────────────────────

const NS: &str = "docs-ns";

fn project(strategy: DiffStrategy) -> Project {
    Project {
        id: "docs".into(),
        name: "Docs".into(),
        scope: "org".into(),
        keyword: None,
        namespace: NS.into(),
        allowed_extensions: vec![".md".into(), ".txt".into()],
        exclude_patterns: vec!["node_modules".into()],
        enabled: true,
        diff_strategy: strategy,
    }
}

struct Harness {
    detector: Arc<FakeDetector>,
    vectorizer: Arc<FlakyVectorizer>,
    index: Arc<RecordingIndex>,
    checkpoints: Arc<MemoryCheckpointStore>,
    notifier: Arc<RecordingNotifier>,
    engine: SyncEngine,
}

struct HarnessOptions {
    strategy: DiffStrategy,
    chunker: Arc<dyn Chunker>,
    vectorizer: FlakyVectorizer,
    upsert_batch_size: usize,
    workers: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            strategy: DiffStrategy::Repository,
            chunker: Arc::new(TextChunker),
            vectorizer: FlakyVectorizer::new(),
            upsert_batch_size: 100,
            workers: 3,
        }
    }
}

fn harness_with(detector: Arc<FakeDetector>, opts: HarnessOptions) -> Harness {
    let vectorizer = Arc::new(opts.vectorizer);
    let index = Arc::new(RecordingIndex::default());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let deps = SyncDeps {
        detector: detector.clone(),
        chunker: opts.chunker,
        vectorizer: vectorizer.clone(),
        index: index.clone(),
        checkpoints: checkpoints.clone(),
        notifier: notifier.clone(),
    };
    let settings = EngineSettings {
        max_workers: opts.workers,
        upsert_batch_size: opts.upsert_batch_size,
        ..Default::default()
    };
    let mut disabled = project(opts.strategy);
    disabled.id = "archived".into();
    disabled.enabled = false;
    let engine = SyncEngine::new(
        vec![project(opts.strategy), disabled],
        settings,
        deps,
        Arc::new(NoProgress),
    );
    Harness {
        detector,
        vectorizer,
        index,
        checkpoints,
        notifier,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(seeded_detector(), HarnessOptions::default())
}

/// `org/handbook` with two docs and an image, `org/api` with one doc.
fn seeded_detector() -> Arc<FakeDetector> {
    let detector = Arc::new(FakeDetector::default());
    detector.commit(
        "org/handbook",
        &[
            ("README.md", Some("# Handbook\nWelcome to the team.")),
            ("guides/setup.txt", Some("Install the toolchain. Then run the tests.")),
            ("logo.png", Some("not really a png")),
        ],
    );
    detector.commit("org/api", &[("docs/auth.md", Some("Tokens expire after an hour."))]);
    detector
}

fn paths_in_index(h: &Harness) -> HashSet<String> {
    h.checkpoints
        .snapshot()
        .into_iter()
        .filter(|e| e.status == CheckpointStatus::Synced)
        .filter(|e| {
            (0..e.chunk_count).all(|i| h.index.inner.get(NS, &chunk_id(&e.repository, &e.path, i)).is_some())
        })
        .map(|e| format!("{}/{}", e.repository, e.path))
        .collect()
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn first_run_syncs_every_allowed_file() {
    let h = harness();
    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success, "{:?}", result.errors);
    assert!(result.errors.is_empty());
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(result.repositories_scanned, 2);
    assert_eq!(result.files_discovered, 4);
    assert_eq!(result.files_changed, 4);
    assert_eq!(result.files_processed, 3);
    assert_eq!(result.files_synced, 3);
    assert_eq!(result.files_failed, 0);
    assert_eq!(result.vectors_upserted, h.index.inner.len());
    assert_eq!(result.chunks_created, result.vectors_upserted);
    assert!(result.finished_at.is_some());

    let entries = h.checkpoints.snapshot();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.status == CheckpointStatus::Synced));
    assert!(!entries.iter().any(|e| e.path == "logo.png"));
    for e in &entries {
        assert_eq!(e.repo_revision.as_deref(), Some(h.detector.head(&e.repository).as_str()));
    }

    // Both repositories had no marker, so both got a full listing.
    let calls = h.detector.diff_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, since)| since.is_none()));
}

#[tokio::test]
async fn idle_second_run_writes_nothing() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);
    let upserts = h.index.upserts.load(Ordering::SeqCst);
    let vectorize_calls = h.vectorizer.calls.load(Ordering::SeqCst);
    let before = h.checkpoints.snapshot();
    h.detector.clear_calls();

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.files_changed, 0);
    assert_eq!(result.vectors_upserted, 0);
    assert_eq!(result.vectors_deleted, 0);
    assert!(h.detector.diff_calls().is_empty(), "heads unchanged, no diff needed");
    assert_eq!(h.index.upserts.load(Ordering::SeqCst), upserts);
    assert_eq!(h.vectorizer.calls.load(Ordering::SeqCst), vectorize_calls);
    let after = h.checkpoints.snapshot();
    assert_eq!(
        before.iter().map(|e| (&e.path, &e.revision, e.chunk_count)).collect::<Vec<_>>(),
        after.iter().map(|e| (&e.path, &e.revision, e.chunk_count)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn incremental_run_diffs_from_recorded_head() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);
    let old_head = h.detector.head("org/handbook");
    h.detector.commit("org/handbook", &[("README.md", Some("# Handbook\nWelcome aboard."))]);
    h.detector.clear_calls();

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.files_changed, 1);
    assert_eq!(result.files_synced, 1);
    assert_eq!(
        h.detector.diff_calls(),
        vec![("org/handbook".to_string(), Some(old_head))]
    );

    let readme = h
        .checkpoints
        .get("docs", "org/handbook", "README.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(readme.revision, blob_id("# Handbook\nWelcome aboard."));
    // Every entry of the repository now carries the new head.
    for e in h.checkpoints.list("docs", Some("org/handbook")).await.unwrap() {
        assert_eq!(e.repo_revision.as_deref(), Some(h.detector.head("org/handbook").as_str()));
    }
}

#[tokio::test]
async fn chunk_ids_are_stable_across_runs() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);
    let before: HashSet<String> = h.index.inner.ids(NS).into_iter().collect();

    // Same content, new commit: nothing changes, ids stay put.
    h.detector.commit("org/api", &[("docs/auth.md", Some("Tokens expire after an hour."))]);
    assert!(h.engine.run_sync("docs", false).await.success);
    let after: HashSet<String> = h.index.inner.ids(NS).into_iter().collect();
    assert_eq!(before, after);
    assert!(after.contains(&chunk_id("org/api", "docs/auth.md", 0)));
}

#[tokio::test]
async fn vectorizer_failure_is_isolated_to_one_file() {
    let detector = seeded_detector();
    detector.commit("org/api", &[("docs/bad.md", Some("This one is POISON."))]);
    let h = harness_with(detector, HarnessOptions::default());

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success, "file failures are warnings, not run errors");
    assert_eq!(result.files_failed, 1);
    assert_eq!(result.files_synced, 3);
    let file_warnings: Vec<_> = result
        .warnings
        .iter()
        .filter(|w| w.scope == IssueScope::File)
        .collect();
    assert_eq!(file_warnings.len(), 1);
    assert_eq!(file_warnings[0].target.as_deref(), Some("org/api/docs/bad.md"));
    assert_eq!(result.warnings.len(), 1);

    let bad = h
        .checkpoints
        .get("docs", "org/api", "docs/bad.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bad.status, CheckpointStatus::Failed);
    assert_eq!(bad.revision, "");
    assert_eq!(bad.chunk_count, 0);

    // The failing repository keeps no head marker; the clean one advanced.
    let api = h.checkpoints.list("docs", Some("org/api")).await.unwrap();
    assert!(api.iter().all(|e| e.repo_revision.is_none()));
    let handbook = h.checkpoints.list("docs", Some("org/handbook")).await.unwrap();
    assert!(handbook.iter().all(|e| e.repo_revision.is_some()));

    // Fixing the file makes the next incremental run pick it up.
    h.detector.commit("org/api", &[("docs/bad.md", Some("This one is fine."))]);
    let retry = h.engine.run_sync("docs", true).await;
    assert!(retry.success);
    assert_eq!(retry.files_failed, 0);
    let bad = h
        .checkpoints
        .get("docs", "org/api", "docs/bad.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bad.status, CheckpointStatus::Synced);
}

#[tokio::test]
async fn persistent_file_failure_does_not_rewrite_unchanged_files() {
    let detector = seeded_detector();
    detector.commit("org/api", &[("docs/bad.md", Some("This one is POISON."))]);
    let h = harness_with(detector, HarnessOptions::default());
    let first = h.engine.run_sync("docs", true).await;
    assert_eq!(first.files_failed, 1);
    let upserts = h.index.upserts.load(Ordering::SeqCst);
    let vectorize_calls = h.vectorizer.calls.load(Ordering::SeqCst);
    let auth_before = h
        .checkpoints
        .get("docs", "org/api", "docs/auth.md")
        .await
        .unwrap()
        .unwrap();

    // No commit in between: only the failed file is retried.
    let second = h.engine.run_sync("docs", true).await;

    assert!(second.success);
    assert_eq!(second.files_changed, 1);
    assert_eq!(second.files_failed, 1);
    assert_eq!(second.files_synced, 0);
    assert_eq!(second.vectors_upserted, 0);
    assert_eq!(h.index.upserts.load(Ordering::SeqCst), upserts);
    assert_eq!(h.vectorizer.calls.load(Ordering::SeqCst), vectorize_calls + 1);
    let auth_after = h
        .checkpoints
        .get("docs", "org/api", "docs/auth.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(auth_after.last_synced_at, auth_before.last_synced_at);
}

#[tokio::test]
async fn every_file_failing_still_finishes_the_run() {
    let detector = Arc::new(FakeDetector::default());
    detector.commit(
        "org/handbook",
        &[("a.md", Some("POISON one")), ("b.md", Some("POISON two"))],
    );
    let h = harness_with(detector, HarnessOptions::default());

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.files_failed, 2);
    assert_eq!(result.files_synced, 0);
    assert_eq!(result.vectors_upserted, 0);
    assert_eq!(h.index.upserts.load(Ordering::SeqCst), 0);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    assert_eq!(
        h.notifier.sent.lock().unwrap()[0].kind,
        reposync_core::models::NotificationKind::Warning
    );
}

#[tokio::test]
async fn shrinking_file_deletes_trailing_chunks() {
    let detector = Arc::new(FakeDetector::default());
    detector.commit("org/handbook", &[("steps.md", Some("one\ntwo\nthree\nfour\nfive"))]);
    let h = harness_with(
        detector,
        HarnessOptions {
            chunker: Arc::new(LineChunker),
            ..Default::default()
        },
    );
    assert!(h.engine.run_sync("docs", true).await.success);
    assert_eq!(h.index.inner.ids(NS).len(), 5);

    h.detector.commit("org/handbook", &[("steps.md", Some("one\ntwo\nthree"))]);
    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.vectors_upserted, 3);
    assert_eq!(result.vectors_deleted, 2);
    let mut expected: Vec<String> = (0..3).map(|i| chunk_id("org/handbook", "steps.md", i)).collect();
    expected.sort();
    assert_eq!(h.index.inner.ids(NS), expected);
    let entry = h
        .checkpoints
        .get("docs", "org/handbook", "steps.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.chunk_count, 3);
}

#[tokio::test]
async fn failed_stale_delete_keeps_the_larger_chunk_count() {
    let detector = Arc::new(FakeDetector::default());
    detector.commit("org/handbook", &[("steps.md", Some("one\ntwo\nthree\nfour\nfive"))]);
    let h = harness_with(
        detector,
        HarnessOptions {
            chunker: Arc::new(LineChunker),
            ..Default::default()
        },
    );
    assert!(h.engine.run_sync("docs", true).await.success);

    h.index.fail_deletes.store(true, Ordering::SeqCst);
    h.detector.commit("org/handbook", &[("steps.md", Some("one\ntwo\nthree"))]);
    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.vectors_deleted, 0);
    assert!(result.warnings.iter().any(|w| w.scope == IssueScope::Deletion));
    let entry = h
        .checkpoints
        .get("docs", "org/handbook", "steps.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, CheckpointStatus::Synced);
    assert_eq!(entry.chunk_count, 5);
    assert_eq!(h.index.inner.ids(NS).len(), 5);

    // An unchanged file is not revisited; its next edit deletes every
    // ordinal past the new count, stranded ones included.
    h.index.fail_deletes.store(false, Ordering::SeqCst);
    let idle = h.engine.run_sync("docs", true).await;
    assert_eq!(idle.vectors_deleted, 0);
    assert_eq!(h.index.inner.ids(NS).len(), 5);

    h.detector.commit("org/handbook", &[("steps.md", Some("one\ntwo"))]);
    let edit = h.engine.run_sync("docs", true).await;
    assert!(edit.success);
    assert_eq!(edit.vectors_deleted, 3);
    let mut expected: Vec<String> = (0..2).map(|i| chunk_id("org/handbook", "steps.md", i)).collect();
    expected.sort();
    assert_eq!(h.index.inner.ids(NS), expected);
    let entry = h
        .checkpoints
        .get("docs", "org/handbook", "steps.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.chunk_count, 2);
}

#[tokio::test]
async fn batch_write_failure_does_not_advance_checkpoints() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);
    let old_revision = blob_id("Tokens expire after an hour.");

    h.detector.commit("org/api", &[("docs/auth.md", Some("Tokens expire after a day."))]);
    h.index.fail_upserts.store(true, Ordering::SeqCst);
    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.files_failed, 1);
    assert_eq!(result.files_synced, 0);
    assert!(result.warnings.iter().any(|w| w.scope == IssueScope::Batch));
    let entry = h
        .checkpoints
        .get("docs", "org/api", "docs/auth.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, CheckpointStatus::Failed);
    assert_eq!(entry.revision, old_revision);
    assert_ne!(entry.repo_revision.as_deref(), Some(h.detector.head("org/api").as_str()));

    // Index back up: the same change is picked up again.
    h.index.fail_upserts.store(false, Ordering::SeqCst);
    let retry = h.engine.run_sync("docs", true).await;
    assert!(retry.success);
    assert_eq!(retry.files_synced, 1);
    let entry = h
        .checkpoints
        .get("docs", "org/api", "docs/auth.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, CheckpointStatus::Synced);
    assert_eq!(entry.revision, blob_id("Tokens expire after a day."));
}

#[tokio::test]
async fn small_batches_split_on_file_boundaries() {
    let detector = Arc::new(FakeDetector::default());
    let files: Vec<(String, String)> = (0..6)
        .map(|i| (format!("f{}.md", i), "a\nb\nc".to_string()))
        .collect();
    let changes: Vec<(&str, Option<&str>)> = files
        .iter()
        .map(|(p, c)| (p.as_str(), Some(c.as_str())))
        .collect();
    detector.commit("org/handbook", &changes);
    let h = harness_with(
        detector,
        HarnessOptions {
            chunker: Arc::new(LineChunker),
            upsert_batch_size: 4,
            workers: 1,
            ..Default::default()
        },
    );

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.vectors_upserted, 18);
    // With one worker, each batch holds two whole files (6 records).
    assert_eq!(h.index.upserts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn full_and_incremental_runs_converge() {
    let incremental = harness();
    let full = harness_with(seeded_detector(), HarnessOptions::default());

    assert!(incremental.engine.run_sync("docs", true).await.success);
    for d in [&incremental.detector, &full.detector] {
        d.commit(
            "org/handbook",
            &[
                ("README.md", Some("# Handbook\nRewritten intro.")),
                ("guides/setup.txt", None),
                ("guides/deploy.md", Some("Deploy with the pipeline.")),
            ],
        );
        d.commit("org/api", &[("docs/errors.md", Some("Errors are JSON."))]);
    }
    assert!(incremental.engine.run_sync("docs", true).await.success);
    assert!(full.engine.run_sync("docs", false).await.success);

    let ids = |h: &Harness| h.index.inner.ids(NS);
    assert_eq!(ids(&incremental), ids(&full));
    let revisions = |h: &Harness| {
        h.checkpoints
            .snapshot()
            .into_iter()
            .map(|e| (e.repository, e.path, e.revision, e.chunk_count, e.repo_revision))
            .collect::<Vec<_>>()
    };
    assert_eq!(revisions(&incremental), revisions(&full));
    assert_eq!(paths_in_index(&incremental), paths_in_index(&full));
}

#[tokio::test]
async fn removed_files_lose_vectors_and_checkpoints() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);
    let readme_id = chunk_id("org/handbook", "README.md", 0);
    assert!(h.index.inner.get(NS, &readme_id).is_some());

    h.detector.commit("org/handbook", &[("README.md", None), ("logo.png", None)]);
    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.files_deleted, 1);
    assert_eq!(result.vectors_deleted, 1);
    assert!(h.index.inner.get(NS, &readme_id).is_none());
    assert!(h
        .checkpoints
        .get("docs", "org/handbook", "README.md")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn full_run_cleans_up_paths_missing_from_listing() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);

    h.detector.commit("org/api", &[("docs/auth.md", None)]);
    let result = h.engine.run_sync("docs", false).await;

    assert!(result.success);
    assert_eq!(result.files_deleted, 1);
    assert!(h
        .checkpoints
        .get("docs", "org/api", "docs/auth.md")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn incomplete_marker_diff_falls_back_to_full_listing() {
    let h = harness();
    assert!(h.engine.run_sync("docs", true).await.success);
    let old_head = h.detector.head("org/handbook");
    h.detector.commit(
        "org/handbook",
        &[("README.md", None), ("guides/setup.txt", Some("Install it. Run it."))],
    );
    h.detector.incomplete_diffs.store(true, Ordering::SeqCst);
    h.detector.clear_calls();

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success, "{:?}", result.errors);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(
        h.detector.diff_calls(),
        vec![
            ("org/handbook".to_string(), Some(old_head)),
            ("org/handbook".to_string(), None),
        ]
    );
    // The relisting still notices the removal and the edit.
    assert_eq!(result.files_deleted, 1);
    assert_eq!(result.files_synced, 1);
    assert!(h
        .checkpoints
        .get("docs", "org/handbook", "README.md")
        .await
        .unwrap()
        .is_none());
    assert!(h
        .index
        .inner
        .get(NS, &chunk_id("org/handbook", "README.md", 0))
        .is_none());
    for e in h.checkpoints.list("docs", Some("org/handbook")).await.unwrap() {
        assert_eq!(e.repo_revision.as_deref(), Some(h.detector.head("org/handbook").as_str()));
    }
}

#[tokio::test]
async fn per_file_strategy_compares_each_revision() {
    let h = harness_with(
        seeded_detector(),
        HarnessOptions {
            strategy: DiffStrategy::PerFile,
            ..Default::default()
        },
    );
    assert!(h.engine.run_sync("docs", true).await.success);
    h.detector.commit("org/api", &[("docs/auth.md", Some("Tokens never expire."))]);
    h.detector.clear_calls();

    let result = h.engine.run_sync("docs", true).await;

    // Skipped files carry no checkpoint, so only the edited doc is processed.
    assert!(result.success);
    assert_eq!(result.files_processed, 1);
    assert_eq!(result.files_synced, 1);
    let calls = h.detector.diff_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, since)| since.is_none()));
}

#[tokio::test]
async fn failing_repository_diff_is_skipped_with_a_warning() {
    let h = harness();
    h.detector
        .failing_diffs
        .lock()
        .unwrap()
        .insert("org/api".to_string());

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(result.files_synced, 2);
    let repo_warnings: Vec<_> = result
        .warnings
        .iter()
        .filter(|w| w.scope == IssueScope::Repository)
        .collect();
    assert_eq!(repo_warnings.len(), 1);
    assert_eq!(repo_warnings[0].target.as_deref(), Some("org/api"));
}

#[tokio::test]
async fn discovery_failure_is_fatal() {
    let h = harness();
    h.detector.fail_listing.store(true, Ordering::SeqCst);

    let result = h.engine.run_sync("docs", true).await;

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].scope, IssueScope::Run);
    assert!(result.errors[0].message.contains("discovery"));
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_and_disabled_projects_fail_fast() {
    let h = harness();

    let missing = h.engine.run_sync("nope", true).await;
    assert!(!missing.success);
    assert!(missing.errors[0].message.contains("not configured"));

    let disabled = h.engine.run_sync("archived", true).await;
    assert!(!disabled.success);
    assert!(disabled.errors[0].message.contains("disabled"));

    assert!(h.detector.diff_calls().is_empty());
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn run_all_skips_disabled_projects() {
    let h = harness();
    let results = h.engine.run_all(true).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].project_id, "docs");
    assert!(results[0].success);
}

#[tokio::test]
async fn notifier_failure_is_a_warning() {
    let h = harness();
    h.notifier.fail.store(true, Ordering::SeqCst);

    let result = h.engine.run_sync("docs", true).await;

    assert!(result.success);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.scope == IssueScope::Notification));
}

#[tokio::test]
async fn canceled_run_reports_and_notifies_once() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h
        .engine
        .run_sync_with(
            "docs",
            true,
            RunOptions {
                cancel: Some(cancel),
                timeout: None,
            },
        )
        .await;

    assert!(!result.success);
    assert!(result.canceled);
    assert!(result.errors[0].message.contains("canceled"));
    assert_eq!(h.index.upserts.load(Ordering::SeqCst), 0);
    assert!(h.checkpoints.is_empty());
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn deadline_cancels_slow_runs_without_advancing_heads() {
    let detector = seeded_detector();
    let h = harness_with(
        detector,
        HarnessOptions {
            vectorizer: FlakyVectorizer {
                delay: Some(Duration::from_millis(300)),
                ..FlakyVectorizer::new()
            },
            workers: 1,
            ..Default::default()
        },
    );

    let result = h
        .engine
        .run_sync_with(
            "docs",
            true,
            RunOptions {
                cancel: None,
                timeout: Some(Duration::from_millis(100)),
            },
        )
        .await;

    assert!(!result.success);
    assert!(result.canceled);
    assert!(result.errors[0].message.contains("deadline"));
    // The file in flight finished; the rest never started.
    assert_eq!(result.files_processed, 1);
    for e in h.checkpoints.snapshot() {
        assert!(e.repo_revision.is_none());
    }
}

#[tokio::test]
async fn concurrent_run_for_same_project_fails_fast() {
    let inner = seeded_detector();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate = Arc::new(GateDetector {
        inner,
        entered: entered.clone(),
        release: release.clone(),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let deps = SyncDeps {
        detector: gate,
        chunker: Arc::new(TextChunker),
        vectorizer: Arc::new(HashVectorizer::new(8)),
        index: Arc::new(MemoryIndex::new()),
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
        notifier: notifier.clone(),
    };
    let engine = Arc::new(SyncEngine::new(
        vec![project(DiffStrategy::Repository)],
        EngineSettings::default(),
        deps,
        Arc::new(NoProgress),
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_sync("docs", true).await })
    };
    entered.notified().await;

    let second = engine.run_sync("docs", true).await;
    assert!(!second.success);
    assert!(second.errors[0].message.contains("already running"));

    release.notify_one();
    let first = first.await.unwrap();
    assert!(first.success, "{:?}", first.errors);
    assert_eq!(notifier.sent.lock().unwrap().len(), 2);
}
