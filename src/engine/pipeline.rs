//! Bounded-concurrency chunk → vectorize → write pipeline.
//!
//! `W` workers pull change records from a shared queue. Each worker chunks
//! and vectorizes one whole file, then hands the file's vector records to
//! a single accumulator. When the accumulator reaches the upsert threshold
//! it is drained under its lock, the lock is released, and the draining
//! worker performs the index write and checkpoint updates for that batch.
//!
//! A file's records never straddle two batches, so a batch write failure
//! maps cleanly onto the set of files whose checkpoints must not advance.
//!
//! Locks guard only in-memory state and are never held across a
//! collaborator call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use reposync_core::chunk::{chunk_ids_for, ChunkParams};
use reposync_core::models::{
    ChangeRecord, CheckpointEntry, CheckpointStatus, IssueScope, VectorRecord,
};

use super::state::RunStats;
use super::SyncDeps;
use crate::progress::{SyncProgressEvent, SyncReporter};

/// One file queued for processing.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub record: ChangeRecord,
    /// Checkpoint from before this run, if any.
    pub prior: Option<CheckpointEntry>,
    /// Repository head marker written on this file's checkpoint.
    pub repo_revision: Option<String>,
}

impl WorkItem {
    fn target(&self) -> String {
        format!("{}/{}", self.record.repository, self.record.path)
    }
}

/// A file that chunked and vectorized successfully and awaits its write.
struct ReadyFile {
    item: WorkItem,
    records: Vec<VectorRecord>,
}

#[derive(Default)]
struct Accumulator {
    files: Vec<ReadyFile>,
    records: usize,
}

impl Accumulator {
    /// Add a file; returns the drained batch once `threshold` is reached.
    fn push(&mut self, file: ReadyFile, threshold: usize) -> Option<Vec<ReadyFile>> {
        self.records += file.records.len();
        self.files.push(file);
        if self.records >= threshold {
            Some(self.drain())
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<ReadyFile> {
        self.records = 0;
        std::mem::take(&mut self.files)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineSettings {
    pub workers: usize,
    pub chunk_params: ChunkParams,
    pub embedding_batch_size: usize,
    pub upsert_batch_size: usize,
}

pub(crate) struct Pipeline {
    deps: SyncDeps,
    project_id: String,
    namespace: String,
    settings: PipelineSettings,
    queue: Mutex<VecDeque<WorkItem>>,
    accumulator: Mutex<Accumulator>,
    stats: Mutex<RunStats>,
    done: AtomicU64,
    total: u64,
    cancel: CancellationToken,
    reporter: Arc<dyn SyncReporter>,
}

impl Pipeline {
    pub fn new(
        deps: SyncDeps,
        project_id: &str,
        namespace: &str,
        settings: PipelineSettings,
        work: Vec<WorkItem>,
        cancel: CancellationToken,
        reporter: Arc<dyn SyncReporter>,
    ) -> Arc<Self> {
        let total = work.len() as u64;
        Arc::new(Self {
            deps,
            project_id: project_id.to_string(),
            namespace: namespace.to_string(),
            settings,
            queue: Mutex::new(work.into()),
            accumulator: Mutex::new(Accumulator::default()),
            stats: Mutex::new(RunStats::default()),
            done: AtomicU64::new(0),
            total,
            cancel,
            reporter,
        })
    }

    /// Run the workers to completion. Returns only after every worker has
    /// exited, so stats read afterwards are final for this phase.
    pub async fn process(self: &Arc<Self>) {
        let workers = self.settings.workers.max(1).min(self.total.max(1) as usize);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let pipeline = Arc::clone(self);
            set.spawn(async move { pipeline.worker(worker).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                let mut stats = self.stats.lock().await;
                stats.warn(IssueScope::Run, None, format!("worker task failed: {}", e));
            }
        }
    }

    /// Write whatever is left in the accumulator.
    pub async fn flush(&self) {
        let batch = self.accumulator.lock().await.drain();
        if !batch.is_empty() {
            self.write_batch(batch).await;
        }
    }

    pub async fn take_stats(&self) -> RunStats {
        std::mem::take(&mut *self.stats.lock().await)
    }

    async fn worker(&self, worker: usize) {
        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(worker, "cancellation observed, stopping");
                break;
            }
            let next = self.queue.lock().await.pop_front();
            let Some(item) = next else {
                break;
            };

            if let Some(file) = self.prepare(item).await {
                let batch = self
                    .accumulator
                    .lock()
                    .await
                    .push(file, self.settings.upsert_batch_size);
                if let Some(batch) = batch {
                    self.write_batch(batch).await;
                }
            }

            let n = self.done.fetch_add(1, Ordering::Relaxed) + 1;
            self.reporter.report(SyncProgressEvent::Processing {
                project: self.project_id.clone(),
                n,
                total: self.total,
            });
        }
    }

    /// Chunk and vectorize one file. `None` means the file failed and its
    /// checkpoint has already been marked.
    async fn prepare(&self, item: WorkItem) -> Option<ReadyFile> {
        self.stats.lock().await.files_processed += 1;

        let chunks = match self
            .deps
            .chunker
            .chunk(&item.record, &self.settings.chunk_params)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail_file(&item, format!("chunking failed: {:#}", e))
                    .await;
                return None;
            }
        };
        self.stats.lock().await.chunks_created += chunks.len();

        if chunks.is_empty() {
            tracing::debug!(file = %item.target(), "no chunks produced");
            return Some(ReadyFile {
                item,
                records: Vec::new(),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.vectorize(&texts).await {
            Ok(v) => v,
            Err(e) => {
                self.fail_file(&item, format!("vectorization failed: {:#}", e))
                    .await;
                return None;
            }
        };
        self.stats.lock().await.embeddings_generated += vectors.len();

        let records = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                chunk,
                vector,
                namespace: self.namespace.clone(),
            })
            .collect();
        Some(ReadyFile { item, records })
    }

    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let dims = self.deps.vectorizer.dims();
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.settings.embedding_batch_size.max(1)) {
            let vectors = self.deps.vectorizer.vectorize(batch).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "vectorizer returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            if dims > 0 {
                if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                    bail!(
                        "vectorizer returned a {}-dimensional vector, expected {}",
                        bad.len(),
                        dims
                    );
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn fail_file(&self, item: &WorkItem, message: String) {
        {
            let mut stats = self.stats.lock().await;
            stats.files_failed += 1;
            stats.fail_repo(&item.record.repository);
            stats.warn(IssueScope::File, Some(item.target()), message);
        }
        self.save_failed(item).await;
    }

    /// Record the failure without advancing the revision or chunk count.
    async fn save_failed(&self, item: &WorkItem) {
        let entry = match &item.prior {
            Some(prior) => CheckpointEntry {
                status: CheckpointStatus::Failed,
                last_synced_at: Utc::now(),
                ..prior.clone()
            },
            None => CheckpointEntry {
                project_id: self.project_id.clone(),
                repository: item.record.repository.clone(),
                path: item.record.path.clone(),
                revision: String::new(),
                repo_revision: item.repo_revision.clone(),
                chunk_count: 0,
                status: CheckpointStatus::Failed,
                last_synced_at: Utc::now(),
            },
        };
        if let Err(e) = self.deps.checkpoints.save(&entry).await {
            let mut stats = self.stats.lock().await;
            stats.warn(
                IssueScope::Batch,
                Some(item.target()),
                format!("failed to record failure checkpoint: {:#}", e),
            );
        }
    }

    async fn write_batch(&self, batch: Vec<ReadyFile>) {
        let mut files = Vec::with_capacity(batch.len());
        let mut records = Vec::new();
        for file in batch {
            files.push((file.item, file.records.len()));
            records.extend(file.records);
        }

        if !records.is_empty() {
            match self.deps.index.upsert(&records).await {
                Ok(written) => {
                    tracing::debug!(files = files.len(), vectors = written, "batch written");
                    self.stats.lock().await.vectors_upserted += written;
                }
                Err(e) => {
                    {
                        let mut stats = self.stats.lock().await;
                        stats.files_failed += files.len();
                        for (item, _) in &files {
                            stats.fail_repo(&item.record.repository);
                        }
                        let paths: Vec<String> = files.iter().map(|(i, _)| i.target()).collect();
                        stats.warn(
                            IssueScope::Batch,
                            None,
                            format!(
                                "index write failed for {} file(s) [{}]: {:#}",
                                files.len(),
                                paths.join(", "),
                                e
                            ),
                        );
                    }
                    for (item, _) in &files {
                        self.save_failed(item).await;
                    }
                    return;
                }
            }
        }

        for (item, count) in files {
            self.commit_file(&item, count).await;
        }
    }

    /// Remove stale trailing chunks and advance the checkpoint of a file
    /// whose vectors were written.
    async fn commit_file(&self, item: &WorkItem, new_count: usize) {
        let record = &item.record;
        let prior_count = item.prior.as_ref().map_or(0, |p| p.chunk_count);
        let mut chunk_count = new_count;

        if prior_count > new_count {
            let stale = chunk_ids_for(&record.repository, &record.path, new_count..prior_count);
            match self.deps.index.delete(&stale, &self.namespace).await {
                Ok(()) => self.stats.lock().await.vectors_deleted += stale.len(),
                Err(e) => {
                    // Keep the larger count so the file's next change or removal
                    // covers the stranded ids.
                    chunk_count = prior_count;
                    self.stats.lock().await.warn(
                        IssueScope::Deletion,
                        Some(item.target()),
                        format!("failed to delete {} stale chunk(s): {:#}", stale.len(), e),
                    );
                }
            }
        }

        let entry = CheckpointEntry {
            project_id: self.project_id.clone(),
            repository: record.repository.clone(),
            path: record.path.clone(),
            revision: record.revision.clone(),
            repo_revision: item.repo_revision.clone(),
            chunk_count,
            status: CheckpointStatus::Synced,
            last_synced_at: Utc::now(),
        };
        match self.deps.checkpoints.save(&entry).await {
            Ok(()) => self.stats.lock().await.files_synced += 1,
            Err(e) => {
                let mut stats = self.stats.lock().await;
                stats.fail_repo(&record.repository);
                stats.warn(
                    IssueScope::Batch,
                    Some(item.target()),
                    format!("vectors written but checkpoint save failed: {:#}", e),
                );
            }
        }
    }
}
