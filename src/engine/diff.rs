//! Incremental diff planning.
//!
//! Turns a repository plus its checkpoints into the normalized list of
//! change records for this run. Both strategies produce the same
//! [`ChangeRecord`] shape, so the processing phase never knows which one
//! ran.
//!
//! - [`DiffStrategy::Repository`]: the prior marker is the repository head
//!   recorded on the checkpoints. One detector call returns every path
//!   changed since then.
//! - [`DiffStrategy::PerFile`]: the detector lists every file and each
//!   file's revision is compared with its own checkpoint.
//!
//! Incremental runs under either strategy drop records whose checkpoint is
//! already synced at the same revision, so a repository whose head is held
//! back by one failing file does not re-embed its unchanged files.
//!
//! Whenever the detector returned a full listing, checkpointed paths that
//! are missing from it come back as synthesized removals. A detector that
//! cannot list everything since the marker answers with [`IncompleteDiff`]
//! and the repository is relisted in full.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use reposync_core::models::{
    ChangeKind, ChangeRecord, CheckpointEntry, CheckpointStatus, DiffStrategy, Project, Repository,
};
use reposync_core::traits::{ChangeDetector, CheckpointStore, IncompleteDiff};

/// The diff outcome for one repository.
#[derive(Debug)]
pub(crate) struct RepoPlan {
    pub repository: Repository,
    /// Marker the detector diffed from; `None` for a full listing.
    pub since: Option<String>,
    /// Records returned by the detector.
    pub discovered: usize,
    /// Normalized changes for this run.
    pub records: Vec<ChangeRecord>,
    /// Existing checkpoints by path.
    pub entries: HashMap<String, CheckpointEntry>,
}

/// Repository head recorded on a repository's checkpoints.
///
/// `None` (forcing a full listing) when there are no checkpoints, when any
/// checkpoint lacks a head, or when they disagree.
pub(crate) fn repository_marker(entries: &[CheckpointEntry]) -> Option<String> {
    let first = entries.first()?.repo_revision.clone()?;
    if entries
        .iter()
        .all(|e| e.repo_revision.as_deref() == Some(first.as_str()))
    {
        Some(first)
    } else {
        None
    }
}

pub(crate) async fn plan_repository(
    detector: &dyn ChangeDetector,
    checkpoints: &dyn CheckpointStore,
    project: &Project,
    repository: &Repository,
    incremental: bool,
) -> Result<RepoPlan> {
    let existing = checkpoints.list(&project.id, Some(&repository.id)).await?;

    let since = match (incremental, project.diff_strategy) {
        (true, DiffStrategy::Repository) => repository_marker(&existing),
        _ => None,
    };
    let entries: HashMap<String, CheckpointEntry> = existing
        .into_iter()
        .map(|e| (e.path.clone(), e))
        .collect();

    if let (Some(marker), Some(head)) = (&since, &repository.head) {
        if marker == head {
            tracing::debug!(repository = %repository.id, "head unchanged since {}", marker);
            return Ok(RepoPlan {
                repository: repository.clone(),
                since,
                discovered: 0,
                records: Vec::new(),
                entries,
            });
        }
    }

    let attempt = detector.diff(repository, since.as_deref()).await;
    let (since, listed) = match attempt {
        Ok(listed) => (since, listed),
        Err(e) if since.is_some() && IncompleteDiff::is(&e) => {
            tracing::warn!(repository = %repository.id, "{:#}, listing every file", e);
            (None, detector.diff(repository, None).await?)
        }
        Err(e) => return Err(e),
    };
    let discovered = listed.len();
    let full_listing = since.is_none();

    let records = normalize(&repository.id, listed, &entries, full_listing, incremental);

    Ok(RepoPlan {
        repository: repository.clone(),
        since,
        discovered,
        records,
        entries,
    })
}

/// Deduplicate by path, classify against checkpoints, and synthesize
/// removals for a full listing.
pub(crate) fn normalize(
    repository: &str,
    listed: Vec<ChangeRecord>,
    entries: &HashMap<String, CheckpointEntry>,
    full_listing: bool,
    compare_revisions: bool,
) -> Vec<ChangeRecord> {
    // Last record per path wins, except that a removal never replaces content.
    let mut order: Vec<String> = Vec::new();
    let mut by_path: HashMap<String, ChangeRecord> = HashMap::new();
    for mut record in listed {
        record.repository = repository.to_string();
        match by_path.get(&record.path) {
            None => {
                order.push(record.path.clone());
                by_path.insert(record.path.clone(), record);
            }
            Some(prev) if record.kind == ChangeKind::Removed && prev.kind != ChangeKind::Removed => {}
            Some(_) => {
                by_path.insert(record.path.clone(), record);
            }
        }
    }

    let listed_paths: HashSet<String> = order.iter().cloned().collect();
    let mut records = Vec::with_capacity(order.len());
    for path in order {
        let Some(mut record) = by_path.remove(&path) else {
            continue;
        };
        if record.kind != ChangeKind::Removed {
            match entries.get(&path) {
                None => record.kind = ChangeKind::Added,
                Some(entry) => {
                    if compare_revisions
                        && entry.status == CheckpointStatus::Synced
                        && entry.revision == record.revision
                    {
                        continue;
                    }
                    record.kind = ChangeKind::Modified;
                }
            }
        }
        records.push(record);
    }

    if full_listing {
        let mut missing: Vec<&CheckpointEntry> = entries
            .values()
            .filter(|e| !listed_paths.contains(&e.path))
            .collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        for entry in missing {
            records.push(ChangeRecord {
                repository: repository.to_string(),
                path: entry.path.clone(),
                kind: ChangeKind::Removed,
                content: None,
                revision: entry.revision.clone(),
                last_modified: None,
                size: 0,
            });
        }
    }

    records
}
