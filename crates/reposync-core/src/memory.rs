//! In-memory [`CheckpointStore`] and [`IndexWriter`] implementations.
//!
//! Both keep their data behind `std::sync::RwLock`; no lock is held across
//! an await point. Used by tests and for dry runs that should not touch a
//! real index.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{CheckpointEntry, VectorRecord};
use crate::traits::{CheckpointStore, IndexWriter};
use crate::vector::cosine_similarity;

type Key = (String, String, String);

fn key(project_id: &str, repository: &str, path: &str) -> Key {
    (
        project_id.to_string(),
        repository.to_string(),
        path.to_string(),
    )
}

/// Checkpoints in a sorted map keyed by `(project, repository, path)`.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<BTreeMap<Key, CheckpointEntry>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, in key order.
    pub fn snapshot(&self) -> Vec<CheckpointEntry> {
        self.entries.read().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(
        &self,
        project_id: &str,
        repository: &str,
        path: &str,
    ) -> Result<Option<CheckpointEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries.get(&key(project_id, repository, path)).cloned())
    }

    async fn list(
        &self,
        project_id: &str,
        repository: Option<&str>,
    ) -> Result<Vec<CheckpointEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .values()
            .filter(|e| e.project_id == project_id)
            .filter(|e| repository.map_or(true, |r| e.repository == r))
            .cloned()
            .collect())
    }

    async fn save(&self, entry: &CheckpointEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key(&entry.project_id, &entry.repository, &entry.path),
            entry.clone(),
        );
        Ok(())
    }

    async fn delete(&self, project_id: &str, repository: &str, path: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.remove(&key(project_id, repository, path));
        Ok(())
    }
}

/// A scored hit from [`MemoryIndex::query`].
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub score: f32,
    pub record: VectorRecord,
}

/// Vector records keyed by `(namespace, chunk id)`.
#[derive(Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<(String, String), VectorRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, namespace: &str, id: &str) -> Option<VectorRecord> {
        self.records
            .read()
            .unwrap()
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    /// Sorted chunk ids stored in `namespace`.
    pub fn ids(&self, namespace: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .read()
            .unwrap()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Brute-force cosine search within one namespace.
    pub fn query(&self, namespace: &str, vector: &[f32], limit: usize) -> Vec<MemoryHit> {
        let records = self.records.read().unwrap();
        let mut hits: Vec<MemoryHit> = records
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, id), r)| MemoryHit {
                id: id.clone(),
                score: cosine_similarity(vector, &r.vector),
                record: r.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }
}

#[async_trait]
impl IndexWriter for MemoryIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if let Some(first) = records.first() {
            if records.iter().any(|r| r.namespace != first.namespace) {
                bail!("upsert batch mixes namespaces");
            }
        }
        let mut stored = self.records.write().unwrap();
        for r in records {
            stored.insert((r.namespace.clone(), r.chunk.id.clone()), r.clone());
        }
        Ok(records.len())
    }

    async fn delete(&self, ids: &[String], namespace: &str) -> Result<()> {
        let mut stored = self.records.write().unwrap();
        for id in ids {
            stored.remove(&(namespace.to_string(), id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{CheckpointStatus, Chunk, ChunkMetadata};

    fn entry(repo: &str, path: &str, rev: &str) -> CheckpointEntry {
        CheckpointEntry {
            project_id: "p".into(),
            repository: repo.into(),
            path: path.into(),
            revision: rev.into(),
            repo_revision: None,
            chunk_count: 2,
            status: CheckpointStatus::Synced,
            last_synced_at: Utc::now(),
        }
    }

    fn record(ns: &str, id: &str, v: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk: Chunk {
                id: id.into(),
                ordinal: 0,
                total: 1,
                text: "t".into(),
                metadata: ChunkMetadata {
                    repository: "r".into(),
                    path: "a.md".into(),
                    revision: "1".into(),
                    extension: ".md".into(),
                    last_modified: None,
                },
            },
            vector: v,
            namespace: ns.into(),
        }
    }

    #[tokio::test]
    async fn checkpoint_crud() {
        let store = MemoryCheckpointStore::new();
        assert!(store.get("p", "r", "a.md").await.unwrap().is_none());
        store.save(&entry("r", "a.md", "1")).await.unwrap();
        store.save(&entry("r", "a.md", "2")).await.unwrap();
        store.save(&entry("s", "b.md", "1")).await.unwrap();
        assert_eq!(store.len(), 2);
        let got = store.get("p", "r", "a.md").await.unwrap().unwrap();
        assert_eq!(got.revision, "2");
        assert_eq!(store.list("p", Some("r")).await.unwrap().len(), 1);
        assert_eq!(store.list("p", None).await.unwrap().len(), 2);
        assert!(store.list("other", None).await.unwrap().is_empty());
        store.delete("p", "r", "a.md").await.unwrap();
        store.delete("p", "r", "missing.md").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn set_repo_revision_only_touches_stale_entries() {
        let store = MemoryCheckpointStore::new();
        store.save(&entry("r", "a.md", "1")).await.unwrap();
        let mut b = entry("r", "b.md", "1");
        b.repo_revision = Some("head2".into());
        store.save(&b).await.unwrap();
        store.save(&entry("s", "c.md", "1")).await.unwrap();

        assert_eq!(store.set_repo_revision("p", "r", "head2").await.unwrap(), 1);
        assert_eq!(store.set_repo_revision("p", "r", "head2").await.unwrap(), 0);
        let s = store.get("p", "s", "c.md").await.unwrap().unwrap();
        assert!(s.repo_revision.is_none());
    }

    #[tokio::test]
    async fn index_upsert_delete_and_query() {
        let index = MemoryIndex::new();
        let n = index
            .upsert(&[
                record("ns", "a", vec![1.0, 0.0]),
                record("ns", "b", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(n, 2);
        index.upsert(&[record("other", "a", vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.ids("ns"), vec!["a".to_string(), "b".to_string()]);

        let hits = index.query("ns", &[0.9, 0.1], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        index
            .delete(&["a".into(), "missing".into()], "ns")
            .await
            .unwrap();
        assert_eq!(index.ids("ns"), vec!["b".to_string()]);
        assert!(index.get("other", "a").is_some());
    }

    #[tokio::test]
    async fn index_rejects_mixed_namespaces() {
        let index = MemoryIndex::new();
        let err = index
            .upsert(&[record("a", "1", vec![1.0]), record("b", "2", vec![1.0])])
            .await;
        assert!(err.is_err());
        assert!(index.is_empty());
    }
}
