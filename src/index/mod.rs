//! Vector index adapters.
//!
//! | Provider | Storage | Search |
//! |----------|---------|--------|
//! | `sqlite` | `vectors` table in the local database | brute-force cosine |
//! | `pinecone` | Pinecone serverless index over HTTPS | Pinecone `/query` |
//! | `memory` | process memory, gone on exit | brute-force cosine |
//!
//! The engine only writes through [`IndexWriter`]; the `query` and `status`
//! commands read through [`VectorSearch`]. [`create_index`] hands out both
//! views of the same adapter.

mod pinecone;
mod sqlite;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reposync_core::memory::MemoryIndex;
use reposync_core::traits::IndexWriter;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::IndexConfig;

pub use pinecone::PineconeIndex;
pub use sqlite::SqliteIndex;

/// One nearest-neighbour match.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub repository: String,
    pub path: String,
    pub ordinal: usize,
    pub text: String,
}

/// Read side of a vector index.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// The `limit` records in `namespace` closest to `vector`, best first.
    async fn search(&self, namespace: &str, vector: &[f32], limit: usize)
        -> Result<Vec<SearchHit>>;

    /// Number of records in `namespace`, when the backend can tell.
    async fn count(&self, namespace: &str) -> Result<Option<usize>>;
}

/// Write and read handles onto one index adapter.
#[derive(Clone)]
pub struct IndexHandle {
    pub writer: Arc<dyn IndexWriter>,
    pub search: Arc<dyn VectorSearch>,
}

impl IndexHandle {
    fn from_adapter<T: IndexWriter + VectorSearch + 'static>(adapter: T) -> Self {
        let adapter = Arc::new(adapter);
        Self {
            writer: adapter.clone(),
            search: adapter,
        }
    }
}

pub fn create_index(config: &IndexConfig, pool: &SqlitePool) -> Result<IndexHandle> {
    match config.provider.as_str() {
        "sqlite" => Ok(IndexHandle::from_adapter(SqliteIndex::new(pool.clone()))),
        "pinecone" => Ok(IndexHandle::from_adapter(PineconeIndex::new(config)?)),
        "memory" => Ok(IndexHandle::from_adapter(MemoryIndex::new())),
        other => bail!("Unknown index provider: {}", other),
    }
}

#[async_trait]
impl VectorSearch for MemoryIndex {
    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        Ok(self
            .query(namespace, vector, limit)
            .into_iter()
            .map(|hit| SearchHit {
                id: hit.record.chunk.id.clone(),
                score: hit.score,
                repository: hit.record.chunk.metadata.repository.clone(),
                path: hit.record.chunk.metadata.path.clone(),
                ordinal: hit.record.chunk.ordinal,
                text: hit.record.chunk.text,
            })
            .collect())
    }

    async fn count(&self, namespace: &str) -> Result<Option<usize>> {
        Ok(Some(self.ids(namespace).len()))
    }
}
