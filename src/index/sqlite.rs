//! Local vector index in the `vectors` table.
//!
//! Vectors are stored as little-endian `f32` BLOBs and searched by
//! brute-force cosine similarity in Rust, which is plenty for the tens of
//! thousands of chunks a documentation project produces.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use reposync_core::models::VectorRecord;
use reposync_core::traits::IndexWriter;
use reposync_core::vector::{blob_to_vec, cosine_similarity, vec_to_blob};
use sqlx::{Row, SqlitePool};

use super::{SearchHit, VectorSearch};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexWriter for SqliteIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if let Some(first) = records.first() {
            if records.iter().any(|r| r.namespace != first.namespace) {
                bail!("upsert batch spans more than one namespace");
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let chunk = &record.chunk;
            sqlx::query(
                r#"
                INSERT INTO vectors (namespace, id, repository, path, ordinal, total, revision,
                                     extension, text, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    repository = excluded.repository,
                    path = excluded.path,
                    ordinal = excluded.ordinal,
                    total = excluded.total,
                    revision = excluded.revision,
                    extension = excluded.extension,
                    text = excluded.text,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.namespace)
            .bind(&chunk.id)
            .bind(&chunk.metadata.repository)
            .bind(&chunk.metadata.path)
            .bind(chunk.ordinal as i64)
            .bind(chunk.total as i64)
            .bind(&chunk.metadata.revision)
            .bind(&chunk.metadata.extension)
            .bind(&chunk.text)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(records.len())
    }

    async fn delete(&self, ids: &[String], namespace: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM vectors WHERE namespace = ? AND id = ?")
                .bind(namespace)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl VectorSearch for SqliteIndex {
    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            "SELECT id, repository, path, ordinal, text, embedding FROM vectors WHERE namespace = ?",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let ordinal: i64 = row.get("ordinal");
                SearchHit {
                    id: row.get("id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                    repository: row.get("repository"),
                    path: row.get("path"),
                    ordinal: ordinal.max(0) as usize,
                    text: row.get("text"),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, namespace: &str) -> Result<Option<usize>> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(count.max(0) as usize))
    }
}
