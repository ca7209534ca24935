//! Pinecone data-plane adapter.
//!
//! Talks to the index host directly (`https://<index>-<project>.svc.<env>.pinecone.io`)
//! with the key from `PINECONE_API_KEY`. Chunk text and metadata travel as
//! Pinecone metadata so queries can return snippets without a second store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reposync_core::models::VectorRecord;
use reposync_core::traits::IndexWriter;
use serde::Deserialize;

use super::{SearchHit, VectorSearch};
use crate::config::IndexConfig;
use crate::http::{self, send_with_retry};

/// Pinecone accepts at most this many vectors per upsert request.
const UPSERT_LIMIT: usize = 100;
/// And at most this many ids per delete request.
const DELETE_LIMIT: usize = 1000;
const API_VERSION: &str = "2024-07";

pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    #[serde(rename = "upsertedCount", default)]
    upserted_count: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    namespaces: std::collections::HashMap<String, NamespaceStats>,
}

#[derive(Debug, Deserialize)]
struct NamespaceStats {
    #[serde(rename = "vectorCount", default)]
    vector_count: usize,
}

impl PineconeIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY not set"))?;
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("index.host required for pinecone"))?;
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            host,
            api_key,
            max_retries: config.max_retries,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.host, path);
        send_with_retry("Pinecone", self.max_retries, || {
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", API_VERSION)
                .json(body)
        })
        .await
    }
}

fn to_pinecone_vector(record: &VectorRecord) -> serde_json::Value {
    let chunk = &record.chunk;
    let mut metadata = serde_json::json!({
        "repository": chunk.metadata.repository,
        "path": chunk.metadata.path,
        "revision": chunk.metadata.revision,
        "extension": chunk.metadata.extension,
        "ordinal": chunk.ordinal,
        "total": chunk.total,
        "text": chunk.text,
    });
    if let Some(modified) = chunk.metadata.last_modified {
        metadata["last_modified"] = serde_json::json!(modified.to_rfc3339());
    }
    serde_json::json!({
        "id": chunk.id,
        "values": record.vector,
        "metadata": metadata,
    })
}

fn hit_from_match(m: QueryMatch) -> SearchHit {
    let field = |name: &str| {
        m.metadata
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    SearchHit {
        repository: field("repository"),
        path: field("path"),
        text: field("text"),
        ordinal: m
            .metadata
            .get("ordinal")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize,
        score: m.score,
        id: m.id,
    }
}

#[async_trait]
impl IndexWriter for PineconeIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        let Some(first) = records.first() else {
            return Ok(0);
        };
        if records.iter().any(|r| r.namespace != first.namespace) {
            anyhow::bail!("upsert batch spans more than one namespace");
        }

        let mut written = 0;
        for part in records.chunks(UPSERT_LIMIT) {
            let body = serde_json::json!({
                "vectors": part.iter().map(to_pinecone_vector).collect::<Vec<_>>(),
                "namespace": first.namespace,
            });
            let response: UpsertResponse = self
                .post("/vectors/upsert", &body)
                .await?
                .json()
                .await
                .context("invalid Pinecone upsert response")?;
            written += response.upserted_count;
        }
        Ok(written)
    }

    async fn delete(&self, ids: &[String], namespace: &str) -> Result<()> {
        for part in ids.chunks(DELETE_LIMIT) {
            let body = serde_json::json!({ "ids": part, "namespace": namespace });
            self.post("/vectors/delete", &body).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorSearch for PineconeIndex {
    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let body = serde_json::json!({
            "vector": vector,
            "topK": limit,
            "namespace": namespace,
            "includeMetadata": true,
        });
        let response: QueryResponse = self
            .post("/query", &body)
            .await?
            .json()
            .await
            .context("invalid Pinecone query response")?;
        Ok(response.matches.into_iter().map(hit_from_match).collect())
    }

    async fn count(&self, namespace: &str) -> Result<Option<usize>> {
        let response: StatsResponse = self
            .post("/describe_index_stats", &serde_json::json!({}))
            .await?
            .json()
            .await
            .context("invalid Pinecone stats response")?;
        Ok(Some(
            response
                .namespaces
                .get(namespace)
                .map(|s| s.vector_count)
                .unwrap_or(0),
        ))
    }
}
