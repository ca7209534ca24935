//! Vectorizer adapters.
//!
//! - **[`OpenAIVectorizer`]**: `POST https://api.openai.com/v1/embeddings`
//! - **[`AzureOpenAIVectorizer`]**: an Azure OpenAI deployment
//! - **[`OllamaVectorizer`]**: a local Ollama instance's `/api/embed`
//! - **[`HashVectorizer`]**: deterministic feature hashing, no network
//!
//! Use [`create_vectorizer`] to pick one from configuration. Every remote
//! provider sends through [`send_with_retry`](crate::http::send_with_retry)
//! and validates that it got exactly one vector of the configured
//! dimensionality per input, so a short or malformed response fails the
//! whole batch.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reposync_core::traits::Vectorizer;
use reposync_core::vector::HashVectorizer;

use crate::config::EmbeddingConfig;
use crate::http::{self, send_with_retry};

/// Create the vectorizer named by `embedding.provider`.
///
/// | Config Value | Vectorizer |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIVectorizer`] |
/// | `"azure"` | [`AzureOpenAIVectorizer`] |
/// | `"ollama"` | [`OllamaVectorizer`] |
/// | `"hash"` | [`HashVectorizer`] |
pub fn create_vectorizer(config: &EmbeddingConfig) -> Result<Arc<dyn Vectorizer>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIVectorizer::new(config)?)),
        "azure" => Ok(Arc::new(AzureOpenAIVectorizer::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaVectorizer::new(config)?)),
        "hash" => Ok(Arc::new(HashVectorizer::new(config.resolved_dims()))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dims
        .filter(|d| *d > 0)
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for provider '{}'", config.provider))
}

// ============ OpenAI ============

pub struct OpenAIVectorizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIVectorizer {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            api_key,
            model,
            dims: required_dims(config)?,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Vectorizer for OpenAIVectorizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        // Only the v3 models accept a reduced dimensionality.
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = serde_json::json!(self.dims);
        }
        let response = send_with_retry("OpenAI API", self.max_retries, || {
            self.client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        let vectors = parse_openai_response(&json)?;
        check_shape(vectors, texts.len(), self.dims)
    }
}

// ============ Azure OpenAI ============

/// Azure OpenAI deployment. Same payload as OpenAI, different URL and auth
/// header; the key comes from `AZURE_OPENAI_API_KEY`.
pub struct AzureOpenAIVectorizer {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl AzureOpenAIVectorizer {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("AZURE_OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("AZURE_OPENAI_API_KEY not set"))?;
        let endpoint = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for azure"))?;
        let deployment = config
            .deployment
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.deployment required for azure"))?;
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            api_key,
            url: azure_url(endpoint, &deployment, &config.api_version),
            model: config.model.clone().unwrap_or(deployment),
            dims: required_dims(config)?,
            max_retries: config.max_retries,
        })
    }
}

fn azure_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/embeddings?api-version={}",
        endpoint.trim_end_matches('/'),
        deployment,
        api_version
    )
}

#[async_trait]
impl Vectorizer for AzureOpenAIVectorizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "input": texts });
        let response = send_with_retry("Azure OpenAI API", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&body)
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        let vectors = parse_openai_response(&json)?;
        check_shape(vectors, texts.len(), self.dims)
    }
}

/// Parse an OpenAI-style embeddings response.
///
/// Extracts `data[].embedding` and orders it by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
        indexed.push((index, to_floats(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

pub struct OllamaVectorizer {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaVectorizer {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
        let url = config
            .url
            .as_deref()
            .unwrap_or("http://localhost:11434")
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            url,
            model,
            dims: required_dims(config)?,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Vectorizer for OllamaVectorizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url);
        let response = send_with_retry("Ollama API", self.max_retries, || {
            self.client.post(&endpoint).json(&body)
        })
        .await
        .with_context(|| format!("is Ollama running at {}?", self.url))?;
        let json: serde_json::Value = response.json().await?;
        let vectors = parse_ollama_response(&json)?;
        check_shape(vectors, texts.len(), self.dims)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?;
            to_floats(values)
        })
        .collect()
}

fn to_floats(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: non-numeric value"))
        })
        .collect()
}

/// One vector per input, each with the configured dimensionality.
fn check_shape(vectors: Vec<Vec<f32>>, expected: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        bail!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "embedding provider returned a {}-dimensional vector, expected {}",
            bad.len(),
            dims
        );
    }
    Ok(vectors)
}
