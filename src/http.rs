//! Shared HTTP plumbing for the remote adapters.
//!
//! Every adapter that talks to a web API (GitHub, the embedding providers,
//! Pinecone, Slack) sends its requests through [`send_with_retry`]:
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx other than 429 → fail immediately with [`HttpStatusError`]
//! - Network errors → retry
//!
//! Backoff is exponential: 1s, 2s, 4s, 8s, … capped at 32s.

use std::time::Duration;

use anyhow::Result;
use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;

/// A non-retryable HTTP failure, kept typed so callers can branch on the
/// status (a 404 from a compare endpoint means "fall back to a full
/// listing", not "give up").
#[derive(Debug, Error)]
#[error("{label} error {status}: {body}")]
pub struct HttpStatusError {
    pub label: String,
    pub status: StatusCode,
    pub body: String,
}

impl HttpStatusError {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// Whether `err` wraps an [`HttpStatusError`] with status 404.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpStatusError>()
        .is_some_and(HttpStatusError::is_not_found)
}

pub fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("reposync/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// Send the request built by `make` until it succeeds, fails with a
/// non-retryable status, or `max_retries` retries are exhausted.
///
/// `make` is called once per attempt because a `RequestBuilder` cannot be
/// reused after sending.
pub async fn send_with_retry<F>(label: &str, max_retries: u32, mut make: F) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff(attempt);
            tracing::debug!(label, attempt, delay_secs = delay.as_secs(), "retrying request");
            tokio::time::sleep(delay).await;
        }

        match make().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body = response.text().await.unwrap_or_default();
                let err = HttpStatusError {
                    label: label.to_string(),
                    status,
                    body,
                };
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    tracing::warn!(label, %status, attempt, "retryable response");
                    last_err = Some(anyhow::Error::new(err));
                    continue;
                }
                return Err(err.into());
            }
            Err(e) => {
                tracing::warn!(label, attempt, "request failed: {}", e);
                last_err = Some(anyhow::Error::new(e).context(format!("{} request failed", label)));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", label)))
}
