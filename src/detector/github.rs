//! GitHub REST change detector.
//!
//! The project scope is an organization (or user) login. Repository heads
//! are commit ids of the default branch; file revisions are blob ids.
//!
//! Authentication uses `GH_TOKEN` or `GITHUB_TOKEN` when set; anonymous
//! access works for public repositories within the unauthenticated rate
//! limit.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reposync_core::models::{ChangeKind, ChangeRecord, Repository};
use reposync_core::traits::{ChangeDetector, IncompleteDiff};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::DetectorConfig;
use crate::http::{self, send_with_retry};

const PAGE_SIZE: usize = 100;
/// The compare endpoint lists at most this many files.
const COMPARE_FILE_LIMIT: usize = 300;

pub struct GitHubDetector {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    max_retries: u32,
    max_file_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct RepoItem {
    name: String,
    full_name: String,
    owner: OwnerItem,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct OwnerItem {
    login: String,
}

#[derive(Debug, Deserialize)]
struct BranchItem {
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(default)]
    files: Vec<CompareFile>,
}

#[derive(Debug, Deserialize)]
struct CompareFile {
    filename: String,
    status: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    previous_filename: Option<String>,
}

impl GitHubDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let token = std::env::var("GH_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty());
        if token.is_none() {
            tracing::info!("no GH_TOKEN or GITHUB_TOKEN set, using anonymous GitHub access");
        }
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            max_retries: 3,
            max_file_bytes: config.max_file_bytes,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.api_url, path);
        let response = send_with_retry("GitHub", self.max_retries, || {
            let req = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28");
            match &self.token {
                Some(token) => req.bearer_auth(token),
                None => req,
            }
        })
        .await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("invalid GitHub response for {}", path))
    }

    async fn list_owner_repos(&self, kind: &str, owner: &str) -> Result<Vec<RepoItem>> {
        let mut all = Vec::new();
        for page in 1.. {
            let items: Vec<RepoItem> = self
                .get_json(&format!(
                    "/{}/{}/repos?per_page={}&page={}",
                    kind, owner, PAGE_SIZE, page
                ))
                .await?;
            let done = items.len() < PAGE_SIZE;
            all.extend(items);
            if done {
                break;
            }
        }
        Ok(all)
    }

    async fn branch_head(&self, full_name: &str, branch: &str) -> Result<String> {
        let item: BranchItem = self
            .get_json(&format!("/repos/{}/branches/{}", full_name, branch))
            .await?;
        Ok(item.commit.sha)
    }

    async fn list_all(&self, repository: &Repository, head: &str) -> Result<Vec<ChangeRecord>> {
        let tree: TreeResponse = self
            .get_json(&format!(
                "/repos/{}/git/trees/{}?recursive=1",
                repository.id, head
            ))
            .await?;
        let mut records = Vec::new();
        for item in tree_blobs(&repository.id, tree)? {
            if let Some(record) = self
                .load(repository, item.path, item.sha, item.size, ChangeKind::Added)
                .await?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list_changes(
        &self,
        repository: &Repository,
        since: &str,
        head: &str,
    ) -> Result<Vec<ChangeRecord>> {
        let compare: CompareResponse = self
            .get_json(&format!(
                "/repos/{}/compare/{}...{}",
                repository.id, since, head
            ))
            .await?;
        check_compare(&compare)?;

        let mut records = Vec::new();
        for file in compare.files {
            let kind = match file.status.as_str() {
                "added" | "copied" => ChangeKind::Added,
                "removed" => ChangeKind::Removed,
                "renamed" => {
                    if let Some(previous) = file.previous_filename.clone() {
                        records.push(removal(repository, previous));
                    }
                    ChangeKind::Added
                }
                _ => ChangeKind::Modified,
            };
            if kind == ChangeKind::Removed {
                records.push(removal(repository, file.filename));
                continue;
            }
            let Some(sha) = file.sha else {
                continue;
            };
            if let Some(record) = self
                .load(repository, file.filename, sha, None, kind)
                .await?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load(
        &self,
        repository: &Repository,
        path: String,
        sha: String,
        size: Option<u64>,
        kind: ChangeKind,
    ) -> Result<Option<ChangeRecord>> {
        let content = if size.is_some_and(|s| s > self.max_file_bytes) {
            tracing::debug!(repository = %repository.id, path = %path, "file too large, not downloaded");
            String::new()
        } else {
            let blob: BlobResponse = self
                .get_json(&format!("/repos/{}/git/blobs/{}", repository.id, sha))
                .await?;
            match decode_blob(&blob)? {
                Some(text) => text,
                None => {
                    tracing::debug!(repository = %repository.id, path = %path, "binary file skipped");
                    return Ok(None);
                }
            }
        };

        Ok(Some(ChangeRecord {
            repository: repository.id.clone(),
            size: size.unwrap_or(content.len() as u64),
            path,
            kind,
            content: Some(content),
            revision: sha,
            last_modified: repository.updated_at,
        }))
    }
}

/// Blob entries of a recursive tree. A truncated tree is an error: treating
/// it as complete would read every path past the cut as removed.
fn tree_blobs(repository: &str, tree: TreeResponse) -> Result<Vec<TreeItem>> {
    if tree.truncated {
        bail!(
            "GitHub truncated the tree listing of {} after {} entries",
            repository,
            tree.tree.len()
        );
    }
    Ok(tree.tree.into_iter().filter(|i| i.kind == "blob").collect())
}

fn check_compare(compare: &CompareResponse) -> Result<()> {
    if compare.files.len() >= COMPARE_FILE_LIMIT {
        return Err(IncompleteDiff::new(format!(
            "compare lists {} files, the most GitHub returns",
            compare.files.len()
        ))
        .into());
    }
    Ok(())
}

fn removal(repository: &Repository, path: String) -> ChangeRecord {
    ChangeRecord {
        repository: repository.id.clone(),
        path,
        kind: ChangeKind::Removed,
        content: None,
        revision: String::new(),
        last_modified: repository.updated_at,
        size: 0,
    }
}

/// Decode a blob payload; `None` for non-UTF-8 content.
fn decode_blob(blob: &BlobResponse) -> Result<Option<String>> {
    let bytes = match blob.encoding.as_str() {
        "base64" => {
            let compact: String = blob.content.split_whitespace().collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .context("invalid base64 blob")?
        }
        _ => blob.content.clone().into_bytes(),
    };
    Ok(String::from_utf8(bytes).ok())
}

#[async_trait]
impl ChangeDetector for GitHubDetector {
    fn name(&self) -> &str {
        "github"
    }

    async fn list_repositories(
        &self,
        scope: &str,
        keyword: Option<&str>,
    ) -> Result<Vec<Repository>> {
        let items = match self.list_owner_repos("orgs", scope).await {
            Ok(items) => items,
            Err(e) if http::is_not_found(&e) => self.list_owner_repos("users", scope).await?,
            Err(e) => return Err(e),
        };
        let needle = keyword.map(|k| k.to_lowercase());

        let mut repositories = Vec::new();
        for item in items {
            if item.archived {
                continue;
            }
            if let Some(needle) = &needle {
                if !item.name.to_lowercase().contains(needle.as_str()) {
                    continue;
                }
            }
            let Some(branch) = item.default_branch else {
                // Empty repository.
                continue;
            };
            let head = self.branch_head(&item.full_name, &branch).await?;
            repositories.push(Repository {
                id: item.full_name,
                name: item.name,
                owner: item.owner.login,
                default_branch: branch,
                head: Some(head),
                updated_at: item.pushed_at,
            });
        }
        repositories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(repositories)
    }

    async fn diff(
        &self,
        repository: &Repository,
        since: Option<&str>,
    ) -> Result<Vec<ChangeRecord>> {
        let Some(head) = repository.head.as_deref() else {
            return Ok(Vec::new());
        };
        match since {
            Some(since) => match self.list_changes(repository, since, head).await {
                Ok(records) => Ok(records),
                Err(e) if http::is_not_found(&e) => Err(IncompleteDiff::new(format!(
                    "marker {} unknown to GitHub",
                    since
                ))
                .into()),
                Err(e) => Err(e),
            },
            None => self.list_all(repository, head).await,
        }
    }
}
