//! Local git change detector.
//!
//! The project scope is a directory: either a single checkout or a
//! directory whose immediate children are checkouts. The detector never
//! fetches or resets; keeping the checkouts current is left to whatever
//! manages them (a cron `git pull`, a CI cache, a mounted volume).
//!
//! Revisions are git object ids: the repository head is the commit id of
//! `HEAD` and a file's revision is its blob id, so an unchanged file keeps
//! its revision across commits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reposync_core::models::{ChangeKind, ChangeRecord, Repository};
use reposync_core::traits::{ChangeDetector, IncompleteDiff};
use tokio::process::Command;
use tokio::sync::RwLock;
use walkdir::WalkDir;

pub struct GitDetector {
    max_file_bytes: u64,
    /// Checkout directory for every repository id handed out by
    /// `list_repositories`.
    checkouts: RwLock<HashMap<String, PathBuf>>,
}

impl GitDetector {
    pub fn new(max_file_bytes: u64) -> Self {
        Self {
            max_file_bytes,
            checkouts: RwLock::new(HashMap::new()),
        }
    }

    async fn checkout(&self, repository: &Repository) -> Result<PathBuf> {
        self.checkouts
            .read()
            .await
            .get(&repository.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown repository '{}'", repository.id))
    }

    async fn describe(&self, dir: &Path, owner: &str) -> Result<Repository> {
        let name = dir_name(dir);
        let head = git_text(dir, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await
            .ok()
            .filter(|h| !h.is_empty());
        let default_branch = git_text(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap_or_else(|_| "HEAD".to_string());
        let updated_at = match &head {
            Some(h) => git_text(dir, &["log", "-1", "--format=%ct", h.as_str()])
                .await
                .ok()
                .and_then(|ts| parse_unix(&ts)),
            None => None,
        };

        Ok(Repository {
            id: format!("{}/{}", owner, name),
            name,
            owner: owner.to_string(),
            default_branch,
            head,
            updated_at,
        })
    }

    /// Every file at `head`, as `Added`.
    async fn list_all(
        &self,
        dir: &Path,
        repository: &Repository,
        head: &str,
    ) -> Result<Vec<ChangeRecord>> {
        let raw = git(dir, &["ls-tree", "-r", "-z", "--long", head]).await?;
        let mut records = Vec::new();
        for entry in parse_ls_tree(&raw) {
            if let Some(record) = self
                .load(dir, repository, entry.path, entry.blob, ChangeKind::Added)
                .await?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list_changes(
        &self,
        dir: &Path,
        repository: &Repository,
        since: &str,
        head: &str,
    ) -> Result<Vec<ChangeRecord>> {
        let raw = git(
            dir,
            &["diff", "--raw", "-z", "--no-renames", "--no-abbrev", since, head],
        )
        .await?;

        let mut records = Vec::new();
        for change in parse_raw_diff(&raw)? {
            if change.kind == ChangeKind::Removed {
                records.push(ChangeRecord {
                    repository: repository.id.clone(),
                    path: change.path,
                    kind: ChangeKind::Removed,
                    content: None,
                    revision: change.old_blob,
                    last_modified: repository.updated_at,
                    size: 0,
                });
                continue;
            }
            if let Some(record) = self
                .load(dir, repository, change.path, change.new_blob, change.kind)
                .await?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Read one blob. Binary files are dropped; oversized files are listed
    /// with empty content so their old vectors are cleared.
    async fn load(
        &self,
        dir: &Path,
        repository: &Repository,
        path: String,
        blob: String,
        kind: ChangeKind,
    ) -> Result<Option<ChangeRecord>> {
        let size: u64 = git_text(dir, &["cat-file", "-s", &blob])
            .await?
            .parse()
            .with_context(|| format!("bad object size for {}", path))?;

        let content = if size > self.max_file_bytes {
            tracing::debug!(repository = %repository.id, path = %path, size, "file too large, not read");
            String::new()
        } else {
            match String::from_utf8(git(dir, &["cat-file", "blob", &blob]).await?) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(repository = %repository.id, path = %path, "binary file skipped");
                    return Ok(None);
                }
            }
        };

        Ok(Some(ChangeRecord {
            repository: repository.id.clone(),
            path,
            kind,
            content: Some(content),
            revision: blob,
            last_modified: repository.updated_at,
            size,
        }))
    }
}

#[async_trait]
impl ChangeDetector for GitDetector {
    fn name(&self) -> &str {
        "git"
    }

    async fn list_repositories(
        &self,
        scope: &str,
        keyword: Option<&str>,
    ) -> Result<Vec<Repository>> {
        let root = PathBuf::from(scope);
        if !root.is_dir() {
            bail!("scope '{}' is not a directory", scope);
        }

        let dirs: Vec<PathBuf> = if is_checkout(&root) {
            vec![root.clone()]
        } else {
            let mut dirs: Vec<PathBuf> = WalkDir::new(&root)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir() && is_checkout(e.path()))
                .map(|e| e.into_path())
                .collect();
            dirs.sort();
            dirs
        };

        let owner = if dirs.first() == Some(&root) {
            root.parent().map(dir_name).unwrap_or_else(|| "local".to_string())
        } else {
            dir_name(&root)
        };
        let needle = keyword.map(|k| k.to_lowercase());

        let mut repositories = Vec::new();
        let mut checkouts = self.checkouts.write().await;
        for dir in dirs {
            let name = dir_name(&dir);
            if let Some(needle) = &needle {
                if !name.to_lowercase().contains(needle.as_str()) {
                    continue;
                }
            }
            let repository = self.describe(&dir, &owner).await?;
            checkouts.insert(repository.id.clone(), dir);
            repositories.push(repository);
        }
        Ok(repositories)
    }

    async fn diff(
        &self,
        repository: &Repository,
        since: Option<&str>,
    ) -> Result<Vec<ChangeRecord>> {
        let dir = self.checkout(repository).await?;
        let Some(head) = repository.head.as_deref() else {
            // No commits yet.
            return Ok(Vec::new());
        };

        match since {
            Some(since) if commit_exists(&dir, since).await => {
                self.list_changes(&dir, repository, since, head).await
            }
            Some(since) => Err(IncompleteDiff::new(format!(
                "marker {} not found in checkout",
                since
            ))
            .into()),
            None => self.list_all(&dir, repository, head).await,
        }
    }
}

fn is_checkout(dir: &Path) -> bool {
    dir.join(".git").exists()
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}

fn parse_unix(ts: &str) -> Option<DateTime<Utc>> {
    let secs = ts.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

async fn commit_exists(dir: &Path, rev: &str) -> bool {
    let spec = format!("{}^{{commit}}", rev);
    git(dir, &["cat-file", "-e", &spec]).await.is_ok()
}

async fn git(dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'", args.first().unwrap_or(&"")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(output.stdout)
}

async fn git_text(dir: &Path, args: &[&str]) -> Result<String> {
    let out = git(dir, args).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

#[derive(Debug, PartialEq)]
struct TreeEntry {
    path: String,
    blob: String,
}

/// Parse `git ls-tree -r -z --long` output, keeping blobs only.
///
/// Each entry is `<mode> <type> <object> <size>\t<path>\0`.
fn parse_ls_tree(raw: &[u8]) -> Vec<TreeEntry> {
    raw.split(|b| *b == 0)
        .filter(|e| !e.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (meta, path) = entry.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            let _mode = fields.next()?;
            let kind = fields.next()?;
            let object = fields.next()?;
            (kind == "blob").then(|| TreeEntry {
                path: path.to_string(),
                blob: object.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, PartialEq)]
struct RawChange {
    path: String,
    kind: ChangeKind,
    old_blob: String,
    new_blob: String,
}

/// Parse `git diff --raw -z --no-renames --no-abbrev` output.
///
/// Each change is `:<old mode> <new mode> <old id> <new id> <status>\0<path>\0`.
fn parse_raw_diff(raw: &[u8]) -> Result<Vec<RawChange>> {
    let mut fields = raw.split(|b| *b == 0).filter(|f| !f.is_empty());
    let mut changes = Vec::new();

    while let Some(meta) = fields.next() {
        let meta = String::from_utf8_lossy(meta);
        let Some(path) = fields.next() else {
            bail!("truncated diff output after '{}'", meta);
        };
        let path = String::from_utf8_lossy(path).to_string();

        let parts: Vec<&str> = meta.trim_start_matches(':').split_whitespace().collect();
        if parts.len() < 5 {
            bail!("malformed diff entry '{}'", meta);
        }
        let (old_mode, new_mode) = (parts[0], parts[1]);
        let kind = match parts[4].chars().next() {
            Some('A') => ChangeKind::Added,
            Some('D') => ChangeKind::Removed,
            Some('M') | Some('T') => ChangeKind::Modified,
            _ => continue,
        };
        // Submodule commits (mode 160000) have no blob to read.
        if old_mode == "160000" || new_mode == "160000" {
            continue;
        }
        changes.push(RawChange {
            path,
            kind,
            old_blob: parts[2].to_string(),
            new_blob: parts[3].to_string(),
        });
    }
    Ok(changes)
}
