//! TOML configuration.
//!
//! One file describes the database, the processing limits, every
//! collaborator adapter, and the set of projects to sync. Secrets (API
//! keys, tokens, webhook URLs) are read from the environment, never from
//! the file.
//!
//! ```toml
//! [db]
//! path = "./data/reposync.sqlite"
//!
//! [processing]
//! max_workers = 5
//! allowed_extensions = [".md", ".rst", ".txt"]
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [detector]
//! provider = "github"
//!
//! [projects.platform-docs]
//! scope = "my-org"
//! keyword = "docs"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reposync_core::chunk::ChunkParams;
use reposync_core::models::{DiffStrategy, Project};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Vector records accumulated before the index writer is called.
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// Cancel runs that take longer than this.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_chunk_size: default_max_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            upsert_batch_size: default_upsert_batch_size(),
            allowed_extensions: default_allowed_extensions(),
            exclude_patterns: default_exclude_patterns(),
            run_timeout_secs: None,
        }
    }
}

impl ProcessingConfig {
    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            max_chunk_size: self.max_chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

fn default_max_workers() -> usize {
    5
}
fn default_max_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_upsert_batch_size() -> usize {
    100
}
fn default_allowed_extensions() -> Vec<String> {
    [".md", ".rst", ".txt", ".yaml", ".yml", ".json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_exclude_patterns() -> Vec<String> {
    ["node_modules", "__pycache__", ".git/", "dist/", "build/"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Texts per vectorizer request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Ollama base URL or Azure OpenAI resource endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Azure OpenAI deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
            deployment: None,
            api_version: default_azure_api_version(),
        }
    }
}

impl EmbeddingConfig {
    /// Whether the provider calls a remote model.
    pub fn is_remote(&self) -> bool {
        self.provider != "hash"
    }

    /// Vector dimensionality; the hash provider defaults to 256.
    pub fn resolved_dims(&self) -> usize {
        self.dims.unwrap_or(256)
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_azure_api_version() -> String {
    "2024-02-01".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_provider")]
    pub provider: String,
    /// Pinecone index host, e.g. `https://docs-abc123.svc.us-east-1.pinecone.io`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            host: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_provider() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_provider")]
    pub provider: String,
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Files larger than this are listed but never downloaded.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            provider: default_detector_provider(),
            api_url: default_github_api(),
            max_file_bytes: default_max_file_bytes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_detector_provider() -> String {
    "git".to_string()
}
fn default_github_api() -> String {
    "https://api.github.com".to_string()
}
fn default_max_file_bytes() -> u64 {
    1_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    #[serde(default = "default_notifier")]
    pub provider: String,
    /// Environment variable holding the Slack webhook URL.
    #[serde(default = "default_webhook_env")]
    pub webhook_env: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            provider: default_notifier(),
            webhook_env: default_webhook_env(),
            channel: None,
            username: default_username(),
        }
    }
}

fn default_notifier() -> String {
    "log".to_string()
}
fn default_webhook_env() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}
fn default_username() -> String {
    "reposync".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also append logs to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// GitHub organization or local directory of checkouts.
    pub scope: String,
    #[serde(default)]
    pub keyword: Option<String>,
    /// Defaults to the project id.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub diff_strategy: DiffStrategy,
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_patterns: Option<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Resolve a project by id, applying `[processing]` defaults.
    pub fn project(&self, id: &str) -> Option<Project> {
        self.projects.get(id).map(|p| Project {
            id: id.to_string(),
            name: p.name.clone().unwrap_or_else(|| id.to_string()),
            scope: p.scope.clone(),
            keyword: p.keyword.clone().filter(|k| !k.is_empty()),
            namespace: p.namespace.clone().unwrap_or_else(|| id.to_string()),
            allowed_extensions: p
                .allowed_extensions
                .clone()
                .unwrap_or_else(|| self.processing.allowed_extensions.clone()),
            exclude_patterns: p
                .exclude_patterns
                .clone()
                .unwrap_or_else(|| self.processing.exclude_patterns.clone()),
            enabled: p.enabled,
            diff_strategy: p.diff_strategy,
        })
    }

    /// Every configured project, sorted by id.
    pub fn all_projects(&self) -> Vec<Project> {
        self.projects
            .keys()
            .filter_map(|id| self.project(id))
            .collect()
    }
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let p = &config.processing;
    if p.max_workers == 0 {
        anyhow::bail!("processing.max_workers must be > 0");
    }
    if p.max_chunk_size == 0 {
        anyhow::bail!("processing.max_chunk_size must be > 0");
    }
    if p.chunk_overlap >= p.max_chunk_size {
        anyhow::bail!("processing.chunk_overlap must be smaller than processing.max_chunk_size");
    }
    if p.upsert_batch_size == 0 {
        anyhow::bail!("processing.upsert_batch_size must be > 0");
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "openai" | "azure" | "ollama" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, azure, ollama, or hash.",
            other
        ),
    }
    if e.dims == Some(0) || (e.is_remote() && e.dims.is_none()) {
        anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
    }
    if e.is_remote() && e.model.is_none() && e.provider != "azure" {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            e.provider
        );
    }
    if e.provider == "azure" && (e.url.is_none() || e.deployment.is_none()) {
        anyhow::bail!("embedding.url and embedding.deployment are required for azure");
    }
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.index.provider.as_str() {
        "sqlite" | "memory" => {}
        "pinecone" => {
            if config.index.host.is_none() {
                anyhow::bail!("index.host is required when provider is 'pinecone'");
            }
        }
        other => anyhow::bail!(
            "Unknown index provider: '{}'. Must be sqlite, pinecone, or memory.",
            other
        ),
    }

    match config.detector.provider.as_str() {
        "git" | "github" => {}
        other => anyhow::bail!(
            "Unknown detector provider: '{}'. Must be git or github.",
            other
        ),
    }

    match config.notifications.provider.as_str() {
        "log" | "slack" => {}
        other => anyhow::bail!(
            "Unknown notifications provider: '{}'. Must be log or slack.",
            other
        ),
    }

    for (id, project) in &config.projects {
        if project.scope.trim().is_empty() {
            anyhow::bail!("projects.{}.scope must not be empty", id);
        }
    }

    Ok(config)
}

/// Load and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/reposync.sqlite"

[projects.docs]
scope = "/srv/checkouts"
"#;

    #[test]
    fn test_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.processing.max_workers, 5);
        assert_eq!(config.processing.max_chunk_size, 1000);
        assert_eq!(config.processing.chunk_overlap, 200);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.index.provider, "sqlite");
        assert_eq!(config.detector.provider, "git");
        assert_eq!(config.notifications.provider, "log");
        assert_eq!(config.server.bind, "127.0.0.1:7340");
    }

    #[test]
    fn test_project_resolution_inherits_processing_rules() {
        let config = parse_config(
            r#"
[db]
path = "x.sqlite"

[processing]
allowed_extensions = [".md"]

[projects.docs]
scope = "org"
keyword = "handbook"
diff_strategy = "per_file"

[projects.api]
scope = "org"
namespace = "api-ns"
enabled = false
exclude_patterns = ["vendor"]
"#,
        )
        .unwrap();

        let docs = config.project("docs").unwrap();
        assert_eq!(docs.namespace, "docs");
        assert_eq!(docs.keyword.as_deref(), Some("handbook"));
        assert_eq!(docs.allowed_extensions, vec![".md".to_string()]);
        assert_eq!(docs.diff_strategy, DiffStrategy::PerFile);
        assert!(docs.enabled);

        let api = config.project("api").unwrap();
        assert_eq!(api.namespace, "api-ns");
        assert!(!api.enabled);
        assert_eq!(api.exclude_patterns, vec!["vendor".to_string()]);
        assert_eq!(api.diff_strategy, DiffStrategy::Repository);

        assert!(config.project("missing").is_none());
        let ids: Vec<String> = config.all_projects().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["api".to_string(), "docs".to_string()]);
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_chunk() {
        let err = parse_config(
            r#"
[db]
path = "x.sqlite"
[processing]
max_chunk_size = 100
chunk_overlap = 100
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_rejects_unknown_providers() {
        for (section, key) in [
            ("embedding", "provider = \"magic\""),
            ("index", "provider = \"redis\""),
            ("detector", "provider = \"svn\""),
            ("notifications", "provider = \"pager\""),
        ] {
            let text = format!("[db]\npath = \"x\"\n[{}]\n{}\n", section, key);
            assert!(parse_config(&text).is_err(), "{} accepted", section);
        }
    }

    #[test]
    fn test_remote_embedding_requires_model() {
        let err = parse_config(
            r#"
[db]
path = "x"
[embedding]
provider = "openai"
dims = 1536
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/reposync.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "openai");
        assert_eq!(config.embedding.dims, Some(1536));
        let runbooks = config.project("runbooks").unwrap();
        assert_eq!(runbooks.diff_strategy, DiffStrategy::PerFile);
        assert_eq!(runbooks.namespace, "runbooks");

        let filter = reposync_core::filter::ContentFilter::new(
            &config.processing.allowed_extensions,
            &config.processing.exclude_patterns,
        )
        .unwrap();
        assert_ne!(
            filter.decide("docs/plan.draft.md", reposync_core::models::ChangeKind::Added),
            reposync_core::filter::FilterDecision::Process
        );
    }

    #[test]
    fn test_pinecone_requires_host() {
        assert!(parse_config("[db]\npath = \"x\"\n[index]\nprovider = \"pinecone\"\n").is_err());
        assert!(parse_config(
            "[db]\npath = \"x\"\n[index]\nprovider = \"pinecone\"\nhost = \"https://h\"\n"
        )
        .is_ok());
    }
}
