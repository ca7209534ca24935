//! # reposync CLI
//!
//! Keeps a vector index in sync with the contents of source repositories.
//!
//! ## Usage
//!
//! ```bash
//! reposync --config ./config/reposync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reposync init` | Create the SQLite database and run schema migrations |
//! | `reposync projects` | List configured projects |
//! | `reposync sync <project>` | Run one incremental (or `--full`) sync |
//! | `reposync sync-all` | Sync every enabled project in turn |
//! | `reposync status <project>` | Checkpoint summary and recent runs |
//! | `reposync query <project> "<text>"` | Nearest chunks in the project's namespace |
//! | `reposync serve` | Start the HTTP trigger server |
//!
//! ## Examples
//!
//! ```bash
//! reposync init
//! reposync sync platform-docs
//! reposync sync platform-docs --full --timeout 1800
//! reposync sync platform-docs --json | jq .files_synced
//! reposync query platform-docs "how do I rotate credentials"
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reposync::config;
use reposync::engine::RunOptions;
use reposync::history;
use reposync::logging;
use reposync::migrate;
use reposync::progress::ProgressMode;
use reposync::query;
use reposync::server;
use reposync::setup::{build_app, App};
use reposync::status;
use reposync_core::models::RunResult;
use tokio_util::sync::CancellationToken;

/// reposync: keep a vector index in sync with your repositories.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "reposync",
    about = "Keep a vector index in sync with the contents of source repositories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/reposync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the checkpoints, vectors and
    /// runs tables. Running it again is safe.
    Init,

    /// List configured projects.
    Projects,

    /// Synchronize one project.
    ///
    /// Incremental by default: only files changed since the last recorded
    /// repository head are processed. Ctrl-C cancels the run after the
    /// files in flight finish.
    Sync {
        /// Project id from `[projects.<id>]`.
        project: String,

        /// Ignore recorded heads and list every file.
        #[arg(long)]
        full: bool,

        /// Cancel the run after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the run result as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Progress on stderr: `human`, `json`, or `off`. Defaults to
        /// `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Synchronize every enabled project, one after another.
    SyncAll {
        #[arg(long)]
        full: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show what the checkpoints say about a project.
    Status {
        project: String,

        /// List every checkpointed file.
        #[arg(long)]
        files: bool,

        #[arg(long)]
        json: bool,
    },

    /// Find the chunks closest to a piece of text.
    Query {
        project: String,

        text: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP trigger server on `[server].bind`.
    Serve,
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some("off") => Ok(ProgressMode::Off),
        Some(other) => anyhow::bail!("unknown progress mode '{}': use human, json, or off", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Projects => {
            let projects = cfg.all_projects();
            if projects.is_empty() {
                println!("No projects configured.");
            }
            for p in projects {
                println!(
                    "{:<24} scope={} keyword={} namespace={} strategy={:?}{}",
                    p.id,
                    p.scope,
                    p.keyword.as_deref().unwrap_or("-"),
                    p.namespace,
                    p.diff_strategy,
                    if p.enabled { "" } else { " (disabled)" }
                );
            }
        }
        Commands::Sync {
            project,
            full,
            timeout,
            json,
            progress,
        } => {
            let app = build_app(&cfg, progress_mode(progress.as_deref())?.reporter()).await?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received, finishing files in flight...");
                    on_interrupt.cancel();
                }
            });

            let options = RunOptions {
                cancel: Some(cancel),
                timeout: timeout.map(Duration::from_secs),
            };
            let result = app.engine.run_sync_with(&project, !full, options).await;
            finish_runs(&app, vec![result], json).await?;
        }
        Commands::SyncAll { full, json } => {
            let app = build_app(&cfg, ProgressMode::default_for_tty().reporter()).await?;
            let results = app.engine.run_all(!full).await;
            finish_runs(&app, results, json).await?;
        }
        Commands::Status {
            project,
            files,
            json,
        } => {
            let app = build_app(&cfg, ProgressMode::Off.reporter()).await?;
            let status = status::project_status(&app, &project, files).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                status::print_status(&status);
            }
        }
        Commands::Query {
            project,
            text,
            limit,
            json,
        } => {
            let app = build_app(&cfg, ProgressMode::Off.reporter()).await?;
            let hits = query::query_project(&app, &project, &text, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                query::print_hits(&hits);
            }
        }
        Commands::Serve => {
            let app = build_app(&cfg, ProgressMode::Off.reporter()).await?;
            server::run_server(Arc::new(app)).await?;
        }
    }

    Ok(())
}

/// Record and print finished runs; fail the process if any run failed.
async fn finish_runs(app: &App, results: Vec<RunResult>, json: bool) -> anyhow::Result<()> {
    for result in &results {
        if let Err(e) = history::record_run(&app.pool, result).await {
            tracing::warn!("failed to record run history: {:#}", e);
        }
    }

    if json {
        if let [only] = results.as_slice() {
            println!("{}", serde_json::to_string_pretty(only)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    } else {
        for result in &results {
            print_result(result);
        }
    }

    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.project_id.as_str())
        .collect();
    if !failed.is_empty() {
        anyhow::bail!("sync failed for: {}", failed.join(", "));
    }
    Ok(())
}

fn print_result(result: &RunResult) {
    println!(
        "sync {} ({})",
        result.project_id,
        if result.incremental { "incremental" } else { "full" }
    );
    println!("  repositories scanned: {}", result.repositories_scanned);
    println!(
        "  files:   {} changed, {} synced, {} failed, {} deleted",
        result.files_changed, result.files_synced, result.files_failed, result.files_deleted
    );
    println!(
        "  vectors: {} chunks, {} written, {} deleted",
        result.chunks_created, result.vectors_upserted, result.vectors_deleted
    );
    println!("  duration: {:.1}s", result.duration_ms as f64 / 1000.0);
    for issue in &result.warnings {
        println!("  warning [{:?}] {}", issue.scope, issue);
    }
    for issue in &result.errors {
        println!("  error   [{:?}] {}", issue.scope, issue);
    }
    if result.canceled {
        println!("  canceled before completion");
    }
    println!("  ok: {}", result.success);
}
