//! # reposync
//!
//! Keeps a vector index in sync with the contents of source repositories.
//!
//! A sync run discovers the repositories of a project, works out which
//! files changed since the last successful run, chunks and vectorizes the
//! changed files on a bounded worker pool, writes the vectors to the index
//! and records per-file checkpoints so the next run is incremental.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────┐   ┌─────────────┐
//! │   Detector   │──▶│       SyncEngine         │──▶│ Index writer│
//! │  git/GitHub  │   │ diff → filter → chunk →  │   │ SQLite/Pine │
//! └──────────────┘   │ vectorize → batch write  │   └─────────────┘
//!                    └────────────┬─────────────┘
//!                                 │
//!                   ┌─────────────┼─────────────┐
//!                   ▼             ▼             ▼
//!             ┌──────────┐  ┌──────────┐  ┌──────────┐
//!             │Checkpoint│  │ Notifier │  │ Reporter │
//!             │  SQLite  │  │Slack/log │  │ progress │
//!             └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! The data model, chunk identity, content filter and collaborator traits
//! live in the runtime-agnostic `reposync-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`engine`] | Run lifecycle, diff planning, worker pool |
//! | [`detector`] | Local git and GitHub change detectors |
//! | [`embedding`] | Vectorizer adapters |
//! | [`index`] | SQLite, Pinecone and in-memory vector indexes |
//! | [`checkpoint`] | SQLite checkpoint store |
//! | [`notify`] | Slack and log notifiers |
//! | [`http`] | Retry and backoff for remote adapters |
//! | [`progress`] | Progress reporters (stderr, JSON lines) |
//! | [`setup`] | Wiring configuration into an engine |
//! | [`status`] | Checkpoint summaries |
//! | [`query`] | Nearest-neighbour lookup |
//! | [`history`] | Run history |
//! | [`server`] | HTTP trigger server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Fatal run errors |

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod detector;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod history;
pub mod http;
pub mod index;
pub mod logging;
pub mod migrate;
pub mod notify;
pub mod progress;
pub mod query;
pub mod server;
pub mod setup;
pub mod status;
