//! # reposync core
//!
//! Runtime-agnostic building blocks for reposync: the sync data model,
//! deterministic chunk identity, the text chunker, the content filter,
//! vector helpers, and the collaborator traits the sync engine is built
//! against.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Concrete adapters (git and GitHub detectors, SQLite and Pinecone
//! indexes, HTTP vectorizers, Slack notifications) live in the `reposync`
//! app crate.

pub mod chunk;
pub mod filter;
pub mod memory;
pub mod models;
pub mod traits;
pub mod vector;
