//! Wiring from configuration to a ready [`SyncEngine`].

use std::sync::Arc;

use anyhow::Result;
use reposync_core::chunk::TextChunker;
use sqlx::SqlitePool;

use crate::checkpoint::SqliteCheckpointStore;
use crate::config::Config;
use crate::detector::create_detector;
use crate::embedding::create_vectorizer;
use crate::engine::{EngineSettings, SyncDeps, SyncEngine};
use crate::index::{create_index, IndexHandle};
use crate::migrate;
use crate::notify::create_notifier;
use crate::progress::SyncReporter;

/// Everything a CLI command or the server needs for one process.
pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub engine: Arc<SyncEngine>,
    pub index: IndexHandle,
    pub deps: SyncDeps,
}

/// Open the database (creating the schema if needed) and build every
/// collaborator named in `config`.
pub async fn build_app(config: &Config, reporter: Arc<dyn SyncReporter>) -> Result<App> {
    let pool = crate::db::connect(config).await?;
    migrate::apply(&pool).await?;

    let index = create_index(&config.index, &pool)?;
    let deps = SyncDeps {
        detector: create_detector(&config.detector)?,
        chunker: Arc::new(TextChunker),
        vectorizer: create_vectorizer(&config.embedding)?,
        index: index.writer.clone(),
        checkpoints: Arc::new(SqliteCheckpointStore::new(pool.clone())),
        notifier: create_notifier(&config.notifications)?,
    };
    tracing::debug!(
        detector = deps.detector.name(),
        model = deps.vectorizer.model_name(),
        dims = deps.vectorizer.dims(),
        index = %config.index.provider,
        "collaborators ready"
    );

    let engine = SyncEngine::new(
        config.all_projects(),
        EngineSettings::from_config(config),
        deps.clone(),
        reporter,
    );

    Ok(App {
        config: config.clone(),
        pool,
        engine: Arc::new(engine),
        index,
        deps,
    })
}
