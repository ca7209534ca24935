//! Fatal sync errors.
//!
//! Only these abort a run early. Everything else is contained to a
//! repository, file, batch or deletion and recorded as a warning on the
//! [`RunResult`](reposync_core::models::RunResult).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("project '{0}' is not configured")]
    ProjectNotFound(String),

    #[error("project '{0}' is disabled")]
    ProjectDisabled(String),

    #[error("a sync for project '{0}' is already running")]
    RunInProgress(String),

    #[error("repository discovery failed: {0:#}")]
    Discovery(anyhow::Error),

    #[error("invalid project rules: {0:#}")]
    InvalidRules(anyhow::Error),

    #[error("run canceled")]
    Canceled,

    #[error("run exceeded its {0}s deadline")]
    DeadlineExceeded(u64),
}
