//! Change detectors.
//!
//! | Provider | Scope | Head marker | File revision |
//! |----------|-------|-------------|---------------|
//! | `git` | directory of local checkouts | `HEAD` commit id | blob id |
//! | `github` | organization or user login | default-branch commit id | blob id |

mod git;
mod github;

use std::sync::Arc;

use anyhow::{bail, Result};
use reposync_core::traits::ChangeDetector;

use crate::config::DetectorConfig;

pub use git::GitDetector;
pub use github::GitHubDetector;

pub fn create_detector(config: &DetectorConfig) -> Result<Arc<dyn ChangeDetector>> {
    match config.provider.as_str() {
        "git" => Ok(Arc::new(GitDetector::new(config.max_file_bytes))),
        "github" => Ok(Arc::new(GitHubDetector::new(config)?)),
        other => bail!("Unknown detector provider: {}", other),
    }
}
