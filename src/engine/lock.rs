//! Per-project run exclusion.
//!
//! Runs for different projects proceed concurrently; a second run for a
//! project that is already syncing fails fast instead of queueing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ProjectLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the run lock for `project_id`, or `None` if a run holds it.
    /// The lock is released when the guard drops.
    pub async fn try_acquire(&self, project_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(project_id.to_string()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}
