//! Run progress reporting.
//!
//! The engine receives a [`SyncReporter`] in its constructor and reports
//! phase changes, per-repository diff sizes and per-file completion
//! through it. Progress goes to **stderr** so stdout stays parseable for
//! scripts (`reposync sync docs --json`).

use std::io::Write;

use reposync_core::models::RunResult;

use crate::engine::RunPhase;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    Phase {
        project: String,
        phase: RunPhase,
    },
    /// One repository was diffed.
    Repository {
        project: String,
        repository: String,
        changes: usize,
    },
    /// `n` of `total` files finished processing.
    Processing {
        project: String,
        n: u64,
        total: u64,
    },
    Finished {
        project: String,
        success: bool,
        files_synced: usize,
        files_failed: usize,
        duration_ms: u64,
    },
}

impl SyncProgressEvent {
    pub fn finished(result: &RunResult) -> Self {
        SyncProgressEvent::Finished {
            project: result.project_id.clone(),
            success: result.success,
            files_synced: result.files_synced,
            files_failed: result.files_failed,
            duration_ms: result.duration_ms,
        }
    }
}

/// Receives progress events from the engine. Implementations must be cheap;
/// they are called from worker tasks.
pub trait SyncReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync docs  processing  12 / 40 files".
pub struct StderrProgress;

impl SyncReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Phase { project, phase } => {
                format!("sync {}  {}\n", project, phase.as_str())
            }
            SyncProgressEvent::Repository {
                project,
                repository,
                changes,
            } => format!(
                "sync {}  {}  {} change(s)\n",
                project,
                repository,
                format_number(*changes as u64)
            ),
            SyncProgressEvent::Processing { project, n, total } => format!(
                "sync {}  processing  {} / {} files\n",
                project,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Finished {
                project,
                success,
                files_synced,
                files_failed,
                duration_ms,
            } => format!(
                "sync {}  {}  {} synced, {} failed in {:.1}s\n",
                project,
                if *success { "done" } else { "failed" },
                format_number(*files_synced as u64),
                format_number(*files_failed as u64),
                *duration_ms as f64 / 1000.0
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Phase { project, phase } => serde_json::json!({
                "event": "phase",
                "project": project,
                "phase": phase.as_str(),
            }),
            SyncProgressEvent::Repository {
                project,
                repository,
                changes,
            } => serde_json::json!({
                "event": "repository",
                "project": project,
                "repository": repository,
                "changes": changes,
            }),
            SyncProgressEvent::Processing { project, n, total } => serde_json::json!({
                "event": "progress",
                "project": project,
                "n": n,
                "total": total,
            }),
            SyncProgressEvent::Finished {
                project,
                success,
                files_synced,
                files_failed,
                duration_ms,
            } => serde_json::json!({
                "event": "finished",
                "project": project,
                "success": success,
                "files_synced": files_synced,
                "files_failed": files_failed,
                "duration_ms": duration_ms,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn SyncReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn finished_event_copies_counters() {
        let mut r = RunResult::new("docs", true);
        r.files_synced = 4;
        r.files_failed = 1;
        r.finish();
        match SyncProgressEvent::finished(&r) {
            SyncProgressEvent::Finished {
                project,
                success,
                files_synced,
                files_failed,
                ..
            } => {
                assert_eq!(project, "docs");
                assert!(success);
                assert_eq!(files_synced, 4);
                assert_eq!(files_failed, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
