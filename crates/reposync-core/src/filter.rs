//! Content filter: decides which change records reach the chunk/embed path.
//!
//! Rules, in order:
//!
//! 1. Removals always go to the deletion path, regardless of extension or
//!    exclusion rules. Deleting vectors for a file that was never indexed is
//!    a no-op, while skipping a removal could strand vectors indexed under
//!    older rules.
//! 2. A path matching any exclude pattern is skipped. Plain patterns match
//!    as substrings (`node_modules` excludes every path containing it);
//!    patterns containing `*`, `?` or `[` are globs.
//! 3. With a non-empty allow-list, the lowercased extension must be listed.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::models::{file_extension, ChangeKind, ChangeRecord};

/// Outcome of filtering one change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Chunk, vectorize and write.
    Process,
    /// Divert to the deletion path.
    Delete,
    /// Ignore for this run.
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Excluded(String),
    Extension(String),
}

#[derive(Debug, Clone)]
pub struct ContentFilter {
    allowed_extensions: Vec<String>,
    exclude_substrings: Vec<String>,
    exclude_globs: Option<GlobSet>,
    glob_patterns: Vec<String>,
}

impl ContentFilter {
    /// Build a filter. Extensions are accepted with or without the leading
    /// dot and compared case-insensitively.
    pub fn new(allowed_extensions: &[String], exclude_patterns: &[String]) -> Result<Self> {
        let allowed_extensions = allowed_extensions
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{}", e)
                }
            })
            .collect();

        let mut exclude_substrings = Vec::new();
        let mut glob_patterns = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns.iter().map(|p| p.trim()) {
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains(['*', '?', '[']) {
                builder.add(
                    Glob::new(pattern)
                        .with_context(|| format!("invalid exclude pattern '{}'", pattern))?,
                );
                glob_patterns.push(pattern.to_string());
            } else {
                exclude_substrings.push(pattern.to_string());
            }
        }
        let exclude_globs = if glob_patterns.is_empty() {
            None
        } else {
            Some(builder.build()?)
        };

        Ok(Self {
            allowed_extensions,
            exclude_substrings,
            exclude_globs,
            glob_patterns,
        })
    }

    pub fn decide(&self, path: &str, kind: ChangeKind) -> FilterDecision {
        if kind == ChangeKind::Removed {
            return FilterDecision::Delete;
        }

        if let Some(pattern) = self.exclude_substrings.iter().find(|p| path.contains(p.as_str())) {
            return FilterDecision::Skip(SkipReason::Excluded(pattern.clone()));
        }
        if let Some(globs) = &self.exclude_globs {
            if let Some(&idx) = globs.matches(path).first() {
                return FilterDecision::Skip(SkipReason::Excluded(self.glob_patterns[idx].clone()));
            }
        }

        if !self.allowed_extensions.is_empty() {
            let ext = file_extension(path);
            if !self.allowed_extensions.contains(&ext) {
                return FilterDecision::Skip(SkipReason::Extension(ext));
            }
        }

        FilterDecision::Process
    }

    pub fn decide_record(&self, record: &ChangeRecord) -> FilterDecision {
        self.decide(&record.path, record.kind)
    }
}
