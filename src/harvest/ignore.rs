//! Declarative ignore rules evaluated against candidate path segments.
//!
//! A candidate is skipped when any directory segment of its discovery path
//! matches one of the glob patterns. The final segment (the descriptor file
//! itself) is never tested, so `build/manifest.json` is ignored but a server
//! whose descriptor happens to be named like a pattern is not.

use crate::error::{SyncError, SyncResult};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Vendored dependency trees, build output and version-control metadata.
pub const DEFAULT_IGNORE_SEGMENTS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "bower_components",
    "vendor",
    "third_party",
    "build",
    "dist",
    "target",
    "out",
    "__pycache__",
    ".venv",
    "venv",
    "site-packages",
    ".tox",
];

#[derive(Clone, Debug)]
pub struct IgnoreSet {
    patterns: Vec<String>,
    globs: GlobSet,
}

impl IgnoreSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> SyncResult<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let glob = Glob::new(pattern).map_err(|err| {
                SyncError::Config(format!("invalid ignore pattern {pattern:?}: {err}"))
            })?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }
        let globs = builder
            .build()
            .map_err(|err| SyncError::Config(format!("building ignore set: {err}")))?;
        Ok(Self {
            patterns: kept,
            globs,
        })
    }

    pub fn defaults() -> SyncResult<Self> {
        Self::new(DEFAULT_IGNORE_SEGMENTS)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// First directory segment of `path` that matches, if any.
    pub fn matching_segment<'a>(&self, path: &'a str) -> Option<&'a str> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let dirs = segments.len().saturating_sub(1);
        segments[..dirs]
            .iter()
            .copied()
            .find(|segment| self.globs.is_match(segment))
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.matching_segment(path).is_some()
    }
}
