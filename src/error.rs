//! Error kinds surfaced by the sync engine.
//!
//! Per-candidate fetch failures are values ([`FetchError`]) that travel in the
//! harvest report; everything else is a run-wide [`SyncError`] that aborts the
//! run before the live catalog is touched.

use crate::catalog::CanonicalId;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("discovery against {source_ref} failed: {message}")]
    Discovery { source_ref: String, message: String },

    #[error("harvest from {source_ref} produced no candidates")]
    EmptyHarvest { source_ref: String },

    #[error("prior catalog at {} is unreadable: {message}", .path.display())]
    Snapshot { path: PathBuf, message: String },

    #[error(transparent)]
    IdentityCollision(#[from] CollisionError),

    #[error(transparent)]
    IndexIntegrity(#[from] IndexIntegrityError),

    #[error(transparent)]
    SchemaViolation(#[from] ValidationFailure),

    #[error("write to {} failed: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Write {
            path: path.into(),
            source,
        }
    }
}

/// A recoverable failure for a single candidate.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{locator}: {kind}")]
pub struct FetchError {
    pub locator: String,
    #[serde(flatten)]
    pub kind: FetchErrorKind,
}

impl FetchError {
    pub fn new(locator: impl Into<String>, kind: FetchErrorKind) -> Self {
        Self {
            locator: locator.into(),
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FetchErrorKind::Timeout { .. } => true,
            FetchErrorKind::Status { status } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchErrorKind {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("upstream returned HTTP {status}")]
    Status { status: u16 },
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error("descriptor exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("invalid descriptor: {message}")]
    InvalidDescriptor { message: String },
}

/// One canonical id claimed by more than one origin, or one path claimed by
/// more than one id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub key: String,
    pub claimants: Vec<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct CollisionError {
    pub collisions: Vec<Collision>,
}

impl fmt::Display for CollisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "identity collision on {} key(s):",
            self.collisions.len()
        )?;
        for collision in &self.collisions {
            write!(f, "\n  {} <- {}", collision.key, collision.claimants.join(", "))?;
        }
        Ok(())
    }
}

impl CollisionError {
    /// Keys that were claimed more than once, in report order.
    pub fn keys(&self) -> Vec<&str> {
        self.collisions.iter().map(|c| c.key.as_str()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum IndexProblem {
    DuplicateId { id: CanonicalId },
    UrlShapedPath { id: CanonicalId, path: String },
    NonRelativePath { id: CanonicalId, path: String },
    MissingOnDisk { id: CanonicalId, path: String },
    IdMismatch { id: CanonicalId, path: String, found: String },
    ActiveNotIndexed { id: CanonicalId },
    IndexedNotActive { id: CanonicalId },
    Unreadable { message: String },
}

impl fmt::Display for IndexProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexProblem::DuplicateId { id } => write!(f, "duplicate id {id}"),
            IndexProblem::UrlShapedPath { id, path } => {
                write!(f, "{id}: path is URL-shaped: {path}")
            }
            IndexProblem::NonRelativePath { id, path } => {
                write!(f, "{id}: path is not a plain relative path: {path}")
            }
            IndexProblem::MissingOnDisk { id, path } => {
                write!(f, "{id}: path does not exist on disk: {path}")
            }
            IndexProblem::IdMismatch { id, path, found } => {
                write!(f, "{id}: {path} holds manifest '{found}'")
            }
            IndexProblem::ActiveNotIndexed { id } => {
                write!(f, "{id}: active record missing from index")
            }
            IndexProblem::IndexedNotActive { id } => {
                write!(f, "{id}: indexed but not an active record")
            }
            IndexProblem::Unreadable { message } => write!(f, "index unreadable: {message}"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct IndexIntegrityError {
    pub problems: Vec<IndexProblem>,
}

impl fmt::Display for IndexIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index integrity check failed with {} problem(s):", self.problems.len())?;
        for problem in &self.problems {
            write!(f, "\n  {problem}")?;
        }
        Ok(())
    }
}

/// Which validator check produced a violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Structure,
    Schema,
    IndexIntegrity,
}

/// A single validator finding, localized to a manifest file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub check: Check,
    pub path: String,
    pub pointer: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pointer.is_empty() {
            write!(f, "{}: {}", self.path, self.message)
        } else {
            write!(f, "{} at {}: {}", self.path, self.pointer, self.message)
        }
    }
}

/// Aggregated structure/schema violations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct ValidationFailure {
    pub violations: Vec<Violation>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} manifest violation(s):", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  {violation}")?;
        }
        Ok(())
    }
}
