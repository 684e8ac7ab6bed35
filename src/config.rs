//! Caller-supplied configuration record.
//!
//! A [`SyncConfig`] can be built in code, or read from a JSON file where
//! every field is optional and falls back to the defaults below. Binaries
//! layer command-line flags on top of the file.

use crate::error::{SyncError, SyncResult};
use crate::harvest::DEFAULT_IGNORE_SEGMENTS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_DESCRIPTOR_BYTES: usize = 1024 * 1024;
const DEFAULT_GIT_REF: &str = "HEAD";

/// Upstream source reference: `registry:<base-url>` or
/// `github:<owner>/<repo>[@<ref>]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceRef {
    Registry {
        base_url: String,
    },
    Repository {
        owner: String,
        repo: String,
        git_ref: String,
    },
}

impl FromStr for SourceRef {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(url) = raw.strip_prefix("registry:") {
            let url = url.trim_end_matches('/');
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("registry source needs an http(s) base URL, got {url:?}"));
            }
            return Ok(SourceRef::Registry {
                base_url: url.to_string(),
            });
        }
        if let Some(target) = raw.strip_prefix("github:") {
            let (slug, git_ref) = match target.split_once('@') {
                Some((slug, git_ref)) if !git_ref.is_empty() => (slug, git_ref),
                Some((_, _)) => return Err(format!("empty ref in source {raw:?}")),
                None => (target, DEFAULT_GIT_REF),
            };
            let (owner, repo) = slug
                .split_once('/')
                .filter(|(owner, repo)| {
                    !owner.is_empty() && !repo.is_empty() && !repo.contains('/')
                })
                .ok_or_else(|| format!("repository source must be owner/repo, got {slug:?}"))?;
            return Ok(SourceRef::Repository {
                owner: owner.to_string(),
                repo: repo.trim_end_matches(".git").to_string(),
                git_ref: git_ref.to_string(),
            });
        }
        Err(format!(
            "unrecognized source {raw:?}; expected registry:<url> or github:<owner>/<repo>[@ref]"
        ))
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Registry { base_url } => write!(f, "registry:{base_url}"),
            SourceRef::Repository {
                owner,
                repo,
                git_ref,
            } => write!(f, "github:{owner}/{repo}@{git_ref}"),
        }
    }
}

impl TryFrom<String> for SourceRef {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<SourceRef> for String {
    fn from(source: SourceRef) -> Self {
        source.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub source: Option<SourceRef>,
    pub output_root: Option<PathBuf>,
    pub concurrency: usize,
    pub limit: Option<usize>,
    pub ignore_segments: Vec<String>,
    pub schema_path: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub page_size: usize,
    pub descriptor_names: Vec<String>,
    pub max_descriptor_bytes: usize,
    pub allow_empty_harvest: bool,
    /// API host for `github:` sources on GitHub-compatible servers.
    pub github_api_base: Option<String>,
    pub github_raw_base: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: None,
            output_root: None,
            concurrency: DEFAULT_CONCURRENCY,
            limit: None,
            ignore_segments: DEFAULT_IGNORE_SEGMENTS.iter().map(|s| s.to_string()).collect(),
            schema_path: None,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            page_size: DEFAULT_PAGE_SIZE,
            descriptor_names: vec![crate::catalog::MANIFEST_FILE_NAME.to_string()],
            max_descriptor_bytes: DEFAULT_MAX_DESCRIPTOR_BYTES,
            allow_empty_harvest: false,
            github_api_base: None,
            github_raw_base: None,
        }
    }
}

impl SyncConfig {
    pub fn new(source: SourceRef, output_root: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source),
            output_root: Some(output_root.into()),
            ..Self::default()
        }
    }

    /// Read a JSON config file; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Check the record and return the source and output root it names.
    pub fn validate(&self) -> SyncResult<(&SourceRef, &Path)> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| SyncError::Config("no source configured".to_string()))?;
        let root = self
            .output_root
            .as_deref()
            .ok_or_else(|| SyncError::Config("no output root configured".to_string()))?;
        if root.as_os_str().is_empty() {
            return Err(SyncError::Config("output root is empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(SyncError::Config("fetch_timeout_secs must be at least 1".to_string()));
        }
        if self.descriptor_names.iter().all(|name| name.trim().is_empty()) {
            return Err(SyncError::Config("descriptor_names is empty".to_string()));
        }
        if self.descriptor_names.iter().any(|name| name.contains('/')) {
            return Err(SyncError::Config(
                "descriptor_names must be bare file names".to_string(),
            ));
        }
        Ok((source, root))
    }
}
