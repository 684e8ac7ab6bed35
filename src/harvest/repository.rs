//! Repository-tree upstream for GitHub-compatible hosts.
//!
//! One recursive tree listing finds every descriptor file; each descriptor
//! is then fetched from the raw-content host. A truncated listing is treated
//! as a discovery failure, since fetching a partial tree would deprecate the
//! servers that happened to fall off the end.

use super::{HttpClient, Origin, Upstream};
use crate::catalog::SourceKind;
use crate::error::{FetchError, SyncError, SyncResult};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";

#[derive(Debug, Deserialize)]
struct TreeListing {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryRef {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
}

pub struct RepositoryUpstream {
    target: RepositoryRef,
    api_base: String,
    raw_base: String,
    descriptor_names: Vec<String>,
    client: HttpClient,
}

impl RepositoryUpstream {
    pub fn new(target: RepositoryRef, client: HttpClient, descriptor_names: Vec<String>) -> Self {
        Self {
            target,
            api_base: DEFAULT_API_BASE.to_string(),
            raw_base: DEFAULT_RAW_BASE.to_string(),
            descriptor_names,
            client,
        }
    }

    /// Point at a GitHub-compatible host other than github.com.
    pub fn with_bases(mut self, api_base: &str, raw_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.raw_base = raw_base.trim_end_matches('/').to_string();
        self
    }

    fn tree_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/git/trees/{}",
            self.api_base, self.target.owner, self.target.repo, self.target.git_ref
        )
    }

    fn raw_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_base, self.target.owner, self.target.repo, self.target.git_ref, path
        )
    }

    fn is_descriptor(&self, path: &str) -> bool {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        self.descriptor_names.iter().any(|name| name == file_name)
    }

    pub(crate) fn origin_for(&self, path: &str) -> Origin {
        let subpath = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        Origin {
            owner: self.target.owner.clone(),
            repo: self.target.repo.clone(),
            subpath: subpath.to_string(),
            discovery_path: path.to_string(),
            locator: self.raw_url(path),
            source: SourceKind::Repository,
            source_url: format!(
                "https://github.com/{}/{}",
                self.target.owner, self.target.repo
            ),
            git_ref: Some(self.target.git_ref.clone()),
        }
    }
}

impl Upstream for RepositoryUpstream {
    fn describe(&self) -> String {
        format!(
            "github:{}/{}@{}",
            self.target.owner, self.target.repo, self.target.git_ref
        )
    }

    fn discover(&self) -> SyncResult<Vec<Origin>> {
        let listing: TreeListing = self
            .client
            .for_listing()
            .get_json(&self.tree_url(), &[("recursive", "1")])
            .map_err(|err| SyncError::Discovery {
                source_ref: self.describe(),
                message: err.to_string(),
            })?;
        if listing.truncated {
            return Err(SyncError::Discovery {
                source_ref: self.describe(),
                message: "tree listing was truncated by the host".to_string(),
            });
        }

        let origins: Vec<Origin> = listing
            .tree
            .iter()
            .filter(|entry| entry.kind == "blob" && self.is_descriptor(&entry.path))
            .map(|entry| self.origin_for(&entry.path))
            .collect();
        info!(
            entries = listing.tree.len(),
            descriptors = origins.len(),
            "repository tree listed"
        );
        Ok(origins)
    }

    fn fetch(&self, origin: &Origin) -> Result<Vec<u8>, FetchError> {
        self.client.get_bytes(&origin.locator, &[])
    }
}
