//! Catalog model.
//!
//! A catalog is a root directory holding one `<owner>-<repo>/<variant>/manifest.json`
//! file per logical server plus a single `index.json` ledger of the active
//! ones. Types here mirror the on-disk JSON; [`Snapshot`] is the in-memory
//! view the lifecycle merge consumes and produces, [`store`] moves snapshots
//! to and from disk, and [`index`] builds the ledger.

pub mod index;
pub mod slug;
pub mod store;

pub use index::{CatalogIndex, IndexCounts, IndexEntry, INDEX_FILE_NAME, INDEX_SCHEMA_VERSION};
pub use slug::{MANIFEST_FILE_NAME, canonical_id, catalog_path, slug_path, slug_segment};
pub use store::{CommitReport, StagedCatalog, load_snapshot, recover_interrupted, stage_catalog};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use time::{OffsetDateTime, UtcOffset};

/// Version marker written into every manifest file.
pub const MANIFEST_SCHEMA_VERSION: &str = "catalog_manifest_v1";
/// Entity type written into every manifest file.
pub const MANIFEST_KIND: &str = "mcp_server";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Stable unique identifier of one logical server.
pub struct CanonicalId(pub String);

impl CanonicalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Manifest location relative to the catalog root, `/`-separated.
pub struct CatalogPath(String);

impl CatalogPath {
    pub(crate) fn from_slugged(path: String) -> Self {
        Self(path)
    }

    /// Accept a path read back from disk or an index file.
    ///
    /// Rejects URL-shaped, absolute, and parent-escaping paths so a
    /// `CatalogPath` can always be joined onto the catalog root safely.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if is_url_shaped(raw) {
            return Err(format!("path is URL-shaped: {raw}"));
        }
        if !is_plain_relative(raw) {
            return Err(format!("path is not a plain relative path: {raw}"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory holding the manifest, relative to the catalog root.
    pub fn variant_dir(&self) -> &str {
        self.0
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or_default()
    }

    pub fn resolve(&self, root: &Path) -> std::path::PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
    }
}

impl fmt::Display for CatalogPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when `raw` carries a URL scheme (`http://`, `file:`, ...).
pub fn is_url_shaped(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.starts_with("//") {
        return true;
    }
    match lowered.split_once(':') {
        Some((scheme, _)) => {
            scheme.len() > 1
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// True when `raw` is non-empty, relative, and never climbs above its root.
pub fn is_plain_relative(raw: &str) -> bool {
    if raw.is_empty() || raw.contains('\\') || !Path::new(raw).is_relative() {
        return false;
    }
    raw.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Deprecated,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Deprecated => "deprecated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deprecated_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub reactivated_at: Option<OffsetDateTime>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Registry,
    Repository,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Registry => "registry",
            SourceKind::Repository => "repository",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Where a record was harvested from.
pub struct Provenance {
    pub source: SourceKind,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub subpath: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Normalized descriptor fields; the fingerprint is computed over exactly this.
pub struct ManifestContent {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    pub provenance: Provenance,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// The persisted entity: one per logical server, never deleted.
pub struct ManifestRecord {
    pub schema_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: CanonicalId,
    #[serde(flatten)]
    pub content: ManifestContent,
    pub fingerprint: String,
    pub lifecycle: Lifecycle,
}

impl ManifestRecord {
    pub fn status(&self) -> Status {
        self.lifecycle.status
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.status == Status::Active
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A record together with the path it occupies in the catalog tree.
pub struct StoredRecord {
    pub path: CatalogPath,
    pub record: ManifestRecord,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Complete catalog state keyed by canonical id.
pub struct Snapshot {
    records: BTreeMap<CanonicalId, StoredRecord>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it displaced.
    pub fn insert(&mut self, stored: StoredRecord) -> Option<StoredRecord> {
        self.records.insert(stored.record.id.clone(), stored)
    }

    pub fn get(&self, id: &CanonicalId) -> Option<&StoredRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &CanonicalId) -> bool {
        self.records.contains_key(id)
    }

    /// Records in canonical-id order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CanonicalId> {
        self.records.keys()
    }

    pub fn active(&self) -> impl Iterator<Item = &StoredRecord> {
        self.records.values().filter(|stored| stored.record.is_active())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, status: Status) -> usize {
        self.records
            .values()
            .filter(|stored| stored.record.status() == status)
            .count()
    }
}

/// Normalize a run timestamp to UTC with whole-second precision.
pub fn run_timestamp(at: OffsetDateTime) -> OffsetDateTime {
    let utc = at.to_offset(UtcOffset::UTC);
    utc.replace_nanosecond(0).unwrap_or(utc)
}
