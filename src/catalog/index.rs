//! The catalog index: a ledger mapping canonical id to manifest path for
//! active records only.
//!
//! Building the index is intentionally strict. Paths must be plain relative
//! paths and ids must be unique; both are guaranteed upstream, but a ledger
//! that downstream consumers ingest blindly gets re-checked before it is
//! written.

use super::store::{render_json, write_atomic};
use super::{CanonicalId, Snapshot, Status, is_plain_relative, is_url_shaped};
use crate::error::{IndexIntegrityError, IndexProblem, SyncResult};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use time::OffsetDateTime;

/// File name of the ledger at the catalog root.
pub const INDEX_FILE_NAME: &str = "index.json";
/// Version marker written into the ledger.
pub const INDEX_SCHEMA_VERSION: &str = "catalog_index_v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: CanonicalId,
    pub path: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCounts {
    pub total: usize,
    pub active: usize,
    pub deprecated: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogIndex {
    pub schema_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub source: String,
    pub counts: IndexCounts,
    pub entries: Vec<IndexEntry>,
}

impl CatalogIndex {
    /// Build the ledger for `snapshot`: one entry per active record, sorted
    /// by canonical id.
    pub fn build(
        snapshot: &Snapshot,
        source: &str,
        generated_at: OffsetDateTime,
    ) -> Result<Self, IndexIntegrityError> {
        let pairs = snapshot
            .active()
            .map(|stored| (stored.record.id.clone(), stored.path.as_str().to_string()));
        let entries = build_entries(pairs)?;
        Ok(Self {
            schema_version: INDEX_SCHEMA_VERSION.to_string(),
            generated_at,
            source: source.to_string(),
            counts: IndexCounts {
                total: snapshot.len(),
                active: snapshot.count(Status::Active),
                deprecated: snapshot.count(Status::Deprecated),
            },
            entries,
        })
    }

    /// Load a ledger from disk and verify its version marker.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading catalog index {}", path.display()))?;
        let index: CatalogIndex = serde_json::from_str(&data)
            .with_context(|| format!("parsing catalog index {}", path.display()))?;
        if index.schema_version != INDEX_SCHEMA_VERSION {
            bail!(
                "unsupported catalog index version '{}', expected {}",
                index.schema_version,
                INDEX_SCHEMA_VERSION
            );
        }
        Ok(index)
    }

    /// Indexed ids in ledger order.
    pub fn ids(&self) -> impl Iterator<Item = &CanonicalId> {
        self.entries.iter().map(|entry| &entry.id)
    }
}

/// Check and sort `(id, path)` pairs into index entries.
///
/// Every problem is collected so one failed build reports all offenders.
pub fn build_entries(
    pairs: impl IntoIterator<Item = (CanonicalId, String)>,
) -> Result<Vec<IndexEntry>, IndexIntegrityError> {
    let mut problems = Vec::new();
    let mut seen: BTreeSet<CanonicalId> = BTreeSet::new();
    let mut entries = Vec::new();

    for (id, path) in pairs {
        if !seen.insert(id.clone()) {
            problems.push(IndexProblem::DuplicateId { id });
            continue;
        }
        if is_url_shaped(&path) {
            problems.push(IndexProblem::UrlShapedPath { id, path });
            continue;
        }
        if !is_plain_relative(&path) {
            problems.push(IndexProblem::NonRelativePath { id, path });
            continue;
        }
        entries.push(IndexEntry { id, path });
    }

    if !problems.is_empty() {
        return Err(IndexIntegrityError { problems });
    }
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(entries)
}

/// Replace `<root>/index.json` atomically.
pub fn write_index_atomic(root: &Path, index: &CatalogIndex) -> SyncResult<()> {
    let bytes = render_json(index, &root.join(INDEX_FILE_NAME))?;
    write_atomic(&root.join(INDEX_FILE_NAME), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> CanonicalId {
        CanonicalId(raw.to_string())
    }

    #[test]
    fn entries_are_sorted_by_id() {
        let entries = build_entries(vec![
            (id("mcp.b.b.root"), "b-b/root/manifest.json".to_string()),
            (id("mcp.a.a.root"), "a-a/root/manifest.json".to_string()),
        ])
        .unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["mcp.a.a.root", "mcp.b.b.root"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = build_entries(vec![
            (id("mcp.a.a.root"), "a-a/root/manifest.json".to_string()),
            (id("mcp.a.a.root"), "a-a/other/manifest.json".to_string()),
        ])
        .unwrap_err();
        assert_eq!(
            err.problems,
            vec![IndexProblem::DuplicateId {
                id: id("mcp.a.a.root")
            }]
        );
    }

    #[test]
    fn url_and_absolute_paths_are_rejected() {
        let err = build_entries(vec![
            (id("mcp.a"), "https://github.com/a/a".to_string()),
            (id("mcp.b"), "/srv/catalog/b/manifest.json".to_string()),
            (id("mcp.c"), "c/../../manifest.json".to_string()),
        ])
        .unwrap_err();
        assert_eq!(err.problems.len(), 3);
        assert!(matches!(err.problems[0], IndexProblem::UrlShapedPath { .. }));
        assert!(matches!(err.problems[1], IndexProblem::NonRelativePath { .. }));
        assert!(matches!(err.problems[2], IndexProblem::NonRelativePath { .. }));
    }
}
