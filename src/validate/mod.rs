//! Catalog validation gate.
//!
//! Three independent checks run over a catalog tree as it exists on disk:
//! structure (layout and record shapes), schema (the caller's JSON Schema)
//! and index integrity (the ledger agrees with the records). They read raw
//! JSON rather than trusting the engine's own types, so they catch problems
//! in hand-edited trees as well as engine bugs.

pub mod schema;

pub use schema::ManifestSchema;

use crate::catalog::{
    CanonicalId, CatalogIndex, INDEX_FILE_NAME, MANIFEST_FILE_NAME, MANIFEST_KIND,
    MANIFEST_SCHEMA_VERSION, ManifestRecord, catalog_path, is_plain_relative, is_url_shaped,
};
use crate::error::{
    Check, IndexIntegrityError, IndexProblem, SyncError, SyncResult, ValidationFailure, Violation,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// One manifest file found on disk, keyed by its relative path.
#[derive(Debug)]
pub struct ScannedManifest {
    pub path: String,
    pub value: Value,
}

/// Everything the scan found, including layout problems.
#[derive(Debug, Default)]
pub struct CatalogScan {
    pub manifests: Vec<ScannedManifest>,
    pub layout: Vec<Violation>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationReport {
    pub root: String,
    pub manifests: usize,
    pub indexed: usize,
    pub schema_checked: bool,
    pub violations: Vec<Violation>,
    pub index_problems: Vec<IndexProblem>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.index_problems.is_empty()
    }

    /// Convert a failing report into the run error that gates publication.
    pub fn into_result(self) -> SyncResult<Self> {
        if !self.index_problems.is_empty() {
            return Err(SyncError::IndexIntegrity(IndexIntegrityError {
                problems: self.index_problems,
            }));
        }
        if !self.violations.is_empty() {
            return Err(SyncError::SchemaViolation(ValidationFailure {
                violations: self.violations,
            }));
        }
        Ok(self)
    }
}

/// Run every check over the tree at `root`. The schema check is skipped when
/// no schema is supplied.
pub fn validate_catalog(root: &Path, schema: Option<&ManifestSchema>) -> ValidationReport {
    let scan = scan_catalog(root);
    let mut violations = scan.layout.clone();
    violations.extend(check_structure(&scan.manifests));
    if let Some(schema) = schema {
        violations.extend(check_schema(schema, &scan.manifests));
    }
    let (indexed, index_problems) = check_index_integrity(root, &scan.manifests);

    let report = ValidationReport {
        root: root.display().to_string(),
        manifests: scan.manifests.len(),
        indexed,
        schema_checked: schema.is_some(),
        violations,
        index_problems,
    };
    if report.passed() {
        debug!(root = %report.root, manifests = report.manifests, "catalog validated");
    } else {
        warn!(
            root = %report.root,
            violations = report.violations.len(),
            index_problems = report.index_problems.len(),
            "catalog failed validation"
        );
    }
    report
}

/// Walk `<root>/<group>/<variant>/manifest.json`, reporting anything else.
pub fn scan_catalog(root: &Path) -> CatalogScan {
    let mut scan = CatalogScan::default();
    for (group_name, group) in list_dir(root, "", &mut scan.layout) {
        if group_name.starts_with('.') || group_name == INDEX_FILE_NAME {
            continue;
        }
        if !group.is_dir() {
            scan.layout.push(layout(&group_name, "unexpected file in catalog root"));
            continue;
        }
        for (variant_name, variant) in list_dir(&group, &group_name, &mut scan.layout) {
            let variant_rel = format!("{group_name}/{variant_name}");
            if variant_name.starts_with('.') {
                continue;
            }
            if !variant.is_dir() {
                scan.layout.push(layout(&variant_rel, "unexpected file in group directory"));
                continue;
            }
            let mut found = false;
            for (file_name, file) in list_dir(&variant, &variant_rel, &mut scan.layout) {
                if file_name.starts_with('.') {
                    continue;
                }
                let rel = format!("{variant_rel}/{file_name}");
                if file_name != MANIFEST_FILE_NAME || !file.is_file() {
                    scan.layout.push(layout(&rel, "unexpected entry in variant directory"));
                    continue;
                }
                found = true;
                let parsed = fs::read(&file)
                    .map_err(|err| err.to_string())
                    .and_then(|bytes| {
                        serde_json::from_slice::<Value>(&bytes).map_err(|err| err.to_string())
                    });
                match parsed {
                    Ok(value) => scan.manifests.push(ScannedManifest { path: rel, value }),
                    Err(message) => scan.layout.push(layout(&rel, &message)),
                }
            }
            if !found {
                scan.layout.push(layout(&variant_rel, "variant directory holds no manifest"));
            }
        }
    }
    scan
}

fn list_dir(
    dir: &Path,
    rel: &str,
    problems: &mut Vec<Violation>,
) -> Vec<(String, std::path::PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            let shown = if rel.is_empty() { "." } else { rel };
            problems.push(layout(shown, &format!("unreadable directory: {err}")));
            return Vec::new();
        }
    };
    let mut out: Vec<_> = entries
        .flatten()
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    out.sort();
    out
}

fn layout(path: &str, message: &str) -> Violation {
    Violation {
        check: Check::Structure,
        path: path.to_string(),
        pointer: String::new(),
        message: message.to_string(),
    }
}

/// Every manifest must decode as a record, carry the expected markers, sit
/// at the path its provenance implies, and hold an id no other file holds.
pub fn check_structure(manifests: &[ScannedManifest]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut holders: BTreeMap<String, &str> = BTreeMap::new();

    for manifest in manifests {
        let structure = |pointer: &str, message: String| Violation {
            check: Check::Structure,
            path: manifest.path.clone(),
            pointer: pointer.to_string(),
            message,
        };
        let record: ManifestRecord = match serde_json::from_value(manifest.value.clone()) {
            Ok(record) => record,
            Err(err) => {
                violations.push(structure("", format!("not a manifest record: {err}")));
                continue;
            }
        };
        if record.schema_version != MANIFEST_SCHEMA_VERSION {
            violations.push(structure(
                "/schema_version",
                format!("expected {MANIFEST_SCHEMA_VERSION}, found {}", record.schema_version),
            ));
        }
        if record.kind != MANIFEST_KIND {
            violations.push(structure(
                "/type",
                format!("expected {MANIFEST_KIND}, found {}", record.kind),
            ));
        }
        if !is_fingerprint(&record.fingerprint) {
            violations.push(structure("/fingerprint", "expected sha256:<64 hex>".to_string()));
        }
        let provenance = &record.content.provenance;
        let expected = catalog_path(&provenance.owner, &provenance.repo, &provenance.subpath);
        if expected.as_str() != manifest.path {
            violations.push(structure(
                "/provenance",
                format!("provenance implies path {expected}"),
            ));
        }
        if let Some(other) = holders.insert(record.id.to_string(), &manifest.path) {
            violations.push(structure("/id", format!("id {} also held by {other}", record.id)));
        }
    }
    violations
}

fn is_fingerprint(raw: &str) -> bool {
    raw.strip_prefix("sha256:")
        .map(|hex| hex.len() == 64 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')))
        .unwrap_or(false)
}

pub fn check_schema(schema: &ManifestSchema, manifests: &[ScannedManifest]) -> Vec<Violation> {
    manifests
        .iter()
        .flat_map(|manifest| schema.violations(&manifest.path, &manifest.value))
        .collect()
}

/// Compare the ledger against the records. Returns the number of index
/// entries alongside any problems.
pub fn check_index_integrity(
    root: &Path,
    manifests: &[ScannedManifest],
) -> (usize, Vec<IndexProblem>) {
    let index = match CatalogIndex::load(&root.join(INDEX_FILE_NAME)) {
        Ok(index) => index,
        Err(err) => {
            return (
                0,
                vec![IndexProblem::Unreadable {
                    message: format!("{err:#}"),
                }],
            );
        }
    };

    let by_path: BTreeMap<&str, &Value> = manifests
        .iter()
        .map(|manifest| (manifest.path.as_str(), &manifest.value))
        .collect();
    let active: BTreeSet<CanonicalId> = manifests
        .iter()
        .filter(|manifest| {
            manifest.value.pointer("/lifecycle/status").and_then(Value::as_str) == Some("active")
        })
        .filter_map(|manifest| manifest.value.get("id").and_then(Value::as_str))
        .map(|id| CanonicalId(id.to_string()))
        .collect();

    let mut problems = Vec::new();
    let mut seen = BTreeSet::new();
    let mut flagged = BTreeSet::new();
    for entry in &index.entries {
        let id = entry.id.clone();
        let path = entry.path.clone();
        if !seen.insert(id.clone()) {
            problems.push(IndexProblem::DuplicateId { id });
            continue;
        }
        if is_url_shaped(&path) {
            flagged.insert(id.clone());
            problems.push(IndexProblem::UrlShapedPath { id, path });
            continue;
        }
        if !is_plain_relative(&path) {
            flagged.insert(id.clone());
            problems.push(IndexProblem::NonRelativePath { id, path });
            continue;
        }
        match by_path.get(path.as_str()) {
            None => {
                flagged.insert(id.clone());
                problems.push(IndexProblem::MissingOnDisk { id, path });
            }
            Some(value) => {
                let found = value.get("id").and_then(Value::as_str).unwrap_or_default();
                if found != id.as_str() {
                    flagged.insert(id.clone());
                    problems.push(IndexProblem::IdMismatch {
                        id,
                        path,
                        found: found.to_string(),
                    });
                }
            }
        }
    }

    for id in active.difference(&seen) {
        problems.push(IndexProblem::ActiveNotIndexed { id: id.clone() });
    }
    for id in seen.difference(&active) {
        if !flagged.contains(id) {
            problems.push(IndexProblem::IndexedNotActive { id: id.clone() });
        }
    }
    (index.entries.len(), problems)
}
