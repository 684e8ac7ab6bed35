//! Catalog sync engine.
//!
//! Harvests service descriptors from a registry API or a repository tree,
//! normalizes them into canonical manifest records, merges them into the
//! previously committed catalog with active/deprecated lifecycle tracking,
//! writes an index of the active records, and validates the result before it
//! replaces the live catalog.

pub mod catalog;
pub mod config;
pub mod error;
pub mod harvest;
pub mod lifecycle;
pub mod normalize;
pub mod observability;
pub mod sync;
pub mod validate;

pub use catalog::{
    CanonicalId, CatalogIndex, CatalogPath, ManifestRecord, Snapshot, Status, load_snapshot,
};
pub use config::{SourceRef, SyncConfig};
pub use error::{FetchError, FetchErrorKind, SyncError, SyncResult};
pub use harvest::{Origin, SourceCandidate, Upstream};
pub use sync::{SyncOutcome, run_sync, upstream_for};
pub use validate::{ManifestSchema, ValidationReport, validate_catalog};

use anyhow::{Result, bail};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Bundled manifest schema, relative to the install root.
pub const SCHEMA_RELATIVE_PATH: &str = "schema/manifest.schema.json";

fn is_install_root(candidate: &Path) -> bool {
    candidate.join(SCHEMA_RELATIVE_PATH).is_file()
}

fn install_root_from_hint(hint: &str) -> Option<PathBuf> {
    if hint.is_empty() {
        return None;
    }
    let hint_path = PathBuf::from(hint);
    if !hint_path.exists() || !is_install_root(&hint_path) {
        return None;
    }
    fs::canonicalize(hint_path).ok()
}

fn search_upwards(start: &Path) -> Option<PathBuf> {
    let mut dir = fs::canonicalize(start).ok()?;
    loop {
        if is_install_root(&dir) {
            return Some(dir);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

/// Locate the directory holding the bundled `schema/`.
///
/// Checks `CATALOG_SYNC_ROOT`, then the executable's ancestors, then the
/// root baked in at build time.
pub fn find_install_root() -> Result<PathBuf> {
    if let Ok(env_root) = env::var("CATALOG_SYNC_ROOT") {
        if let Some(root) = install_root_from_hint(&env_root) {
            return Ok(root);
        }
    }

    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            if let Some(root) = search_upwards(exe_dir) {
                return Ok(root);
            }
        }
    }

    if let Some(hint) = option_env!("CATALOG_SYNC_ROOT_HINT") {
        if let Some(root) = install_root_from_hint(hint) {
            return Ok(root);
        }
    }

    bail!(
        "Unable to locate the catalogsync install root. Set CATALOG_SYNC_ROOT or pass --schema."
    );
}

/// Schema to validate against when no flag, env var or config names one.
pub fn default_schema_path() -> Result<PathBuf> {
    Ok(find_install_root()?.join(SCHEMA_RELATIVE_PATH))
}

/// Split a comma- or whitespace-separated flag value.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .replace(',', " ")
        .split_whitespace()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
