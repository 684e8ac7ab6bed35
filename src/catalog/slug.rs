//! Deterministic slugging for canonical ids and catalog paths.
//!
//! Every function here is pure: the same origin tuple always yields the same
//! id and path, and re-slugging an already slugged value is a no-op.

use super::{CanonicalId, CatalogPath};

/// File name every variant directory holds exactly once.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const ROOT_VARIANT: &str = "root";
const VARIANT_JOINER: &str = "__";

/// Slug one path segment: lowercase `[a-z0-9_]`, other runs become a single
/// `-`, outer dashes trimmed, empty input becomes `unknown`.
pub fn slug_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// Slug each `/`-separated segment of a relative path, dropping empty and
/// `.` segments.
pub fn slug_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(|segment| {
            // Keep the manifest file name intact so catalog paths are fixed points.
            if segment == MANIFEST_FILE_NAME {
                segment.to_string()
            } else {
                slug_segment(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Directory name for one harvested subpath within an (owner, repo) group.
pub fn variant_for_subpath(subpath: &str) -> String {
    let segments: Vec<String> = subpath
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(slug_segment)
        .collect();
    if segments.is_empty() {
        ROOT_VARIANT.to_string()
    } else {
        segments.join(VARIANT_JOINER)
    }
}

/// Group directory for an (owner, repo) pair.
pub fn group_for(owner: &str, repo: &str) -> String {
    format!("{}-{}", slug_segment(owner), slug_segment(repo))
}

/// Canonical id: `mcp.<owner>.<repo>.<variant>`, composed from the slugged
/// identity fields.
pub fn canonical_id(owner: &str, repo: &str, subpath: &str) -> CanonicalId {
    CanonicalId(format!(
        "mcp.{}.{}.{}",
        slug_segment(owner),
        slug_segment(repo),
        variant_for_subpath(subpath)
    ))
}

/// Relative manifest path: `<owner>-<repo>/<variant>/manifest.json`.
pub fn catalog_path(owner: &str, repo: &str, subpath: &str) -> CatalogPath {
    CatalogPath::from_slugged(format!(
        "{}/{}/{}",
        group_for(owner, repo),
        variant_for_subpath(subpath),
        MANIFEST_FILE_NAME
    ))
}
