#![allow(dead_code)]

use anyhow::{Context, Result};
use catalogsync::catalog::SourceKind;
use catalogsync::error::{FetchError, FetchErrorKind, SyncError, SyncResult};
use catalogsync::{Origin, SourceRef, SyncConfig, Upstream};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::macros::datetime;

pub const OWNER: &str = "acme";
pub const REPO: &str = "servers";

pub fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn bundled_schema() -> PathBuf {
    repo_root().join("schema/manifest.schema.json")
}

/// Run timestamps one day apart, starting 2024-05-01.
pub fn day(n: i64) -> OffsetDateTime {
    datetime!(2024-05-01 12:00:00 UTC) + time::Duration::days(n)
}

/// Config pointing at `root` with the bundled schema and a fast, serial pool.
pub fn config_for(root: &Path) -> SyncConfig {
    let mut config = SyncConfig::new(
        SourceRef::Repository {
            owner: OWNER.to_string(),
            repo: REPO.to_string(),
            git_ref: "main".to_string(),
        },
        root,
    );
    config.schema_path = Some(bundled_schema());
    config.concurrency = 4;
    config
}

/// A repository descriptor for `name`.
pub fn descriptor(name: &str, version: &str) -> Value {
    json!({
        "name": name,
        "version": version,
        "description": format!("{name} server"),
        "mcp_registration": {
            "server": {"transport": "STDIO"},
            "tool": [{"id": format!("{name}.query")}],
        },
    })
}

enum Entry {
    Descriptor(Vec<u8>),
    Fails(FetchErrorKind),
}

/// In-memory repository upstream keyed by descriptor path.
#[derive(Default)]
pub struct FixtureUpstream {
    entries: BTreeMap<String, Entry>,
    discovery_fails: bool,
}

impl FixtureUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// `subdir/manifest.json` serving `value`. An empty `subdir` is the repository root.
    pub fn with(mut self, subdir: &str, value: Value) -> Self {
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        self.entries.insert(descriptor_path(subdir), Entry::Descriptor(bytes));
        self
    }

    pub fn with_raw(mut self, subdir: &str, raw: &str) -> Self {
        self.entries
            .insert(descriptor_path(subdir), Entry::Descriptor(raw.as_bytes().to_vec()));
        self
    }

    pub fn failing(mut self, subdir: &str, kind: FetchErrorKind) -> Self {
        self.entries.insert(descriptor_path(subdir), Entry::Fails(kind));
        self
    }

    pub fn without(mut self, subdir: &str) -> Self {
        self.entries.remove(&descriptor_path(subdir));
        self
    }

    pub fn discovery_fails(mut self) -> Self {
        self.discovery_fails = true;
        self
    }

    /// `count` servers under `servers/server-NNN`.
    pub fn numbered(count: usize) -> Self {
        (0..count).fold(Self::new(), |upstream, n| {
            let name = format!("server-{n:03}");
            upstream.with(&format!("servers/{name}"), descriptor(&name, "1.0.0"))
        })
    }

    fn origin(path: &str) -> Origin {
        let subpath = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        Origin {
            owner: OWNER.to_string(),
            repo: REPO.to_string(),
            subpath: subpath.to_string(),
            discovery_path: path.to_string(),
            locator: format!("fixture://{OWNER}/{REPO}/{path}"),
            source: SourceKind::Repository,
            source_url: format!("https://github.com/{OWNER}/{REPO}"),
            git_ref: Some("main".to_string()),
        }
    }
}

fn descriptor_path(subdir: &str) -> String {
    if subdir.is_empty() {
        "manifest.json".to_string()
    } else {
        format!("{subdir}/manifest.json")
    }
}

impl Upstream for FixtureUpstream {
    fn describe(&self) -> String {
        format!("github:{OWNER}/{REPO}@main")
    }

    fn discover(&self) -> SyncResult<Vec<Origin>> {
        if self.discovery_fails {
            return Err(SyncError::Discovery {
                source_ref: self.describe(),
                message: "listing unavailable".to_string(),
            });
        }
        Ok(self.entries.keys().map(|path| Self::origin(path)).collect())
    }

    fn fetch(&self, origin: &Origin) -> Result<Vec<u8>, FetchError> {
        match self.entries.get(&origin.discovery_path) {
            Some(Entry::Descriptor(bytes)) => Ok(bytes.clone()),
            Some(Entry::Fails(kind)) => Err(FetchError::new(&origin.locator, kind.clone())),
            None => Err(FetchError::new(
                &origin.locator,
                FetchErrorKind::Status { status: 404 },
            )),
        }
    }
}

/// Every file under `root`, keyed by relative path, for byte comparisons.
pub fn read_tree(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    collect(root, root, &mut files)?;
    Ok(files)
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)?
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(relative, fs::read(&path)?);
        }
    }
    Ok(())
}

pub fn read_json(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// The committed manifest for `subdir` as raw JSON.
pub fn manifest_at(root: &Path, variant: &str) -> Result<Value> {
    read_json(&root.join(format!("{OWNER}-{REPO}/{variant}/manifest.json")))
}

pub fn status_of(root: &Path, variant: &str) -> Result<String> {
    Ok(manifest_at(root, variant)?["lifecycle"]["status"]
        .as_str()
        .unwrap_or_default()
        .to_string())
}

pub fn index_ids(root: &Path) -> Result<Vec<String>> {
    let index = read_json(&root.join("index.json"))?;
    Ok(index["entries"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default())
}
