//! Paginated registry API upstream.
//!
//! Listing walks `GET /v0.1/servers` with `cursor`/`nextCursor` until the
//! registry stops returning a cursor. Entries naming the same server are
//! collapsed to the highest version. Each listed server is then fetched
//! individually from `/v0.1/servers/{name}/versions/{version}` so the
//! descriptor goes through the same bounded, retried fetch path as any other
//! candidate. An entry without a version has no such endpoint; its listing
//! body is kept and served as the descriptor.

use super::{HttpClient, Origin, Upstream};
use crate::catalog::SourceKind;
use crate::error::{FetchError, SyncError, SyncResult};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{debug, info};

const OFFICIAL_META_KEY: &str = "io.modelcontextprotocol.registry/official";
const DELETED_STATUS: &str = "deleted";

#[derive(Debug, Deserialize)]
struct ServerPage {
    #[serde(default, alias = "items")]
    servers: Vec<Value>,
    #[serde(default)]
    metadata: PageMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PageMetadata {
    #[serde(default, alias = "next_cursor", rename = "nextCursor")]
    next_cursor: Option<String>,
}

/// A listed server reduced to what discovery needs.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ListedServer {
    pub name: String,
    pub version: Option<String>,
}

pub struct RegistryUpstream {
    base_url: String,
    client: HttpClient,
    page_size: usize,
    /// Listing bodies of version-less entries, keyed by locator.
    inline: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl RegistryUpstream {
    pub fn new(base_url: &str, client: HttpClient, page_size: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            page_size: page_size.max(1),
            inline: Mutex::new(BTreeMap::new()),
        }
    }

    fn list_url(&self) -> String {
        format!("{}/v0.1/servers", self.base_url)
    }

    fn version_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/v0.1/servers/{}/versions/{}",
            self.base_url,
            encode_path_segment(name),
            encode_path_segment(version)
        )
    }

    fn inline_url(&self, name: &str) -> String {
        format!("{}#{}", self.list_url(), encode_path_segment(name))
    }

    fn origin_for(&self, server: &ListedServer) -> Origin {
        let (owner, repo) = match server.name.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                (namespace.to_string(), name.to_string())
            }
            _ => (server.name.clone(), server.name.clone()),
        };
        Origin {
            owner,
            repo,
            subpath: String::new(),
            discovery_path: server.name.clone(),
            locator: match &server.version {
                Some(version) => self.version_url(&server.name, version),
                None => self.inline_url(&server.name),
            },
            source: SourceKind::Registry,
            source_url: self.base_url.clone(),
            git_ref: None,
        }
    }

    fn discovery_error(&self, message: String) -> SyncError {
        SyncError::Discovery {
            source_ref: self.describe(),
            message,
        }
    }
}

impl Upstream for RegistryUpstream {
    fn describe(&self) -> String {
        format!("registry:{}", self.base_url)
    }

    fn discover(&self) -> SyncResult<Vec<Origin>> {
        let url = self.list_url();
        let page_size = self.page_size.to_string();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = BTreeSet::new();
        let mut latest: BTreeMap<String, (ListedServer, Vec<u8>)> = BTreeMap::new();
        let mut listed = 0usize;
        let mut pages = 0usize;
        let listing = self.client.for_listing();

        loop {
            let mut query = vec![("limit", page_size.as_str()), ("version", "latest")];
            if let Some(cursor) = cursor.as_deref() {
                query.push(("cursor", cursor));
            }
            let page: ServerPage = listing
                .get_json(&url, &query)
                .map_err(|err| self.discovery_error(err.to_string()))?;
            pages += 1;

            for entry in &page.servers {
                let Some(server) = listed_server(entry) else {
                    debug!("skipping deleted or nameless registry entry");
                    continue;
                };
                listed += 1;
                let newer = latest.get(&server.name).is_none_or(|(kept, _)| {
                    compare_versions(server.version.as_deref(), kept.version.as_deref())
                        != Ordering::Less
                });
                if newer {
                    let body = serde_json::to_vec(entry).unwrap_or_default();
                    latest.insert(server.name.clone(), (server, body));
                }
            }

            match page.metadata.next_cursor.filter(|next| !next.is_empty()) {
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        return Err(self.discovery_error(format!(
                            "registry returned cursor {next:?} twice"
                        )));
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        let mut inline = BTreeMap::new();
        let origins: Vec<Origin> = latest
            .into_values()
            .map(|(server, body)| {
                let origin = self.origin_for(&server);
                if server.version.is_none() {
                    inline.insert(origin.locator.clone(), body);
                }
                origin
            })
            .collect();
        match self.inline.lock() {
            Ok(mut guard) => *guard = inline,
            Err(poisoned) => *poisoned.into_inner() = inline,
        }

        info!(
            pages,
            listed,
            servers = origins.len(),
            "registry listing complete"
        );
        Ok(origins)
    }

    fn fetch(&self, origin: &Origin) -> Result<Vec<u8>, FetchError> {
        let held = match self.inline.lock() {
            Ok(guard) => guard.get(&origin.locator).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&origin.locator).cloned(),
        };
        match held {
            Some(body) => Ok(body),
            None => self.client.get_bytes(&origin.locator, &[]),
        }
    }
}

/// Name and version of a live listing entry; `None` for deleted entries.
pub(crate) fn listed_server(entry: &Value) -> Option<ListedServer> {
    let server = entry.get("server").unwrap_or(entry);
    let meta = entry.get("_meta");
    let status = meta
        .and_then(|meta| meta.get(OFFICIAL_META_KEY))
        .and_then(|official| official.get("status"))
        .or_else(|| meta.and_then(|meta| meta.get("status")))
        .and_then(Value::as_str);
    if status.is_some_and(|status| status.eq_ignore_ascii_case(DELETED_STATUS)) {
        return None;
    }

    let name = server
        .get("name")
        .or_else(|| server.get("serverName"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())?;
    let version = server
        .get("version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty());
    Some(ListedServer {
        name: name.to_string(),
        version: version.map(str::to_string),
    })
}

/// Order versions semver-style: dotted core segments compare numerically
/// where both are numbers, a pre-release sorts below its release, and build
/// metadata is ignored. A missing version sorts below any version.
pub(crate) fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        (a, b) => return a.is_some().cmp(&b.is_some()),
    };
    let (a_core, a_pre) = split_version(a);
    let (b_core, b_pre) = split_version(b);
    compare_dotted(a_core, b_core).then_with(|| match (a_pre, b_pre) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => compare_dotted(x, y),
    })
}

fn split_version(raw: &str) -> (&str, Option<&str>) {
    let raw = raw.trim_start_matches('v');
    let raw = raw.split_once('+').map_or(raw, |(core, _)| core);
    match raw.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (raw, None),
    }
}

fn compare_dotted(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let step = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if step != Ordering::Equal {
                    return step;
                }
            }
        }
    }
}

fn encode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
