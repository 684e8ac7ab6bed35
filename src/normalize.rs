//! Candidate normalization and identity collision detection.
//!
//! Turns fetched descriptor bytes into [`ManifestContent`] plus the identity
//! (canonical id, catalog path) and content fingerprint the lifecycle merge
//! keys on. Everything here is a pure function of the candidate; nothing
//! reads the clock.

use crate::catalog::{CanonicalId, CatalogPath, ManifestContent, Snapshot, SourceKind, slug_segment};
use crate::error::{Collision, CollisionError, FetchError, FetchErrorKind};
use crate::harvest::{CandidateFailure, Origin, SourceCandidate};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

const DEFAULT_VERSION: &str = "0.0.0";

/// A candidate reduced to the fields the catalog persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedCandidate {
    pub id: CanonicalId,
    pub path: CatalogPath,
    pub content: ManifestContent,
    pub fingerprint: String,
    pub locator: String,
}

#[derive(Clone, Debug, Default)]
pub struct Normalized {
    pub records: Vec<NormalizedCandidate>,
    /// Candidates whose descriptor could not be interpreted.
    pub rejected: Vec<CandidateFailure>,
}

/// Normalize every fetched candidate. Malformed descriptors are rejected
/// individually and never fail the batch.
pub fn normalize_all(candidates: Vec<SourceCandidate>) -> Normalized {
    let mut out = Normalized::default();
    for candidate in candidates {
        match normalize_candidate(&candidate) {
            Ok(record) => out.records.push(record),
            Err(error) => {
                warn!(locator = %candidate.origin.locator, error = %error.kind, "descriptor rejected");
                out.rejected.push(CandidateFailure {
                    origin: candidate.origin,
                    error,
                });
            }
        }
    }
    out.records.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.locator.cmp(&b.locator)));
    out
}

pub fn normalize_candidate(candidate: &SourceCandidate) -> Result<NormalizedCandidate, FetchError> {
    let origin = &candidate.origin;
    let invalid = |message: String| {
        FetchError::new(
            origin.locator.clone(),
            FetchErrorKind::InvalidDescriptor { message },
        )
    };

    let value: Value = serde_json::from_slice(&candidate.descriptor)
        .map_err(|err| invalid(format!("descriptor is not valid JSON: {err}")))?;
    let Value::Object(object) = value else {
        return Err(invalid("descriptor is not a JSON object".to_string()));
    };

    let content = match origin.source {
        SourceKind::Registry => registry_content(origin, &object),
        SourceKind::Repository => repository_content(origin, &object),
    };
    let fingerprint =
        fingerprint(&content).map_err(|err| invalid(format!("encoding content: {err}")))?;
    Ok(NormalizedCandidate {
        id: origin.canonical_id(),
        path: origin.catalog_path(),
        content,
        fingerprint,
        locator: origin.locator.clone(),
    })
}

/// `sha256:<hex>` over the compact JSON encoding of `content`.
///
/// Field order is fixed by the struct and list fields are already sorted, so
/// equal content always hashes equally.
pub fn fingerprint(content: &ManifestContent) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(content)?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("sha256:{}", hex::encode(digest)))
}

fn registry_content(origin: &Origin, object: &Map<String, Value>) -> ManifestContent {
    let server = object
        .get("server")
        .and_then(Value::as_object)
        .unwrap_or(object);

    let remotes = array(server.get("remotes"));
    let packages = array(server.get("packages"));
    let transport = remotes
        .first()
        .map(|remote| {
            text(remote.get("transport"))
                .or_else(|| text(remote.get("type")))
                .and_then(|declared| canonical_transport(&declared))
                .unwrap_or("SSE")
                .to_string()
        })
        .or_else(|| (!packages.is_empty()).then(|| "STDIO".to_string()));

    let resources = packages
        .iter()
        .filter_map(|package| {
            let identifier = text(package.get("identifier"))?;
            Some(match text(package.get("registryType")) {
                Some(kind) => format!("{kind}:{identifier}"),
                None => identifier,
            })
        })
        .collect();

    ManifestContent {
        name: text(server.get("name")).unwrap_or_else(|| slug_segment(&origin.repo)),
        version: text(server.get("version")).unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        title: text(server.get("title")),
        description: text(server.get("description")),
        transport,
        tools: Vec::new(),
        resources: sorted_unique(resources),
        provenance: origin.provenance(),
    }
}

/// Map a declared transport name onto `SSE`, `WS` or `STDIO`.
fn canonical_transport(declared: &str) -> Option<&'static str> {
    match declared.trim().to_ascii_uppercase().replace('-', "_").as_str() {
        "SSE" | "HTTP" | "STREAMABLE_HTTP" => Some("SSE"),
        "WS" | "WEBSOCKET" => Some("WS"),
        "STDIO" => Some("STDIO"),
        _ => None,
    }
}

fn repository_content(origin: &Origin, object: &Map<String, Value>) -> ManifestContent {
    let registration = object.get("mcp_registration").and_then(Value::as_object);
    let server = registration
        .and_then(|reg| reg.get("server"))
        .and_then(Value::as_object);

    let transport = server
        .and_then(|server| text(server.get("transport")))
        .and_then(|declared| canonical_transport(&declared).map(str::to_string))
        .or_else(|| {
            server
                .and_then(|server| text(server.get("url")))
                .or_else(|| text(object.get("url")))
                .and_then(|url| infer_transport(&url))
        });

    let mut tools = Vec::new();
    if let Some(tool) = registration.and_then(|reg| reg.get("tool")) {
        collect_labels(tool, &mut tools);
    }
    collect_labels_from(object.get("tools"), &mut tools);

    let mut resources = Vec::new();
    collect_labels_from(registration.and_then(|reg| reg.get("resources")), &mut resources);
    collect_labels_from(object.get("resources"), &mut resources);

    let name = text(object.get("name"))
        .or_else(|| server.and_then(|server| text(server.get("name"))))
        .unwrap_or_else(|| slug_segment(&origin.repo));
    let description = text(object.get("description"))
        .or_else(|| server.and_then(|server| text(server.get("description"))));

    ManifestContent {
        name,
        version: text(object.get("version")).unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        title: text(object.get("title")),
        description,
        transport,
        tools: sorted_unique(tools),
        resources: sorted_unique(resources),
        provenance: origin.provenance(),
    }
}

/// Transport implied by an endpoint URL, when the URL makes it obvious.
pub fn infer_transport(url: &str) -> Option<String> {
    let lowered = url.trim().to_ascii_lowercase();
    if lowered.starts_with("ws://") || lowered.starts_with("wss://") {
        return Some("WS".to_string());
    }
    let path = lowered
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    if path.ends_with("/sse") || path.ends_with("/messages") {
        return Some("SSE".to_string());
    }
    None
}

fn collect_labels_from(value: Option<&Value>, out: &mut Vec<String>) {
    if let Some(value) = value {
        match value {
            Value::Array(items) => items.iter().for_each(|item| collect_labels(item, out)),
            other => collect_labels(other, out),
        }
    }
}

/// A tool or resource is labelled by its `id`, else its `name`, else itself
/// when it is a bare string.
fn collect_labels(value: &Value, out: &mut Vec<String>) {
    let label = match value {
        Value::String(_) => text(Some(value)),
        Value::Object(entry) => text(entry.get("id")).or_else(|| text(entry.get("name"))),
        Value::Array(items) => {
            items.iter().for_each(|item| collect_labels(item, out));
            None
        }
        _ => None,
    };
    out.extend(label);
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn array(value: Option<&Value>) -> Vec<&Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn sorted_unique(items: Vec<String>) -> Vec<String> {
    items.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Reject any id claimed by more than one origin, and any catalog path
/// claimed by more than one id, counting paths already held by `prior`.
pub fn check_collisions<'a>(
    origins: impl IntoIterator<Item = &'a Origin>,
    prior: &Snapshot,
) -> Result<(), CollisionError> {
    let mut by_id: BTreeMap<CanonicalId, BTreeSet<String>> = BTreeMap::new();
    let mut by_path: BTreeMap<CatalogPath, BTreeSet<CanonicalId>> = BTreeMap::new();
    let mut claims = 0usize;

    for origin in origins {
        let id = origin.canonical_id();
        claims += 1;
        let locators = by_id.entry(id.clone()).or_default();
        if !locators.insert(origin.locator.clone()) {
            // Same locator listed twice still names two candidates.
            locators.insert(format!("{} (#{claims})", origin.locator));
        }
        let path = prior
            .get(&id)
            .map(|stored| stored.path.clone())
            .unwrap_or_else(|| origin.catalog_path());
        by_path.entry(path).or_default().insert(id);
    }
    for stored in prior.iter() {
        by_path
            .entry(stored.path.clone())
            .or_default()
            .insert(stored.record.id.clone());
    }

    let mut collisions: Vec<Collision> = by_id
        .into_iter()
        .filter(|(_, locators)| locators.len() > 1)
        .map(|(id, locators)| Collision {
            key: id.to_string(),
            claimants: locators.into_iter().collect(),
        })
        .collect();
    collisions.extend(
        by_path
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(path, ids)| Collision {
                key: path.to_string(),
                claimants: ids.into_iter().map(|id| id.to_string()).collect(),
            }),
    );

    if collisions.is_empty() {
        Ok(())
    } else {
        Err(CollisionError { collisions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    fn origin(source: SourceKind, owner: &str, repo: &str, subpath: &str) -> Origin {
        Origin {
            owner: owner.to_string(),
            repo: repo.to_string(),
            subpath: subpath.to_string(),
            discovery_path: format!("{subpath}/manifest.json"),
            locator: format!("fixture://{owner}/{repo}/{subpath}"),
            source,
            source_url: format!("https://github.com/{owner}/{repo}"),
            git_ref: None,
        }
    }

    fn candidate(origin: Origin, descriptor: Value) -> SourceCandidate {
        SourceCandidate {
            origin,
            descriptor: serde_json::to_vec(&descriptor).unwrap(),
            discovered_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn repository_descriptor_is_normalized() {
        let c = candidate(
            origin(SourceKind::Repository, "acme", "tools", "servers/weather"),
            json!({
                "name": "Weather",
                "version": "1.4.0",
                "description": "  forecasts ",
                "mcp_registration": {
                    "tool": {"id": "forecast", "name": "Forecast"},
                    "resources": [{"name": "cities"}, {"id": "alerts"}],
                    "server": {"url": "https://weather.example.com/sse/"}
                },
                "tools": ["forecast", {"name": "radar"}]
            }),
        );
        let record = normalize_candidate(&c).unwrap();
        assert_eq!(record.id.as_str(), "mcp.acme.tools.servers__weather");
        assert_eq!(record.content.description.as_deref(), Some("forecasts"));
        assert_eq!(record.content.transport.as_deref(), Some("SSE"));
        assert_eq!(record.content.tools, vec!["forecast", "radar"]);
        assert_eq!(record.content.resources, vec!["alerts", "cities"]);
        assert!(record.fingerprint.starts_with("sha256:"));
        assert_eq!(record.fingerprint.len(), "sha256:".len() + 64);
    }

    #[test]
    fn missing_fields_get_defaults() {
        let c = candidate(origin(SourceKind::Repository, "acme", "My Tools", ""), json!({}));
        let record = normalize_candidate(&c).unwrap();
        assert_eq!(record.content.name, "my-tools");
        assert_eq!(record.content.version, "0.0.0");
        assert_eq!(record.content.transport, None);
    }

    #[test]
    fn registry_entry_is_normalized() {
        let c = candidate(
            origin(SourceKind::Registry, "io.github.acme", "weather", ""),
            json!({
                "server": {
                    "name": "io.github.acme/weather",
                    "version": "2.0.0",
                    "packages": [
                        {"registryType": "npm", "identifier": "@acme/weather"},
                        {"registryType": "npm", "identifier": "@acme/weather"}
                    ],
                    "remotes": [{"type": "streamable-http", "url": "https://x"}]
                }
            }),
        );
        let record = normalize_candidate(&c).unwrap();
        assert_eq!(record.content.name, "io.github.acme/weather");
        assert_eq!(record.content.transport.as_deref(), Some("SSE"));
        assert_eq!(record.content.resources, vec!["npm:@acme/weather"]);
        assert!(record.content.tools.is_empty());
    }

    #[test]
    fn package_only_registry_entry_is_stdio() {
        let c = candidate(
            origin(SourceKind::Registry, "acme", "cli", ""),
            json!({"name": "acme/cli", "packages": [{"identifier": "acme-cli"}]}),
        );
        let record = normalize_candidate(&c).unwrap();
        assert_eq!(record.content.transport.as_deref(), Some("STDIO"));
        assert_eq!(record.content.resources, vec!["acme-cli"]);
    }

    #[test]
    fn non_object_descriptor_is_rejected() {
        let c = candidate(origin(SourceKind::Repository, "a", "b", ""), json!([1, 2]));
        let err = normalize_candidate(&c).unwrap_err();
        assert!(matches!(err.kind, FetchErrorKind::InvalidDescriptor { .. }));

        let mut garbage = candidate(origin(SourceKind::Repository, "a", "b", ""), json!({}));
        garbage.descriptor = b"not json".to_vec();
        let batch = normalize_all(vec![garbage]);
        assert!(batch.records.is_empty());
        assert_eq!(batch.rejected.len(), 1);
    }

    #[test]
    fn fingerprint_ignores_list_order() {
        let a = candidate(
            origin(SourceKind::Repository, "a", "b", ""),
            json!({"tools": ["x", "y"]}),
        );
        let b = candidate(
            origin(SourceKind::Repository, "a", "b", ""),
            json!({"tools": ["y", "x", "x"]}),
        );
        assert_eq!(
            normalize_candidate(&a).unwrap().fingerprint,
            normalize_candidate(&b).unwrap().fingerprint
        );
    }

    #[test]
    fn declared_transports_are_canonicalized() {
        assert_eq!(canonical_transport("streamable-http"), Some("SSE"));
        assert_eq!(canonical_transport("websocket"), Some("WS"));
        assert_eq!(canonical_transport("stdio"), Some("STDIO"));
        assert_eq!(canonical_transport("carrier-pigeon"), None);
    }

    #[test]
    fn transport_inference() {
        assert_eq!(infer_transport("wss://x/ws").as_deref(), Some("WS"));
        assert_eq!(infer_transport("https://x/messages?session=1").as_deref(), Some("SSE"));
        assert_eq!(infer_transport("https://x/api"), None);
    }

    #[test]
    fn duplicate_ids_collide() {
        let a = origin(SourceKind::Repository, "Acme", "Tools", "x");
        let b = origin(SourceKind::Repository, "acme", "tools", "X");
        let err = check_collisions([&a, &b], &Snapshot::new()).unwrap_err();
        assert_eq!(err.keys(), vec!["mcp.acme.tools.x"]);
        assert_eq!(err.collisions[0].claimants.len(), 2);
    }

    #[test]
    fn distinct_ids_sharing_a_path_collide() {
        let a = origin(SourceKind::Repository, "a-b", "c", "");
        let b = origin(SourceKind::Repository, "a", "b-c", "");
        assert_ne!(a.canonical_id(), b.canonical_id());
        let err = check_collisions([&a, &b], &Snapshot::new()).unwrap_err();
        assert_eq!(err.keys(), vec!["a-b-c/root/manifest.json"]);
    }

    #[test]
    fn unique_origins_pass() {
        let a = origin(SourceKind::Repository, "acme", "tools", "a");
        let b = origin(SourceKind::Repository, "acme", "tools", "b");
        assert!(check_collisions([&a, &b], &Snapshot::new()).is_ok());
    }
}
