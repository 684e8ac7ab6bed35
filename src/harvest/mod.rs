//! Candidate discovery and descriptor fetching.
//!
//! An [`Upstream`] lists origins and fetches raw descriptor bytes. [`harvest`]
//! drives one upstream: discover, drop ignored paths, apply the limit, then
//! fetch the rest on a bounded pool. Nothing here touches the disk.

pub mod http;
pub mod ignore;
pub mod pool;
pub mod registry;
pub mod repository;

pub use http::{HttpClient, RetryPolicy, parse_header};
pub use ignore::{DEFAULT_IGNORE_SEGMENTS, IgnoreSet};
pub use registry::RegistryUpstream;
pub use repository::{RepositoryRef, RepositoryUpstream};

use crate::catalog::{CanonicalId, CatalogPath, Provenance, SourceKind, canonical_id, catalog_path};
use crate::error::{FetchError, FetchErrorKind, SyncResult};
use std::collections::BTreeSet;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Where one candidate comes from, known before its descriptor is fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub owner: String,
    pub repo: String,
    /// Directory of the descriptor relative to the repository root; empty for
    /// root and for registry entries.
    pub subpath: String,
    /// Path evaluated by the ignore set.
    pub discovery_path: String,
    /// Address the descriptor is fetched from.
    pub locator: String,
    pub source: SourceKind,
    pub source_url: String,
    pub git_ref: Option<String>,
}

impl Origin {
    pub fn canonical_id(&self) -> CanonicalId {
        canonical_id(&self.owner, &self.repo, &self.subpath)
    }

    pub fn catalog_path(&self) -> CatalogPath {
        catalog_path(&self.owner, &self.repo, &self.subpath)
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            source: self.source,
            source_url: self.source_url.clone(),
            git_ref: self.git_ref.clone(),
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            subpath: self.subpath.clone(),
        }
    }

    fn sort_key(&self) -> (CanonicalId, String) {
        (self.canonical_id(), self.locator.clone())
    }
}

/// A discovered origin together with its fetched descriptor.
#[derive(Clone, Debug)]
pub struct SourceCandidate {
    pub origin: Origin,
    pub descriptor: Vec<u8>,
    pub discovered_at: OffsetDateTime,
}

/// A source of candidates.
///
/// `discover` failing is fatal for the run: without a complete listing the
/// engine cannot tell an absent server from an unknown one. `fetch` failing
/// only loses that one candidate.
pub trait Upstream: Sync {
    /// Source reference recorded in the index and logs.
    fn describe(&self) -> String;

    fn discover(&self) -> SyncResult<Vec<Origin>>;

    fn fetch(&self, origin: &Origin) -> Result<Vec<u8>, FetchError>;
}

#[derive(Clone, Debug)]
pub struct HarvestOptions {
    pub concurrency: usize,
    pub limit: Option<usize>,
    pub ignore: IgnoreSet,
    pub max_descriptor_bytes: usize,
}

/// A candidate whose descriptor could not be fetched.
#[derive(Clone, Debug)]
pub struct CandidateFailure {
    pub origin: Origin,
    pub error: FetchError,
}

#[derive(Clone, Debug)]
pub struct HarvestReport {
    pub source: String,
    pub discovered: usize,
    pub ignored: usize,
    /// Fetched candidates, sorted by canonical id then locator.
    pub candidates: Vec<SourceCandidate>,
    pub failures: Vec<CandidateFailure>,
    /// Listed upstream but left unfetched by the candidate limit.
    pub deferred: Vec<Origin>,
}

impl HarvestReport {
    /// Every origin that survived the ignore set, fetched or not.
    pub fn origins(&self) -> impl Iterator<Item = &Origin> {
        self.candidates
            .iter()
            .map(|candidate| &candidate.origin)
            .chain(self.failures.iter().map(|failure| &failure.origin))
            .chain(self.deferred.iter())
    }

    /// Ids listed upstream whose current content is unknown this run.
    pub fn unresolved_ids(&self) -> BTreeSet<CanonicalId> {
        self.failures
            .iter()
            .map(|failure| failure.origin.canonical_id())
            .chain(self.deferred.iter().map(Origin::canonical_id))
            .collect()
    }

    /// Origins that reached discovery output after the ignore filter.
    pub fn considered(&self) -> usize {
        self.discovered - self.ignored
    }
}

/// Discover, filter and fetch every candidate from `upstream`.
pub fn harvest(
    upstream: &dyn Upstream,
    options: &HarvestOptions,
    discovered_at: OffsetDateTime,
) -> SyncResult<HarvestReport> {
    let source = upstream.describe();
    let mut origins = upstream.discover()?;
    let discovered = origins.len();
    origins.sort_by_cached_key(Origin::sort_key);

    let mut ignored = 0;
    origins.retain(|origin| match options.ignore.matching_segment(&origin.discovery_path) {
        Some(segment) => {
            debug!(path = %origin.discovery_path, segment, "ignoring candidate");
            ignored += 1;
            false
        }
        None => true,
    });

    let deferred = match options.limit {
        Some(limit) if origins.len() > limit => origins.split_off(limit),
        _ => Vec::new(),
    };
    if !deferred.is_empty() {
        info!(
            limit = options.limit.unwrap_or_default(),
            deferred = deferred.len(),
            "candidate limit reached"
        );
    }

    let max_bytes = options.max_descriptor_bytes;
    let results = pool::run_bounded(origins, options.concurrency, |origin| {
        let fetched = upstream.fetch(&origin).and_then(|bytes| {
            if bytes.len() > max_bytes {
                Err(FetchError::new(
                    origin.locator.clone(),
                    FetchErrorKind::TooLarge { limit: max_bytes },
                ))
            } else {
                Ok(bytes)
            }
        });
        (origin, fetched)
    });

    let mut candidates = Vec::new();
    let mut failures = Vec::new();
    for (origin, fetched) in results {
        match fetched {
            Ok(descriptor) => candidates.push(SourceCandidate {
                origin,
                descriptor,
                discovered_at,
            }),
            Err(error) => {
                warn!(locator = %origin.locator, error = %error.kind, "candidate fetch failed");
                failures.push(CandidateFailure { origin, error });
            }
        }
    }
    candidates.sort_by_cached_key(|candidate| candidate.origin.sort_key());
    failures.sort_by_cached_key(|failure| failure.origin.sort_key());

    info!(
        source = %source,
        discovered,
        ignored,
        fetched = candidates.len(),
        failed = failures.len(),
        deferred = deferred.len(),
        "harvest finished"
    );
    Ok(HarvestReport {
        source,
        discovered,
        ignored,
        candidates,
        failures,
        deferred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::collections::BTreeMap;

    struct Fixed {
        entries: BTreeMap<String, Result<Vec<u8>, u16>>,
    }

    impl Upstream for Fixed {
        fn describe(&self) -> String {
            "fixture".to_string()
        }

        fn discover(&self) -> SyncResult<Vec<Origin>> {
            Ok(self.entries.keys().map(|path| origin(path)).collect())
        }

        fn fetch(&self, origin: &Origin) -> Result<Vec<u8>, FetchError> {
            match &self.entries[&origin.discovery_path] {
                Ok(bytes) => Ok(bytes.clone()),
                Err(status) => Err(FetchError::new(
                    origin.locator.clone(),
                    FetchErrorKind::Status { status: *status },
                )),
            }
        }
    }

    fn origin(path: &str) -> Origin {
        let subpath = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        Origin {
            owner: "acme".to_string(),
            repo: "tools".to_string(),
            subpath: subpath.to_string(),
            discovery_path: path.to_string(),
            locator: format!("fixture://{path}"),
            source: SourceKind::Repository,
            source_url: "https://github.com/acme/tools".to_string(),
            git_ref: None,
        }
    }

    fn options(limit: Option<usize>) -> HarvestOptions {
        HarvestOptions {
            concurrency: 4,
            limit,
            ignore: IgnoreSet::defaults().unwrap(),
            max_descriptor_bytes: 64,
        }
    }

    fn fixed(entries: &[(&str, Result<&str, u16>)]) -> Fixed {
        Fixed {
            entries: entries
                .iter()
                .map(|(path, body)| (path.to_string(), body.map(|b| b.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn ignored_paths_are_never_fetched() {
        let upstream = fixed(&[
            ("a/manifest.json", Ok("{}")),
            ("node_modules/x/manifest.json", Err(500)),
        ]);
        let report = harvest(&upstream, &options(None), OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(report.discovered, 2);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.candidates.len(), 1);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn fetch_failures_are_recorded_not_fatal() {
        let upstream = fixed(&[("a/manifest.json", Ok("{}")), ("b/manifest.json", Err(404))]);
        let report = harvest(&upstream, &options(None), OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.unresolved_ids().into_iter().collect::<Vec<_>>(),
            vec![canonical_id("acme", "tools", "b")]
        );
    }

    #[test]
    fn limit_defers_the_tail_in_id_order() {
        let upstream = fixed(&[
            ("c/manifest.json", Ok("{}")),
            ("a/manifest.json", Ok("{}")),
            ("b/manifest.json", Ok("{}")),
        ]);
        let report = harvest(&upstream, &options(Some(2)), OffsetDateTime::UNIX_EPOCH).unwrap();
        let fetched: Vec<_> = report
            .candidates
            .iter()
            .map(|c| c.origin.subpath.as_str())
            .collect();
        assert_eq!(fetched, vec!["a", "b"]);
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(report.deferred[0].subpath, "c");
    }

    #[test]
    fn oversized_descriptors_fail_the_candidate() {
        let big = "x".repeat(65);
        let upstream = fixed(&[("a/manifest.json", Ok(big.as_str()))]);
        let report = harvest(&upstream, &options(None), OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(report.failures[0].error.kind, FetchErrorKind::TooLarge { limit: 64 });
    }

    #[test]
    fn discovery_failure_propagates() {
        struct Broken;
        impl Upstream for Broken {
            fn describe(&self) -> String {
                "broken".to_string()
            }
            fn discover(&self) -> SyncResult<Vec<Origin>> {
                Err(SyncError::Discovery {
                    source_ref: "broken".to_string(),
                    message: "HTTP 500".to_string(),
                })
            }
            fn fetch(&self, origin: &Origin) -> Result<Vec<u8>, FetchError> {
                Err(FetchError::new(
                    origin.locator.clone(),
                    FetchErrorKind::Status { status: 500 },
                ))
            }
        }
        let err = harvest(&Broken, &options(None), OffsetDateTime::UNIX_EPOCH).unwrap_err();
        assert!(matches!(err, SyncError::Discovery { .. }));
    }
}
