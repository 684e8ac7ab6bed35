//! The sync pipeline: harvest, normalize, merge, index, validate, commit.
//!
//! Every phase before the commit works in memory or in a private staging
//! directory, so any error before [`StagedCatalog::commit`] leaves the live
//! catalog exactly as the previous run committed it.
//!
//! [`StagedCatalog::commit`]: crate::catalog::StagedCatalog::commit

use crate::catalog::{
    CatalogIndex, Status, load_snapshot, recover_interrupted, run_timestamp, stage_catalog,
};
use crate::config::{SourceRef, SyncConfig};
use crate::error::{FetchError, SyncError, SyncResult};
use crate::harvest::{
    self, HarvestOptions, HttpClient, IgnoreSet, RegistryUpstream, RepositoryRef,
    RepositoryUpstream, RetryPolicy, Upstream,
};
use crate::lifecycle::{MergeSummary, merge};
use crate::normalize::{check_collisions, normalize_all};
use crate::observability::sync_span;
use crate::validate::{ManifestSchema, validate_catalog};
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub discovered: usize,
    pub ignored: usize,
    pub limited_out: usize,
    pub fetched: usize,
    pub fetch_errors: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub reactivated: usize,
    pub deprecated: usize,
    pub carried: usize,
    pub still_deprecated: usize,
    pub total_records: usize,
    pub active_records: usize,
    pub index_entries: usize,
}

/// Run summary for operators and calling workflows.
#[derive(Clone, Debug, Serialize)]
pub struct SyncOutcome {
    pub source: String,
    pub output_root: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub counts: SyncCounts,
    /// Per-candidate failures, sorted by locator.
    pub fetch_errors: Vec<FetchError>,
}

/// Build the upstream named by `config.source`.
///
/// `agent` and `headers` come from the caller and carry whatever
/// authentication the upstream needs; they are forwarded untouched.
pub fn upstream_for(
    config: &SyncConfig,
    agent: ureq::Agent,
    headers: Vec<(String, String)>,
) -> SyncResult<Box<dyn Upstream>> {
    let (source, _) = config.validate()?;
    let client = HttpClient::new(agent, Duration::from_secs(config.fetch_timeout_secs))
        .with_headers(headers)
        .with_retry(retry_policy(config))
        .with_max_bytes(config.max_descriptor_bytes);

    Ok(match source {
        SourceRef::Registry { base_url } => {
            Box::new(RegistryUpstream::new(base_url, client, config.page_size))
        }
        SourceRef::Repository {
            owner,
            repo,
            git_ref,
        } => {
            let target = RepositoryRef {
                owner: owner.clone(),
                repo: repo.clone(),
                git_ref: git_ref.clone(),
            };
            let mut upstream =
                RepositoryUpstream::new(target, client, config.descriptor_names.clone());
            if config.github_api_base.is_some() || config.github_raw_base.is_some() {
                upstream = upstream.with_bases(
                    config
                        .github_api_base
                        .as_deref()
                        .unwrap_or(harvest::repository::DEFAULT_API_BASE),
                    config
                        .github_raw_base
                        .as_deref()
                        .unwrap_or(harvest::repository::DEFAULT_RAW_BASE),
                );
            }
            Box::new(upstream)
        }
    })
}

/// Backoff for upstream requests; the cap stays at the client default.
fn retry_policy(config: &SyncConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.max_retries,
        base_delay: Duration::from_millis(config.retry_base_ms),
        ..RetryPolicy::default()
    }
}

/// Run one sync against `upstream`, stamping the run with `observed_at`.
///
/// The same upstream content and the same `observed_at` always produce a
/// byte-identical catalog tree and index.
pub fn run_sync(
    config: &SyncConfig,
    upstream: &dyn Upstream,
    observed_at: OffsetDateTime,
) -> SyncResult<SyncOutcome> {
    let (_, root) = config.validate()?;
    let now = run_timestamp(observed_at);
    let source = upstream.describe();
    let span = sync_span(&source, &root.display().to_string());
    let _guard = span.enter();

    let schema = config
        .schema_path
        .as_deref()
        .map(ManifestSchema::load)
        .transpose()
        .map_err(|err| SyncError::Config(format!("{err:#}")))?;
    let options = HarvestOptions {
        concurrency: config.concurrency,
        limit: config.limit,
        ignore: IgnoreSet::new(config.ignore_segments.as_slice())?,
        max_descriptor_bytes: config.max_descriptor_bytes,
    };

    if recover_interrupted(root)? {
        info!("previous commit was interrupted; restored last committed catalog");
    }
    let prior = load_snapshot(root)?;

    let report = harvest::harvest(upstream, &options, now)?;
    if report.considered() == 0 && !config.allow_empty_harvest {
        return Err(SyncError::EmptyHarvest {
            source_ref: source,
        });
    }
    check_collisions(report.origins(), &prior)?;

    let mut unresolved = report.unresolved_ids();
    let mut failures = report.failures;
    let normalized = normalize_all(report.candidates);
    unresolved.extend(
        normalized
            .rejected
            .iter()
            .map(|failure| failure.origin.canonical_id()),
    );
    failures.extend(normalized.rejected);
    let fetched = normalized.records.len();

    let merged = merge(&prior, normalized.records, &unresolved, now)?;
    let index = CatalogIndex::build(&merged.snapshot, &source, now)?;

    let staged = stage_catalog(root, &merged.snapshot, &index)?;
    validate_catalog(staged.path(), schema.as_ref()).into_result()?;
    let commit = staged.commit()?;

    let mut fetch_errors: Vec<FetchError> =
        failures.into_iter().map(|failure| failure.error).collect();
    fetch_errors.sort_by(|a, b| a.locator.cmp(&b.locator));

    let MergeSummary {
        created,
        updated,
        unchanged,
        reactivated,
        deprecated,
        carried,
        still_deprecated,
    } = merged.summary;
    let counts = SyncCounts {
        discovered: report.discovered,
        ignored: report.ignored,
        limited_out: report.deferred.len(),
        fetched,
        fetch_errors: fetch_errors.len(),
        created,
        updated,
        unchanged,
        reactivated,
        deprecated,
        carried,
        still_deprecated,
        total_records: merged.snapshot.len(),
        active_records: merged.snapshot.count(Status::Active),
        index_entries: index.entries.len(),
    };
    info!(
        created,
        updated,
        deprecated,
        reactivated,
        fetch_errors = counts.fetch_errors,
        manifests = commit.manifests_written,
        "sync committed"
    );

    Ok(SyncOutcome {
        source,
        output_root: commit.root.display().to_string(),
        observed_at: now,
        counts,
        fetch_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_retries_keep_default_cap() {
        let config = SyncConfig {
            max_retries: 5,
            retry_base_ms: 250,
            ..SyncConfig::default()
        };
        let policy = retry_policy(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }
}
