//! Three-way lifecycle merge.
//!
//! `merge` is the only code that changes a record's status. It takes the
//! prior snapshot and this run's normalized candidates and returns a brand
//! new snapshot; neither input is mutated. Every id present in either input
//! ends up in the output.

use crate::catalog::{
    CanonicalId, Lifecycle, MANIFEST_KIND, MANIFEST_SCHEMA_VERSION, ManifestRecord, Snapshot,
    Status, StoredRecord,
};
use crate::error::{Collision, CollisionError};
use crate::normalize::NormalizedCandidate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub reactivated: usize,
    pub deprecated: usize,
    /// Prior records listed upstream but not fetched; kept as they were.
    pub carried: usize,
    pub still_deprecated: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Created,
    Updated,
    Unchanged,
    Reactivated,
    Deprecated,
    Carried,
    StillDeprecated,
}

#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub snapshot: Snapshot,
    pub summary: MergeSummary,
    pub transitions: BTreeMap<CanonicalId, Transition>,
}

/// Merge `observed` into `prior` at time `now`.
///
/// Ids in `unresolved` were listed upstream but their descriptor could not
/// be read this run; their prior records are carried forward untouched
/// instead of being deprecated.
pub fn merge(
    prior: &Snapshot,
    observed: Vec<NormalizedCandidate>,
    unresolved: &BTreeSet<CanonicalId>,
    now: OffsetDateTime,
) -> Result<MergeOutcome, CollisionError> {
    let mut incoming: BTreeMap<CanonicalId, NormalizedCandidate> = BTreeMap::new();
    let mut duplicates: BTreeMap<CanonicalId, Vec<String>> = BTreeMap::new();
    for candidate in observed {
        let id = candidate.id.clone();
        if let Some(existing) = incoming.get(&id) {
            duplicates
                .entry(id)
                .or_insert_with(|| vec![existing.locator.clone()])
                .push(candidate.locator);
            continue;
        }
        incoming.insert(id, candidate);
    }
    if !duplicates.is_empty() {
        return Err(CollisionError {
            collisions: duplicates
                .into_iter()
                .map(|(id, claimants)| Collision {
                    key: id.to_string(),
                    claimants,
                })
                .collect(),
        });
    }

    let mut next = Snapshot::new();
    let mut summary = MergeSummary::default();
    let mut transitions = BTreeMap::new();

    for stored in prior.iter() {
        let id = &stored.record.id;
        let (record, transition) = match incoming.remove(id) {
            Some(candidate) => observe(&stored.record, candidate, now),
            None => absent(&stored.record, unresolved.contains(id), now),
        };
        next.insert(StoredRecord {
            path: stored.path.clone(),
            record,
        });
        transitions.insert(id.clone(), transition);
    }

    for (id, candidate) in incoming {
        let path = candidate.path.clone();
        next.insert(StoredRecord {
            path,
            record: create(candidate, now),
        });
        transitions.insert(id, Transition::Created);
    }

    for (id, transition) in &transitions {
        match transition {
            Transition::Created => summary.created += 1,
            Transition::Updated => summary.updated += 1,
            Transition::Unchanged => summary.unchanged += 1,
            Transition::Reactivated => summary.reactivated += 1,
            Transition::Deprecated => summary.deprecated += 1,
            Transition::Carried => summary.carried += 1,
            Transition::StillDeprecated => summary.still_deprecated += 1,
        }
        if !matches!(transition, Transition::Unchanged | Transition::StillDeprecated) {
            debug!(id = %id, ?transition, "lifecycle transition");
        }
    }

    Ok(MergeOutcome {
        snapshot: next,
        summary,
        transitions,
    })
}

fn create(candidate: NormalizedCandidate, now: OffsetDateTime) -> ManifestRecord {
    ManifestRecord {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        kind: MANIFEST_KIND.to_string(),
        id: candidate.id,
        content: candidate.content,
        fingerprint: candidate.fingerprint,
        lifecycle: Lifecycle {
            status: Status::Active,
            first_seen: now,
            last_seen: now,
            deprecated_at: None,
            reactivated_at: None,
        },
    }
}

fn observe(
    prior: &ManifestRecord,
    candidate: NormalizedCandidate,
    now: OffsetDateTime,
) -> (ManifestRecord, Transition) {
    let mut record = prior.clone();
    let changed = record.fingerprint != candidate.fingerprint;
    if changed {
        record.content = candidate.content;
        record.fingerprint = candidate.fingerprint;
    }
    record.lifecycle.last_seen = now;

    let transition = match prior.status() {
        Status::Deprecated => {
            record.lifecycle.status = Status::Active;
            record.lifecycle.deprecated_at = None;
            record.lifecycle.reactivated_at = Some(now);
            Transition::Reactivated
        }
        Status::Active if changed => Transition::Updated,
        Status::Active => Transition::Unchanged,
    };
    (record, transition)
}

fn absent(prior: &ManifestRecord, unresolved: bool, now: OffsetDateTime) -> (ManifestRecord, Transition) {
    let mut record = prior.clone();
    let transition = match (prior.status(), unresolved) {
        (Status::Deprecated, _) => Transition::StillDeprecated,
        (Status::Active, true) => Transition::Carried,
        (Status::Active, false) => {
            record.lifecycle.status = Status::Deprecated;
            record.lifecycle.deprecated_at.get_or_insert(now);
            Transition::Deprecated
        }
    };
    (record, transition)
}
