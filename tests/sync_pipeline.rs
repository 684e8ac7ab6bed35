// End-to-end sync runs against an in-memory upstream and a temp catalog root.
mod support;

use anyhow::Result;
use catalogsync::error::{FetchErrorKind, SyncError};
use catalogsync::{ManifestSchema, load_snapshot, run_sync, validate_catalog};
use std::fs;
use tempfile::TempDir;

use support::{
    FixtureUpstream, config_for, day, descriptor, index_ids, manifest_at, read_tree, status_of,
};

#[test]
fn first_run_creates_records_and_index() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let upstream = FixtureUpstream::new()
        .with("", descriptor("gateway", "2.0.0"))
        .with("servers/weather", descriptor("weather", "1.0.0"))
        .with("servers/search", descriptor("search", "0.3.1"));

    let outcome = run_sync(&config_for(&root), &upstream, day(0))?;
    assert_eq!(outcome.counts.discovered, 3);
    assert_eq!(outcome.counts.created, 3);
    assert_eq!(outcome.counts.index_entries, 3);
    assert!(outcome.fetch_errors.is_empty());

    assert_eq!(
        index_ids(&root)?,
        vec![
            "mcp.acme.servers.root",
            "mcp.acme.servers.servers__search",
            "mcp.acme.servers.servers__weather",
        ]
    );
    let weather = manifest_at(&root, "servers__weather")?;
    assert_eq!(weather["id"], "mcp.acme.servers.servers__weather");
    assert_eq!(weather["transport"], "STDIO");
    assert_eq!(weather["tools"][0], "weather.query");
    assert_eq!(weather["lifecycle"]["first_seen"], "2024-05-01T12:00:00Z");

    let schema = ManifestSchema::load(&support::bundled_schema())?;
    let report = validate_catalog(&root, Some(&schema));
    assert!(report.passed(), "{report:?}");
    assert_eq!(report.manifests, 3);
    Ok(())
}

#[test]
fn identical_rerun_is_byte_identical() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let upstream = FixtureUpstream::numbered(12);
    let config = config_for(&root);

    run_sync(&config, &upstream, day(0))?;
    let first = read_tree(&root)?;
    let outcome = run_sync(&config, &upstream, day(0))?;
    let second = read_tree(&root)?;

    assert_eq!(outcome.counts.unchanged, 12);
    assert_eq!(outcome.counts.created, 0);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn concurrency_does_not_change_output() -> Result<()> {
    let temp = TempDir::new()?;
    let serial_root = temp.path().join("serial");
    let parallel_root = temp.path().join("parallel");
    let upstream = FixtureUpstream::numbered(20);

    let mut serial = config_for(&serial_root);
    serial.concurrency = 1;
    let mut parallel = config_for(&parallel_root);
    parallel.concurrency = 8;
    run_sync(&serial, &upstream, day(0))?;
    run_sync(&parallel, &upstream, day(0))?;

    assert_eq!(read_tree(&serial_root)?, read_tree(&parallel_root)?);
    Ok(())
}

#[test]
fn absent_servers_are_deprecated_never_deleted() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);

    let full = FixtureUpstream::numbered(66);
    run_sync(&config, &full, day(0))?;

    let shrunk = FixtureUpstream::numbered(66)
        .without("servers/server-010")
        .without("servers/server-042");
    let outcome = run_sync(&config, &shrunk, day(1))?;

    assert_eq!(outcome.counts.deprecated, 2);
    assert_eq!(outcome.counts.unchanged, 64);
    assert_eq!(outcome.counts.total_records, 66);
    assert_eq!(outcome.counts.active_records, 64);
    assert_eq!(outcome.counts.index_entries, 64);

    let ids = index_ids(&root)?;
    assert_eq!(ids.len(), 64);
    assert!(!ids.contains(&"mcp.acme.servers.servers__server-010".to_string()));

    let gone = manifest_at(&root, "servers__server-010")?;
    assert_eq!(gone["lifecycle"]["status"], "deprecated");
    assert_eq!(gone["lifecycle"]["deprecated_at"], "2024-05-02T12:00:00Z");
    assert_eq!(gone["lifecycle"]["last_seen"], "2024-05-01T12:00:00Z");

    // A further run keeps them deprecated without restamping.
    let outcome = run_sync(&config, &shrunk, day(2))?;
    assert_eq!(outcome.counts.still_deprecated, 2);
    let gone = manifest_at(&root, "servers__server-010")?;
    assert_eq!(gone["lifecycle"]["deprecated_at"], "2024-05-02T12:00:00Z");
    assert_eq!(load_snapshot(&root)?.len(), 66);
    Ok(())
}

#[test]
fn returning_server_is_reactivated_with_history_kept() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);
    let full = FixtureUpstream::numbered(3);

    run_sync(&config, &full, day(0))?;
    run_sync(&config, &FixtureUpstream::numbered(3).without("servers/server-001"), day(1))?;
    assert_eq!(status_of(&root, "servers__server-001")?, "deprecated");

    let outcome = run_sync(&config, &full, day(2))?;
    assert_eq!(outcome.counts.reactivated, 1);
    let back = manifest_at(&root, "servers__server-001")?;
    assert_eq!(back["lifecycle"]["status"], "active");
    assert_eq!(back["lifecycle"]["first_seen"], "2024-05-01T12:00:00Z");
    assert_eq!(back["lifecycle"]["last_seen"], "2024-05-03T12:00:00Z");
    assert_eq!(back["lifecycle"]["reactivated_at"], "2024-05-03T12:00:00Z");
    assert!(back["lifecycle"].get("deprecated_at").is_none());
    assert_eq!(index_ids(&root)?.len(), 3);
    Ok(())
}

#[test]
fn changed_content_updates_fingerprint_and_keeps_first_seen() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);

    run_sync(&config, &FixtureUpstream::new().with("a", descriptor("a", "1.0.0")), day(0))?;
    let before = manifest_at(&root, "a")?;
    let outcome = run_sync(
        &config,
        &FixtureUpstream::new().with("a", descriptor("a", "1.1.0")),
        day(1),
    )?;

    assert_eq!(outcome.counts.updated, 1);
    let after = manifest_at(&root, "a")?;
    assert_ne!(before["fingerprint"], after["fingerprint"]);
    assert_eq!(after["version"], "1.1.0");
    assert_eq!(after["lifecycle"]["first_seen"], before["lifecycle"]["first_seen"]);
    assert_eq!(after["lifecycle"]["last_seen"], "2024-05-02T12:00:00Z");
    Ok(())
}

#[test]
fn fetch_failure_carries_prior_record_forward() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);

    run_sync(&config, &FixtureUpstream::numbered(3), day(0))?;
    let flaky = FixtureUpstream::numbered(3).failing(
        "servers/server-002",
        FetchErrorKind::Timeout { timeout_ms: 30_000 },
    );
    let outcome = run_sync(&config, &flaky, day(1))?;

    assert_eq!(outcome.counts.fetch_errors, 1);
    assert_eq!(outcome.counts.carried, 1);
    assert_eq!(outcome.counts.deprecated, 0);
    assert_eq!(
        outcome.fetch_errors[0].kind,
        FetchErrorKind::Timeout { timeout_ms: 30_000 }
    );

    let carried = manifest_at(&root, "servers__server-002")?;
    assert_eq!(carried["lifecycle"]["status"], "active");
    assert_eq!(carried["lifecycle"]["last_seen"], "2024-05-01T12:00:00Z");
    assert_eq!(index_ids(&root)?.len(), 3);
    Ok(())
}

#[test]
fn malformed_descriptor_is_recorded_not_fatal() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let upstream = FixtureUpstream::numbered(2)
        .with_raw("broken", "[1, 2, 3]")
        .with_raw("truncated", "{\"name\": ");

    let outcome = run_sync(&config_for(&root), &upstream, day(0))?;
    assert_eq!(outcome.counts.created, 2);
    assert_eq!(outcome.counts.fetch_errors, 2);
    assert!(
        outcome
            .fetch_errors
            .iter()
            .all(|err| matches!(err.kind, FetchErrorKind::InvalidDescriptor { .. }))
    );
    assert!(!root.join("acme-servers/broken").exists());
    Ok(())
}

#[test]
fn identity_collision_aborts_and_leaves_catalog_untouched() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);
    run_sync(&config, &FixtureUpstream::numbered(2), day(0))?;
    let before = read_tree(&root)?;

    let clashing = FixtureUpstream::numbered(2)
        .with("Tools/Weather", descriptor("weather", "1.0.0"))
        .with("tools/weather", descriptor("weather-fork", "1.0.0"));
    let err = run_sync(&config, &clashing, day(1)).unwrap_err();
    match err {
        SyncError::IdentityCollision(collision) => {
            assert_eq!(collision.keys(), vec!["mcp.acme.servers.tools__weather"]);
            assert_eq!(collision.collisions[0].claimants.len(), 2);
        }
        other => panic!("expected identity collision, got {other}"),
    }
    assert_eq!(read_tree(&root)?, before);
    Ok(())
}

#[test]
fn empty_harvest_aborts_unless_allowed() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let mut config = config_for(&root);
    run_sync(&config, &FixtureUpstream::numbered(4), day(0))?;
    let before = read_tree(&root)?;

    let err = run_sync(&config, &FixtureUpstream::new(), day(1)).unwrap_err();
    assert!(matches!(err, SyncError::EmptyHarvest { .. }));
    assert_eq!(read_tree(&root)?, before);

    config.allow_empty_harvest = true;
    let outcome = run_sync(&config, &FixtureUpstream::new(), day(1))?;
    assert_eq!(outcome.counts.deprecated, 4);
    assert_eq!(outcome.counts.total_records, 4);
    assert!(index_ids(&root)?.is_empty());
    Ok(())
}

#[test]
fn discovery_failure_aborts_the_run() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);
    run_sync(&config, &FixtureUpstream::numbered(2), day(0))?;
    let before = read_tree(&root)?;

    let err = run_sync(&config, &FixtureUpstream::numbered(2).discovery_fails(), day(1))
        .unwrap_err();
    assert!(matches!(err, SyncError::Discovery { .. }));
    assert_eq!(read_tree(&root)?, before);
    Ok(())
}

#[test]
fn limit_defers_candidates_without_deprecating_them() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let mut config = config_for(&root);
    run_sync(&config, &FixtureUpstream::numbered(5), day(0))?;

    config.limit = Some(2);
    let outcome = run_sync(&config, &FixtureUpstream::numbered(5), day(1))?;
    assert_eq!(outcome.counts.limited_out, 3);
    assert_eq!(outcome.counts.fetched, 2);
    assert_eq!(outcome.counts.carried, 3);
    assert_eq!(outcome.counts.deprecated, 0);
    assert_eq!(index_ids(&root)?.len(), 5);
    Ok(())
}

#[test]
fn ignored_segments_never_become_records() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let upstream = FixtureUpstream::numbered(1)
        .with("node_modules/left-pad", descriptor("left-pad", "1.0.0"))
        .with("examples/build/demo", descriptor("demo", "1.0.0"));

    let outcome = run_sync(&config_for(&root), &upstream, day(0))?;
    assert_eq!(outcome.counts.discovered, 3);
    assert_eq!(outcome.counts.ignored, 2);
    assert_eq!(outcome.counts.created, 1);
    assert_eq!(index_ids(&root)?, vec!["mcp.acme.servers.servers__server-000"]);
    Ok(())
}

#[test]
fn dotfiles_in_root_survive_later_runs() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);
    run_sync(&config, &FixtureUpstream::numbered(3), day(0))?;

    fs::write(root.join(".gitattributes"), "*.json text eol=lf\n")?;
    fs::create_dir_all(root.join(".github"))?;
    fs::write(root.join(".github/CODEOWNERS"), "* @acme/catalog\n")?;
    fs::write(root.join("acme-servers/.keep"), "")?;

    let shrunk = FixtureUpstream::numbered(3).without("servers/server-001");
    let outcome = run_sync(&config, &shrunk, day(1))?;
    assert_eq!(outcome.counts.deprecated, 1);

    assert_eq!(
        fs::read_to_string(root.join(".gitattributes"))?,
        "*.json text eol=lf\n"
    );
    assert_eq!(
        fs::read_to_string(root.join(".github/CODEOWNERS"))?,
        "* @acme/catalog\n"
    );
    assert!(root.join("acme-servers/.keep").is_file());

    let report = validate_catalog(&root, None);
    assert!(report.passed(), "{report:?}");
    Ok(())
}

#[test]
fn unmanaged_entry_in_root_aborts_before_staging() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("catalog");
    let config = config_for(&root);
    run_sync(&config, &FixtureUpstream::numbered(1), day(0))?;
    fs::write(root.join("NOTES.txt"), "hand-written\n")?;

    let err = run_sync(&config, &FixtureUpstream::numbered(1), day(1)).unwrap_err();
    assert!(matches!(err, SyncError::Snapshot { .. }));
    assert!(root.join("NOTES.txt").exists());
    Ok(())
}

#[test]
fn missing_source_or_root_is_a_config_error() {
    let mut config = config_for(std::path::Path::new("unused"));
    config.output_root = None;
    let err = run_sync(&config, &FixtureUpstream::numbered(1), day(0)).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}
